use std::fmt;

// DType — Supported element data types
//
// Every node and device buffer carries a DType that determines its element
// size and which kernel family it dispatches to:
//
//   F32  — 32-bit float, the default workhorse
//   I32  — signed 32-bit int, for indices, shapes and axis lists
//   Bool — stored as a 16-bit short on the device

/// Enum of all supported element data types.
///
/// This is stored inside every graph node and device buffer so the
/// dispatcher can pick the correct kernel entry point at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::Bool => 2,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }

    /// Kernel entry-point suffix for this dtype. Kernels come in two
    /// families only; bool buffers never reach arithmetic dispatch.
    pub fn kernel_family(&self) -> &'static str {
        match self {
            DType::F32 => "fp",
            DType::I32 | DType::Bool => "int",
        }
    }

    /// Parse an external dtype tag. Anything outside the closed set is an
    /// `UnsupportedDtype` error.
    pub fn parse(tag: &str) -> crate::Result<DType> {
        match tag {
            "fp32" | "float32" => Ok(DType::F32),
            "int32" => Ok(DType::I32),
            "bool" | "boolean" => Ok(DType::Bool),
            other => Err(crate::Error::UnsupportedDtype(other.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "fp32",
            DType::I32 => "int32",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Trait that connects Rust types to the DType enum
//
// Implemented for the three host storage types (f32, i32, i16-as-bool) so
// buffer fill and read-back code can be written generically.

/// Trait implemented by Rust types that can back a host array.
///
/// Provides the mapping between the concrete Rust type and the DType enum,
/// plus conversions to/from f64 for generic numeric code.
pub trait WithDType:
    Copy + Send + Sync + 'static + num_traits::NumCast + std::fmt::Debug + Default
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    /// The zero value.
    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    /// The one value.
    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl WithDType for i16 {
    const DTYPE: DType = DType::Bool;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        (v != 0.0) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::Bool.size_in_bytes(), 2);
    }

    #[test]
    fn test_kernel_family() {
        assert_eq!(DType::F32.kernel_family(), "fp");
        assert_eq!(DType::I32.kernel_family(), "int");
        assert_eq!(DType::Bool.kernel_family(), "int");
    }

    #[test]
    fn test_parse() {
        assert_eq!(DType::parse("fp32").unwrap(), DType::F32);
        assert_eq!(DType::parse("int32").unwrap(), DType::I32);
        assert_eq!(DType::parse("bool").unwrap(), DType::Bool);
        assert!(matches!(
            DType::parse("fp64"),
            Err(crate::Error::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_with_dtype_bool_coercion() {
        assert_eq!(i16::from_f64(2.5), 1);
        assert_eq!(i16::from_f64(0.0), 0);
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(i32::DTYPE, DType::I32);
        assert_eq!(i16::DTYPE, DType::Bool);
    }
}
