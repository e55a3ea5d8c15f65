use std::fmt;

// Shape — N-dimensional shape representation
//
// A Shape describes the size of each dimension of a tensor:
//   - Scalar: Shape([])          — 0 dimensions, 1 element
//   - Vector: Shape([5])         — 1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      — 2 dimensions, 12 elements
//
// The shape determines how many elements a buffer holds, the [M, N] global
// work size a kernel is enqueued over, and whether two operands are
// compatible for broadcasting.

/// N-dimensional shape of a tensor. Empty means scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape.
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }

    /// True when any dimension is zero. Zero-element buffers skip device
    /// allocation entirely (their host array still holds one slot).
    pub fn has_zero_dim(&self) -> bool {
        self.0.iter().any(|&d| d == 0)
    }

    /// True when this shape holds at most one element. The kernel
    /// dispatcher treats both rank-0 and single-element buffers as scalar
    /// operands.
    pub fn is_scalar_like(&self) -> bool {
        self.elem_count() == 1
    }

    /// The `[M, N]` global work size a kernel runs over for this shape.
    /// Rank-0 buffers use [1, 1]; trailing dimensions beyond the second are
    /// never dispatched (broadcast kernels reject rank > 2 upstream).
    pub fn work_dims(&self) -> (usize, usize) {
        let m = self.0.first().copied().unwrap_or(1).max(1);
        let n = self.0.get(1).copied().unwrap_or(1).max(1);
        (m, n)
    }

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style broadcasting rules:
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. Dimensions are compatible if they are equal or one of them is 1.
    ///   3. Missing leading dimensions are treated as 1.
    ///
    /// Examples:
    ///   [3, 4] and [4]     → [3, 4]
    ///   [2, 1] and [1, 3]  → [2, 3]
    ///   [3] and [4]        → Error (3 ≠ 4 and neither is 1)
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            // Index from the right: len()-1-i walks backwards. If i >= len, treat as 1.
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else if rd == 1 {
                result.push(ld);
            } else {
                return Err(crate::Error::msg(format!(
                    "shapes {:?} and {:?} are not broadcast-compatible (dim {} from right: {} vs {})",
                    l, r, i, ld, rd
                )));
            }
        }

        result.reverse(); // We built it from the right
        Ok(Shape::new(result))
    }

    /// Return the per-dimension strides that read this shape's data as if it
    /// were expanded to `target`. Dimensions of size 1 (and missing leading
    /// dimensions) get stride 0, repeating the single element.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        let self_strides = self.stride_contiguous();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = self_strides[i];
            } else {
                // self_dims[i] must be 1 → stride 0 (broadcast)
                result[i + offset] = 0;
            }
        }
        result
    }

    /// Compute the contiguous (row-major) strides for this shape.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.is_scalar_like());
        assert_eq!(s.work_dims(), (1, 1));
    }

    #[test]
    fn test_single_element_is_scalar_like() {
        assert!(Shape::from(vec![1]).is_scalar_like());
        assert!(Shape::from(vec![1, 1]).is_scalar_like());
        assert!(!Shape::from(vec![2]).is_scalar_like());
    }

    #[test]
    fn test_work_dims() {
        assert_eq!(Shape::from(5).work_dims(), (5, 1));
        assert_eq!(Shape::from((3, 4)).work_dims(), (3, 4));
    }

    #[test]
    fn test_broadcast_shape() {
        let a = Shape::from((3, 4));
        let b = Shape::from(4);
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap(), Shape::from((3, 4)));

        let a = Shape::from((2, 1));
        let b = Shape::from((1, 3));
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap(), Shape::from((2, 3)));

        let a = Shape::from(3);
        let b = Shape::from(4);
        assert!(Shape::broadcast_shape(&a, &b).is_err());
    }

    #[test]
    fn test_broadcast_strides() {
        // [1, 3] expanded to [2, 3]: row repeats, so dim 0 stride is 0.
        let s = Shape::from((1, 3));
        let t = Shape::from((2, 3));
        assert_eq!(s.broadcast_strides(&t), vec![0, 1]);

        // [3] expanded to [2, 3]: missing leading dim gets stride 0.
        let s = Shape::from(3);
        assert_eq!(s.broadcast_strides(&t), vec![0, 1]);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
