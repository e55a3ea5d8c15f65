use std::cell::RefCell;
use std::rc::Rc;

use ocl::flags::MemFlags;
use ocl::{Buffer, Event, OclPrm, Queue};

use vole_core::{DType, Error, Result, Shape, Value, WithDType};

// OclBuffer — The core's device-buffer handle
//
// Pairs a host-side typed array with its device allocation, the declared
// shape and dtype, a dirty flag, and the event of the last enqueue that
// wrote the device memory. Buffers are shared by identity through
// `Rc<RefCell<..>>`: a cache hit hands every consumer the same object, so
// a producer's recorded event is visible to all of them.
//
// Invariants:
// - `host.len() == shape.elem_count()` (at least 1, even for scalars)
// - `device` is None exactly when the shape has a zero dimension
// - `last_event` is the completion token of the last write to `device`

/// Shared handle to a device buffer.
pub type BufRef = Rc<RefCell<OclBuffer>>;

/// Host-side storage, one variant per supported dtype. Bool is carried as
/// a 16-bit short, matching the device representation.
#[derive(Debug, Clone)]
pub enum HostArray {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<i16>),
}

impl HostArray {
    fn zeros(dtype: DType, len: usize) -> HostArray {
        match dtype {
            DType::F32 => HostArray::F32(vec![0.0; len]),
            DType::I32 => HostArray::I32(vec![0; len]),
            DType::Bool => HostArray::Bool(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostArray::F32(v) => v.len(),
            HostArray::I32(v) => v.len(),
            HostArray::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cast a flat f64 vector into this array, starting at index 0.
    /// Shorter inputs leave the tail untouched.
    pub fn fill_from_f64(&mut self, flat: &[f64]) {
        match self {
            HostArray::F32(v) => {
                for (dst, src) in v.iter_mut().zip(flat) {
                    *dst = f32::from_f64(*src);
                }
            }
            HostArray::I32(v) => {
                for (dst, src) in v.iter_mut().zip(flat) {
                    *dst = i32::from_f64(*src);
                }
            }
            HostArray::Bool(v) => {
                for (dst, src) in v.iter_mut().zip(flat) {
                    *dst = i16::from_f64(*src);
                }
            }
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            HostArray::F32(v) => v.iter().map(|&x| x.to_f64()).collect(),
            HostArray::I32(v) => v.iter().map(|&x| x.to_f64()).collect(),
            HostArray::Bool(v) => v.iter().map(|&x| x.to_f64()).collect(),
        }
    }
}

/// Device-side storage, one variant per supported dtype.
#[derive(Debug, Clone)]
pub enum DeviceArray {
    F32(Buffer<f32>),
    I32(Buffer<i32>),
    Bool(Buffer<i16>),
}

/// Bridges a concrete host element type to its `DeviceArray` variant, so
/// kernel-dispatch code can be written once and monomorphized per dtype.
pub trait DevicePrm: OclPrm + WithDType {
    fn device_buf(arr: &DeviceArray) -> Option<&Buffer<Self>>;
    fn host_slice(arr: &HostArray) -> Option<&[Self]>;
    fn host_slice_mut(arr: &mut HostArray) -> Option<&mut [Self]>;
}

macro_rules! device_prm {
    ($ty:ty, $variant:ident) => {
        impl DevicePrm for $ty {
            fn device_buf(arr: &DeviceArray) -> Option<&Buffer<Self>> {
                match arr {
                    DeviceArray::$variant(b) => Some(b),
                    _ => None,
                }
            }
            fn host_slice(arr: &HostArray) -> Option<&[Self]> {
                match arr {
                    HostArray::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn host_slice_mut(arr: &mut HostArray) -> Option<&mut [Self]> {
                match arr {
                    HostArray::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

device_prm!(f32, F32);
device_prm!(i32, I32);
device_prm!(i16, Bool);

/// A tagged device-buffer handle: host array, device memory, shape, dtype,
/// dirty flag, and the last event that wrote the device side.
pub struct OclBuffer {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
    pub host: HostArray,
    pub device: Option<DeviceArray>,
    /// Completion token of the last enqueue that wrote `device`; consumed
    /// as a wait-list entry by dependent enqueues.
    pub last_event: Option<Event>,
    /// Set by assignment writes; uninitialized variables fail fast on it.
    pub dirty: bool,
}

impl OclBuffer {
    /// Allocate host and device storage with no initial write. Device
    /// memory is skipped entirely for zero-element shapes.
    pub fn new(queue: &Queue, name: &str, dtype: DType, shape: Shape) -> Result<OclBuffer> {
        let len = shape.elem_count();
        let host = HostArray::zeros(dtype, len);
        let device = if shape.has_zero_dim() {
            None
        } else {
            Some(alloc_device(queue, dtype, len)?)
        };
        Ok(OclBuffer {
            name: name.to_string(),
            dtype,
            shape,
            host,
            device,
            last_event: None,
            dirty: false,
        })
    }

    /// The wait list dependent enqueues must carry: the last write event,
    /// if one is outstanding.
    pub fn wait_list(&self) -> Vec<Event> {
        self.last_event.iter().cloned().collect()
    }

    /// Cast a host value into the host array (flatten + per-dtype cast).
    pub fn fill(&mut self, value: &Value) {
        self.host.fill_from_f64(&value.flatten());
    }

    /// Enqueue the host-to-device write and record its event.
    pub fn enqueue_write(&mut self) -> Result<()> {
        let Some(device) = &self.device else {
            return Ok(());
        };
        let mut evt = Event::empty();
        match (device, &self.host) {
            (DeviceArray::F32(buf), HostArray::F32(data)) => buf
                .cmd()
                .write(data)
                .enew(&mut evt)
                .enq()
                .map_err(Error::device)?,
            (DeviceArray::I32(buf), HostArray::I32(data)) => buf
                .cmd()
                .write(data)
                .enew(&mut evt)
                .enq()
                .map_err(Error::device)?,
            (DeviceArray::Bool(buf), HostArray::Bool(data)) => buf
                .cmd()
                .write(data)
                .enew(&mut evt)
                .enq()
                .map_err(Error::device)?,
            _ => bail_mismatch(&self.name)?,
        }
        self.last_event = Some(evt);
        Ok(())
    }

    /// Read the device contents back into the host array, waiting on the
    /// last write event. Blocking; on return the host array is current.
    pub fn read_to_host(&mut self) -> Result<()> {
        let Some(device) = &self.device else {
            return Ok(());
        };
        let wait = self.wait_list();
        match (device, &mut self.host) {
            (DeviceArray::F32(buf), HostArray::F32(data)) => buf
                .cmd()
                .read(data)
                .ewait(&wait[..])
                .enq()
                .map_err(Error::device)?,
            (DeviceArray::I32(buf), HostArray::I32(data)) => buf
                .cmd()
                .read(data)
                .ewait(&wait[..])
                .enq()
                .map_err(Error::device)?,
            (DeviceArray::Bool(buf), HostArray::Bool(data)) => buf
                .cmd()
                .read(data)
                .ewait(&wait[..])
                .enq()
                .map_err(Error::device)?,
            _ => bail_mismatch(&self.name)?,
        }
        Ok(())
    }

    /// Convert the current host array to a nested value matching the shape.
    pub fn to_value(&self) -> Value {
        Value::from_flat(&self.host.to_f64_vec(), &self.shape)
    }

    /// The typed device buffer, or an error naming the dtype family clash.
    pub fn typed<T: DevicePrm>(&self) -> Result<&Buffer<T>> {
        self.device
            .as_ref()
            .and_then(T::device_buf)
            .ok_or_else(|| {
                Error::msg(format!(
                    "buffer '{}' ({}) does not provide {} device storage",
                    self.name,
                    self.dtype,
                    T::DTYPE
                ))
            })
    }
}

fn alloc_device(queue: &Queue, dtype: DType, len: usize) -> Result<DeviceArray> {
    fn build<T: OclPrm>(queue: &Queue, len: usize) -> Result<Buffer<T>> {
        Buffer::<T>::builder()
            .queue(queue.clone())
            .flags(MemFlags::READ_WRITE)
            .len(len)
            .build()
            .map_err(Error::device)
    }
    Ok(match dtype {
        DType::F32 => DeviceArray::F32(build(queue, len)?),
        DType::I32 => DeviceArray::I32(build(queue, len)?),
        DType::Bool => DeviceArray::Bool(build(queue, len)?),
    })
}

fn bail_mismatch(name: &str) -> Result<()> {
    Err(Error::msg(format!(
        "buffer '{}' host and device storage disagree on dtype",
        name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_array_cast() {
        let mut arr = HostArray::zeros(DType::I32, 4);
        arr.fill_from_f64(&[1.9, -2.2, 3.0, 4.0]);
        assert_eq!(arr.to_f64_vec(), vec![1.0, -2.0, 3.0, 4.0]);

        let mut arr = HostArray::zeros(DType::Bool, 3);
        arr.fill_from_f64(&[0.0, 2.5, -1.0]);
        assert_eq!(arr.to_f64_vec(), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_host_array_partial_fill() {
        let mut arr = HostArray::zeros(DType::F32, 4);
        arr.fill_from_f64(&[7.0]);
        assert_eq!(arr.to_f64_vec(), vec![7.0, 0.0, 0.0, 0.0]);
    }
}
