//! # vole-opencl
//!
//! OpenCL evaluator for vole symbolic tensor graphs.
//!
//! Given a graph of tensor operations, [`Evaluator::run`] materializes
//! device buffers, dispatches one kernel per node, propagates data
//! dependencies through command-queue events, and reads requested outputs
//! back as nested host values.
//!
//! ARCHITECTURE:
//! - [`SessionCache`] owns the device, context, queue, lazily compiled
//!   kernel programs, and every cached buffer; it is created once and
//!   reused across `run` calls
//! - [`OclBuffer`] pairs a host array with its device allocation and the
//!   event of the last enqueue that wrote it
//! - `dispatch` selects a kernel variant (same-shape / scalar / broadcast /
//!   gemm) and enqueues it with the operands' events as its wait list
//! - [`Evaluator`] walks the graph with an explicit worklist, memoizing one
//!   result per node per run

pub mod buffer;
pub mod dispatch;
pub mod evaluator;
pub mod random;
mod registry;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ocl::{Context, Device, Platform, Program, Queue};
use rand::rngs::StdRng;

use vole_core::{DType, Error, Result, Shape, Value};

pub use buffer::{BufRef, DeviceArray, HostArray, OclBuffer};
pub use evaluator::{ComputeRecord, Evaluated, Evaluator, EvaluatorOptions, ExecContext};

/// Cache key for converted and result buffers: tensor identity is
/// `(name, shape)`. A node's dtype never varies for a given name, so dtype
/// is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BufferKey {
    name: String,
    shape: Shape,
}

impl BufferKey {
    pub(crate) fn new(name: &str, shape: &Shape) -> Self {
        BufferKey {
            name: name.to_string(),
            shape: shape.clone(),
        }
    }
}

// SessionCache — Process-wide device state for one session
//
// Constructed at most once per session and never mutated by the walker
// beyond its interior cache slots. Holds the OpenCL device/context/queue
// plus typed sub-slots: compiled kernel programs, converted buffers keyed
// by tensor identity, result buffers, variable slots, and seeded random
// generators.

pub struct SessionCache {
    device: Device,
    context: Context,
    queue: Queue,
    kernel_dir: PathBuf,
    programs: RefCell<HashMap<String, Program>>,
    buffers: RefCell<HashMap<BufferKey, BufRef>>,
    results: RefCell<HashMap<BufferKey, BufRef>>,
    variables: RefCell<HashMap<String, BufRef>>,
    pub(crate) randomizers: RefCell<HashMap<String, Rc<RefCell<StdRng>>>>,
}

impl SessionCache {
    /// Open the first available device with the crate's bundled kernels.
    pub fn new() -> Result<Rc<Self>> {
        Self::with_kernel_dir(default_kernel_dir())
    }

    /// Open the first available device, compiling kernels from `dir`.
    pub fn with_kernel_dir(dir: impl Into<PathBuf>) -> Result<Rc<Self>> {
        let platform = Platform::default();
        let device = Device::first(platform).map_err(Error::device)?;
        let context = Context::builder()
            .platform(platform)
            .devices(device.clone())
            .build()
            .map_err(Error::device)?;
        let queue = Queue::new(&context, device.clone(), None).map_err(Error::device)?;
        log::debug!(
            "opencl session on device '{}'",
            device.name().unwrap_or_else(|_| "<unknown>".to_string())
        );
        Ok(Rc::new(SessionCache {
            device,
            context,
            queue,
            kernel_dir: dir.into(),
            programs: RefCell::new(HashMap::new()),
            buffers: RefCell::new(HashMap::new()),
            results: RefCell::new(HashMap::new()),
            variables: RefCell::new(HashMap::new()),
            randomizers: RefCell::new(HashMap::new()),
        }))
    }

    /// True when at least one OpenCL platform exposes a device. Lets tests
    /// skip cleanly on machines without a runtime.
    pub fn available() -> bool {
        Platform::list()
            .iter()
            .any(|p| Device::list_all(p).map(|d| !d.is_empty()).unwrap_or(false))
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn kernel_dir(&self) -> &Path {
        &self.kernel_dir
    }

    pub(crate) fn cached_program(&self, op: &str) -> Option<Program> {
        self.programs.borrow().get(op).cloned()
    }

    pub(crate) fn store_program(&self, op: &str, program: Program) {
        self.programs.borrow_mut().insert(op.to_string(), program);
    }

    // Buffer factory / converter

    /// A cached converted buffer, if one exists for `(name, shape)`.
    pub fn cached_buffer(&self, name: &str, shape: &Shape) -> Option<BufRef> {
        self.buffers.borrow().get(&BufferKey::new(name, shape)).cloned()
    }

    /// Allocate, fill and upload a buffer from a host value, cached by
    /// `(name, shape)`. A cache hit with a non-empty value refills the
    /// existing object and re-enqueues the host-to-device write; the cached
    /// object itself is always the one returned.
    pub fn convert_to_device(
        &self,
        value: &Value,
        shape: &Shape,
        dtype: DType,
        name: &str,
    ) -> Result<BufRef> {
        let key = BufferKey::new(name, shape);
        if let Some(buf) = self.buffers.borrow().get(&key).cloned() {
            if !value.is_empty() {
                let mut b = buf.borrow_mut();
                b.fill(value);
                b.enqueue_write()?;
            }
            return Ok(buf);
        }
        log::trace!("allocating buffer '{}' {} {}", name, dtype, shape);
        let mut buf = OclBuffer::new(&self.queue, name, dtype, shape.clone())?;
        if !value.is_empty() {
            buf.fill(value);
            buf.enqueue_write()?;
        }
        let buf = Rc::new(RefCell::new(buf));
        self.buffers.borrow_mut().insert(key, buf.clone());
        Ok(buf)
    }

    /// A result buffer for a kernel output: host and device storage with no
    /// initial write, cached under `("_result_", name, shape)`.
    pub fn result_buffer(&self, dtype: DType, shape: &Shape, name: &str) -> Result<BufRef> {
        let key = BufferKey::new(&format!("_result_{}", name), shape);
        if let Some(buf) = self.results.borrow().get(&key).cloned() {
            return Ok(buf);
        }
        let buf = Rc::new(RefCell::new(OclBuffer::new(
            &self.queue,
            name,
            dtype,
            shape.clone(),
        )?));
        self.results.borrow_mut().insert(key, buf.clone());
        Ok(buf)
    }

    // Variable slots

    /// The assigned buffer slot of a variable, if any.
    pub fn variable(&self, name: &str) -> Option<BufRef> {
        self.variables.borrow().get(name).cloned()
    }

    pub fn set_variable(&self, name: &str, buf: BufRef) {
        self.variables.borrow_mut().insert(name.to_string(), buf);
    }
}

/// The crate's bundled kernel resource directory.
pub fn default_kernel_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("kernels")
}
