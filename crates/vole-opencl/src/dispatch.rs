use ocl::{Event, Kernel, Program};

use vole_core::{DType, Error, Result, Shape, Value};

use crate::buffer::{BufRef, DevicePrm, OclBuffer};
use crate::SessionCache;

// Kernel dispatcher — Variant selection and enqueue
//
// A two-operand elementwise op picks one of three program variants based on
// the operand shapes, canonicalizes the operand order, and passes a switch
// flag so non-commutative kernels can apply the op in the caller's intended
// order. Causal ordering is carried exclusively by the operands' last-write
// events in the enqueue's wait list.

/// Program variant of a two-operand elementwise kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Operand shapes are identical.
    Same,
    /// The second canonical operand is a single element (`_c`).
    Scalar,
    /// Rank <= 2 modulo broadcast (`_b`).
    Broadcast,
}

impl Variant {
    pub fn suffix(&self) -> &'static str {
        match self {
            Variant::Same => "",
            Variant::Scalar => "_c",
            Variant::Broadcast => "_b",
        }
    }
}

/// Outcome of variant selection: which program to use and whether the
/// caller's operands were swapped into canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub variant: Variant,
    pub switched: bool,
}

/// Choose the kernel variant and canonical operand order for `(a, b)`.
///
/// | condition                         | variant | switched |
/// |-----------------------------------|---------|----------|
/// | shapes equal                      | same    | no       |
/// | `a` is scalar (<= 1 element)      | `_c`    | yes      |
/// | `b` is scalar                     | `_c`    | no       |
/// | rank(a) < rank(b)                 | `_b`    | yes      |
/// | equal rank, first axis a[i]<b[i]  | `_b`    | yes      |
/// | otherwise                         | `_b`    | no       |
///
/// Broadcast is only defined for ranks <= 2.
pub fn select_variant(a: &Shape, b: &Shape) -> Result<DispatchPlan> {
    if a == b {
        return Ok(DispatchPlan {
            variant: Variant::Same,
            switched: false,
        });
    }
    if a.is_scalar_like() {
        return Ok(DispatchPlan {
            variant: Variant::Scalar,
            switched: true,
        });
    }
    if b.is_scalar_like() {
        return Ok(DispatchPlan {
            variant: Variant::Scalar,
            switched: false,
        });
    }
    if a.rank() > 2 || b.rank() > 2 {
        return Err(Error::RankError {
            context: "elementwise broadcast",
            got: a.rank().max(b.rank()),
        });
    }
    let switched = if a.rank() != b.rank() {
        a.rank() < b.rank()
    } else {
        // Equal rank: decided by the first differing axis.
        a.dims()
            .iter()
            .zip(b.dims())
            .find(|(x, y)| x != y)
            .map(|(x, y)| x < y)
            .unwrap_or(false)
    };
    Ok(DispatchPlan {
        variant: Variant::Broadcast,
        switched,
    })
}

/// `[M2, N2]` for the modulo-indexed broadcast operand, right-aligned so a
/// rank-1 operand broadcasts along rows the way host semantics do.
fn aligned_work_dims(shape: &Shape) -> (usize, usize) {
    match shape.dims() {
        [] => (1, 1),
        [n] => (1, *n),
        [m, n, ..] => (*m, *n),
    }
}

// Type coercion

/// Promote mixed-dtype operand pairs: when exactly one side is floating,
/// the other is cast on-device into a fresh buffer. Any other mismatch is
/// accepted unchanged.
pub fn coerce(cache: &SessionCache, a: &BufRef, b: &BufRef) -> Result<(BufRef, BufRef)> {
    let (da, db) = (a.borrow().dtype, b.borrow().dtype);
    match (da, db) {
        (DType::F32, DType::I32) => Ok((a.clone(), cast_buffer(cache, b, DType::F32)?)),
        (DType::I32, DType::F32) => Ok((a.clone(), cast_buffer(cache, b, DType::I32)?)),
        _ => Ok((a.clone(), b.clone())),
    }
}

fn cast_buffer(cache: &SessionCache, src: &BufRef, to: DType) -> Result<BufRef> {
    let program = cache.program("cast")?;
    let srcb = src.borrow();
    let (m, n) = srcb.shape.work_dims();
    let out = cache.result_buffer(to, &srcb.shape, &format!("{}_cast", srcb.name))?;
    let mut outb = out.borrow_mut();
    let wait = srcb.wait_list();
    let mut evt = Event::empty();
    match to {
        DType::F32 => {
            let kernel = Kernel::builder()
                .program(&program)
                .name("cast_int_fp")
                .queue(cache.queue().clone())
                .global_work_size([m, n])
                .arg(m as i32)
                .arg(n as i32)
                .arg(srcb.typed::<i32>()?)
                .arg(outb.typed::<f32>()?)
                .build()
                .map_err(Error::device)?;
            unsafe {
                kernel
                    .cmd()
                    .ewait(&wait[..])
                    .enew(&mut evt)
                    .enq()
                    .map_err(Error::device)?;
            }
        }
        DType::I32 => {
            let kernel = Kernel::builder()
                .program(&program)
                .name("cast_fp_int")
                .queue(cache.queue().clone())
                .global_work_size([m, n])
                .arg(m as i32)
                .arg(n as i32)
                .arg(srcb.typed::<f32>()?)
                .arg(outb.typed::<i32>()?)
                .build()
                .map_err(Error::device)?;
            unsafe {
                kernel
                    .cmd()
                    .ewait(&wait[..])
                    .enew(&mut evt)
                    .enq()
                    .map_err(Error::device)?;
            }
        }
        DType::Bool => {
            return Err(Error::msg("no cast kernel targets bool"));
        }
    }
    outb.last_event = Some(evt);
    drop(outb);
    Ok(out)
}

// Two-operand elementwise dispatch

/// Enqueue a two-operand elementwise kernel. `base` is the kernel family
/// name (`add`, `sub`, ...); the output buffer is fetched from the result
/// cache under `out_name`.
pub fn execute_binary(
    cache: &SessionCache,
    base: &str,
    a: &BufRef,
    b: &BufRef,
    out_name: &str,
) -> Result<BufRef> {
    let (a, b) = coerce(cache, a, b)?;
    let (out_dtype, out_shape, plan) = {
        let (ab, bb) = (a.borrow(), b.borrow());
        let shape = Shape::broadcast_shape(&ab.shape, &bb.shape)?;
        let plan = select_variant(&ab.shape, &bb.shape)?;
        (ab.dtype, shape, plan)
    };

    // The modulo kernels require the canonical first operand to span the
    // full output shape. Pairs where both operands broadcast (e.g. [2,1]
    // against [1,3]) are materialized host-side first.
    if plan.variant == Variant::Broadcast {
        let x_shape = if plan.switched {
            b.borrow().shape.clone()
        } else {
            a.borrow().shape.clone()
        };
        if x_shape != out_shape {
            let a2 = materialize_broadcast(cache, &a, &out_shape)?;
            let b2 = materialize_broadcast(cache, &b, &out_shape)?;
            return execute_binary(cache, base, &a2, &b2, out_name);
        }
    }

    let out = cache.result_buffer(out_dtype, &out_shape, out_name)?;
    let (x, y) = if plan.switched { (&b, &a) } else { (&a, &b) };
    let entry = format!("{}{}_{}", base, plan.variant.suffix(), out_dtype.kernel_family());
    let program = cache.program(base)?;
    let (m, n) = out_shape.work_dims();
    let extra = match plan.variant {
        Variant::Broadcast => Some(aligned_work_dims(&y.borrow().shape)),
        _ => None,
    };

    let xb = x.borrow();
    let yb = y.borrow();
    let mut wait = xb.wait_list();
    wait.extend(yb.wait_list());
    let mut ob = out.borrow_mut();
    log::trace!("enqueue {} over [{}, {}] for '{}'", entry, m, n, out_name);
    let evt = match out_dtype {
        DType::F32 => enqueue_binary::<f32>(
            cache, &program, &entry, m, n, extra, plan.switched, &xb, &yb, &ob, &wait,
        )?,
        DType::I32 => enqueue_binary::<i32>(
            cache, &program, &entry, m, n, extra, plan.switched, &xb, &yb, &ob, &wait,
        )?,
        DType::Bool => enqueue_binary::<i16>(
            cache, &program, &entry, m, n, extra, plan.switched, &xb, &yb, &ob, &wait,
        )?,
    };
    ob.last_event = Some(evt);
    drop(ob);
    drop(xb);
    drop(yb);
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn enqueue_binary<T: DevicePrm>(
    cache: &SessionCache,
    program: &Program,
    entry: &str,
    m: usize,
    n: usize,
    extra: Option<(usize, usize)>,
    switched: bool,
    x: &OclBuffer,
    y: &OclBuffer,
    out: &OclBuffer,
    wait: &[Event],
) -> Result<Event> {
    let mut kb = Kernel::builder();
    kb.program(program)
        .name(entry)
        .queue(cache.queue().clone())
        .global_work_size([m, n])
        .arg(m as i32)
        .arg(n as i32);
    if let Some((m2, n2)) = extra {
        kb.arg(m2 as i32).arg(n2 as i32);
    }
    kb.arg(switched as i32)
        .arg(x.typed::<T>()?)
        .arg(y.typed::<T>()?)
        .arg(out.typed::<T>()?);
    let kernel = kb.build().map_err(Error::device)?;
    let mut evt = Event::empty();
    unsafe {
        kernel
            .cmd()
            .ewait(wait)
            .enew(&mut evt)
            .enq()
            .map_err(Error::device)?;
    }
    Ok(evt)
}

// Unary dispatch

/// Enqueue a unary elementwise kernel over the operand's own shape.
pub fn execute_unary(cache: &SessionCache, base: &str, a: &BufRef, out_name: &str) -> Result<BufRef> {
    let (out_dtype, out_shape) = {
        let ab = a.borrow();
        (ab.dtype, ab.shape.clone())
    };
    let out = cache.result_buffer(out_dtype, &out_shape, out_name)?;
    let entry = format!("{}_{}", base, out_dtype.kernel_family());
    let program = cache.program(base)?;
    let (m, n) = out_shape.work_dims();

    let ab = a.borrow();
    let wait = ab.wait_list();
    let mut ob = out.borrow_mut();
    log::trace!("enqueue {} over [{}, {}] for '{}'", entry, m, n, out_name);
    let evt = match out_dtype {
        DType::F32 => enqueue_unary::<f32>(cache, &program, &entry, m, n, &ab, &ob, &wait)?,
        DType::I32 => enqueue_unary::<i32>(cache, &program, &entry, m, n, &ab, &ob, &wait)?,
        DType::Bool => enqueue_unary::<i16>(cache, &program, &entry, m, n, &ab, &ob, &wait)?,
    };
    ob.last_event = Some(evt);
    drop(ob);
    drop(ab);
    Ok(out)
}

fn enqueue_unary<T: DevicePrm>(
    cache: &SessionCache,
    program: &Program,
    entry: &str,
    m: usize,
    n: usize,
    a: &OclBuffer,
    out: &OclBuffer,
    wait: &[Event],
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name(entry)
        .queue(cache.queue().clone())
        .global_work_size([m, n])
        .arg(m as i32)
        .arg(n as i32)
        .arg(a.typed::<T>()?)
        .arg(out.typed::<T>()?)
        .build()
        .map_err(Error::device)?;
    let mut evt = Event::empty();
    unsafe {
        kernel
            .cmd()
            .ewait(wait)
            .enew(&mut evt)
            .enq()
            .map_err(Error::device)?;
    }
    Ok(evt)
}

// Matmul dispatch

/// Enqueue `gemm` for `a @ b` with optional transposes. Operands must be
/// rank >= 2 and agree on the inner dimension.
pub fn execute_matmul(
    cache: &SessionCache,
    a: &BufRef,
    b: &BufRef,
    transpose_a: bool,
    transpose_b: bool,
    out_name: &str,
) -> Result<BufRef> {
    {
        let ab = a.borrow();
        if ab.shape.rank() < 2 {
            return Err(Error::RankError {
                context: "matmul",
                got: ab.shape.rank(),
            });
        }
        let bb = b.borrow();
        if bb.shape.rank() < 2 {
            return Err(Error::RankError {
                context: "matmul",
                got: bb.shape.rank(),
            });
        }
    }
    let (a, b) = coerce(cache, a, b)?;
    let ab = a.borrow();
    let bb = b.borrow();
    let (ad, bd) = (ab.shape.dims(), bb.shape.dims());
    let (m, k) = if transpose_a {
        (ad[1], ad[0])
    } else {
        (ad[0], ad[1])
    };
    let (v, n) = if transpose_b {
        (bd[1], bd[0])
    } else {
        (bd[0], bd[1])
    };
    if k != v {
        return Err(Error::ShapeMismatch { m, k1: k, k2: v, n });
    }

    let out_dtype = ab.dtype;
    let out = cache.result_buffer(out_dtype, &Shape::from((m, n)), out_name)?;
    let entry = format!("gemm_{}", out_dtype.kernel_family());
    let program = cache.program("gemm")?;
    let mut wait = ab.wait_list();
    wait.extend(bb.wait_list());
    let mut ob = out.borrow_mut();
    log::trace!("enqueue {} [{}x{}x{}] for '{}'", entry, m, n, k, out_name);
    let evt = match out_dtype {
        DType::F32 => enqueue_gemm::<f32>(
            cache, &program, &entry, m, n, k, transpose_a, transpose_b, &ab, &bb, &ob, &wait,
        )?,
        DType::I32 => enqueue_gemm::<i32>(
            cache, &program, &entry, m, n, k, transpose_a, transpose_b, &ab, &bb, &ob, &wait,
        )?,
        DType::Bool => enqueue_gemm::<i16>(
            cache, &program, &entry, m, n, k, transpose_a, transpose_b, &ab, &bb, &ob, &wait,
        )?,
    };
    ob.last_event = Some(evt);
    drop(ob);
    drop(ab);
    drop(bb);
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn enqueue_gemm<T: DevicePrm>(
    cache: &SessionCache,
    program: &Program,
    entry: &str,
    m: usize,
    n: usize,
    k: usize,
    ta: bool,
    tb: bool,
    a: &OclBuffer,
    b: &OclBuffer,
    out: &OclBuffer,
    wait: &[Event],
) -> Result<Event> {
    let kernel = Kernel::builder()
        .program(program)
        .name(entry)
        .queue(cache.queue().clone())
        .global_work_size([m, n])
        .arg(m as i32)
        .arg(n as i32)
        .arg(k as i32)
        .arg(ta as i32)
        .arg(tb as i32)
        .arg(a.typed::<T>()?)
        .arg(b.typed::<T>()?)
        .arg(out.typed::<T>()?)
        .build()
        .map_err(Error::device)?;
    let mut evt = Event::empty();
    unsafe {
        kernel
            .cmd()
            .ewait(wait)
            .enew(&mut evt)
            .enq()
            .map_err(Error::device)?;
    }
    Ok(evt)
}

// Device-to-device copy (variable assignment)

/// Overwrite `dst` with `src` on-device, waiting on both buffers' pending
/// events. Marks `dst` dirty and records the copy event on it.
pub fn copy_buffer(src: &BufRef, dst: &BufRef) -> Result<()> {
    let srcb = src.borrow();
    let mut dstb = dst.borrow_mut();
    let (Some(sdev), Some(_)) = (&srcb.device, &dstb.device) else {
        dstb.dirty = true;
        return Ok(());
    };
    let len = srcb.host.len().min(dstb.host.len());
    let mut wait = srcb.wait_list();
    wait.extend(dstb.wait_list());
    let mut evt = Event::empty();
    match sdev {
        crate::buffer::DeviceArray::F32(sbuf) => sbuf
            .cmd()
            .copy(dstb.typed::<f32>()?, None, Some(len))
            .ewait(&wait[..])
            .enew(&mut evt)
            .enq()
            .map_err(Error::device)?,
        crate::buffer::DeviceArray::I32(sbuf) => sbuf
            .cmd()
            .copy(dstb.typed::<i32>()?, None, Some(len))
            .ewait(&wait[..])
            .enew(&mut evt)
            .enq()
            .map_err(Error::device)?,
        crate::buffer::DeviceArray::Bool(sbuf) => sbuf
            .cmd()
            .copy(dstb.typed::<i16>()?, None, Some(len))
            .ewait(&wait[..])
            .enew(&mut evt)
            .enq()
            .map_err(Error::device)?,
    }
    dstb.last_event = Some(evt);
    dstb.dirty = true;
    Ok(())
}

// Host-side broadcast materialization

/// Expand a buffer host-side to `target` (right-aligned broadcast) and
/// upload the result as a fresh buffer. Used by `broadcast_transform` and
/// by operand pairs the modulo kernels cannot index.
pub fn materialize_broadcast(
    cache: &SessionCache,
    buf: &BufRef,
    target: &Shape,
) -> Result<BufRef> {
    {
        let b = buf.borrow();
        if b.shape == *target {
            return Ok(buf.clone());
        }
    }
    let (flat, from, dtype, name) = {
        let mut b = buf.borrow_mut();
        b.read_to_host()?;
        (
            b.host.to_f64_vec(),
            b.shape.clone(),
            b.dtype,
            b.name.clone(),
        )
    };
    let expanded = broadcast_host(&flat, &from, target);
    cache.convert_to_device(
        &Value::from(expanded),
        target,
        dtype,
        &format!("{}_bcast", name),
    )
}

/// Right-aligned host broadcast of a flat row-major array.
pub fn broadcast_host(flat: &[f64], from: &Shape, to: &Shape) -> Vec<f64> {
    let strides = from.broadcast_strides(to);
    let dims = to.dims();
    let total = to.elem_count();
    let mut out = Vec::with_capacity(total);
    let mut idx = vec![0usize; dims.len()];
    for _ in 0..total {
        let off: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(flat[off]);
        for d in (0..dims.len()).rev() {
            idx[d] += 1;
            if idx[d] < dims[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(a: &[usize], b: &[usize]) -> DispatchPlan {
        select_variant(&Shape::from(a), &Shape::from(b)).unwrap()
    }

    #[test]
    fn test_same_shape() {
        let p = plan(&[2, 3], &[2, 3]);
        assert_eq!(p.variant, Variant::Same);
        assert!(!p.switched);
    }

    #[test]
    fn test_scalar_operands() {
        let p = plan(&[], &[2, 3]);
        assert_eq!(p.variant, Variant::Scalar);
        assert!(p.switched);

        let p = plan(&[2, 3], &[1]);
        assert_eq!(p.variant, Variant::Scalar);
        assert!(!p.switched);

        // [1, 1] counts as scalar too
        let p = plan(&[1, 1], &[2, 3]);
        assert_eq!(p.variant, Variant::Scalar);
        assert!(p.switched);
    }

    #[test]
    fn test_broadcast_rank_order() {
        let p = plan(&[3], &[2, 3]);
        assert_eq!(p.variant, Variant::Broadcast);
        assert!(p.switched);

        let p = plan(&[2, 3], &[3]);
        assert_eq!(p.variant, Variant::Broadcast);
        assert!(!p.switched);
    }

    #[test]
    fn test_broadcast_equal_rank() {
        // first differing axis decides the swap
        let p = plan(&[1, 3], &[2, 3]);
        assert!(p.switched);
        let p = plan(&[2, 3], &[2, 1]);
        assert!(!p.switched);
    }

    #[test]
    fn test_broadcast_rank_limit() {
        let a = Shape::from(vec![2, 3, 4]);
        let b = Shape::from(vec![3, 4]);
        assert!(matches!(
            select_variant(&a, &b),
            Err(Error::RankError { got: 3, .. })
        ));
    }

    #[test]
    fn test_aligned_work_dims() {
        assert_eq!(aligned_work_dims(&Shape::from(3)), (1, 3));
        assert_eq!(aligned_work_dims(&Shape::from((2, 1))), (2, 1));
        assert_eq!(aligned_work_dims(&Shape::scalar()), (1, 1));
    }

    #[test]
    fn test_broadcast_host_row() {
        // [3] over [2, 3] repeats the row
        let out = broadcast_host(
            &[1.0, 2.0, 3.0],
            &Shape::from(3),
            &Shape::from((2, 3)),
        );
        assert_eq!(out, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_broadcast_host_col() {
        // [2, 1] over [2, 3] repeats each value along the row
        let out = broadcast_host(
            &[5.0, 6.0],
            &Shape::from((2, 1)),
            &Shape::from((2, 3)),
        );
        assert_eq!(out, vec![5.0, 5.0, 5.0, 6.0, 6.0, 6.0]);
    }
}
