// Evaluator tests — End-to-end graph evaluation on a live OpenCL device
//
// Run with: `cargo test -p vole-opencl`
//
// Every test opens the first available device; on machines without an
// OpenCL platform the tests log a note and return early.

use std::cell::Cell;
use std::rc::Rc;

use vole_core::{DType, Error, Graph, Op, Shape, Value};
use vole_opencl::{Evaluator, EvaluatorOptions, ExecContext, SessionCache};

fn session() -> Option<(Rc<SessionCache>, Evaluator)> {
    let _ = env_logger::builder().is_test(true).try_init();
    if !SessionCache::available() {
        eprintln!("no OpenCL platform available, skipping device test");
        return None;
    }
    let cache = SessionCache::new().expect("failed to open OpenCL session");
    let eval = Evaluator::new(cache.clone(), EvaluatorOptions::default());
    Some((cache, eval))
}

fn approx(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_approx_value(actual: &Value, expected: &Value, tol: f64) {
    let (a, e) = (actual.flatten(), expected.flatten());
    assert_eq!(
        actual.shape(),
        expected.shape(),
        "shape mismatch: {} vs {}",
        actual.shape(),
        expected.shape()
    );
    for (i, (x, y)) in a.iter().zip(e.iter()).enumerate() {
        assert!(approx(*x, *y, tol), "index {i}: {x} != {y} (tol={tol})");
    }
}

// ─────────────────────────────────────────────────────────────────────
// Elementwise
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_add_same_shape() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![vec![1.0, 2.0], vec![3.0, 4.0]], DType::F32);
    let b = g.constant(vec![vec![5.0, 6.0], vec![7.0, 8.0]], DType::F32);
    let c = g.add(&a, &b);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::from(vec![vec![6.0, 8.0], vec![10.0, 12.0]])
    );
}

#[test]
fn test_sub_scalar_switch_order() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let m = g.constant(vec![vec![1.0, 2.0], vec![3.0, 4.0]], DType::F32);
    let s = g.constant(10.0, DType::F32);

    // matrix - scalar
    let d1 = g.apply(Op::Sub, vec![m.clone(), s.clone()], DType::F32);
    let out = eval.run(&d1, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![-9.0, -8.0], vec![-7.0, -6.0]]));

    // scalar - matrix exercises the switch flag
    let d2 = g.apply(Op::Sub, vec![s, m], DType::F32);
    let out = eval.run(&d2, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![9.0, 8.0], vec![7.0, 6.0]]));
}

#[test]
fn test_broadcast_row_vector() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], DType::F32);
    let b = g.constant(vec![10.0, 20.0, 30.0], DType::F32);
    let c = g.add(&a, &b);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::from(vec![vec![11.0, 22.0, 33.0], vec![14.0, 25.0, 36.0]])
    );
}

#[test]
fn test_broadcast_column_and_switch() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let col = g.constant(vec![vec![1.0], vec![2.0]], DType::F32);
    let m = g.constant(vec![vec![10.0, 20.0], vec![30.0, 40.0]], DType::F32);
    // smaller operand first exercises the swap
    let c = g.apply(Op::Sub, vec![col, m], DType::F32);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::from(vec![vec![-9.0, -19.0], vec![-28.0, -38.0]])
    );
}

#[test]
fn test_broadcast_both_operands() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    // [2,1] + [1,3] → host-materialized broadcast to [2,3]
    let a = g.constant(vec![vec![1.0], vec![2.0]], DType::F32);
    let b = g.constant(vec![vec![10.0, 20.0, 30.0]], DType::F32);
    let c = g.add(&a, &b);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::from(vec![vec![11.0, 21.0, 31.0], vec![12.0, 22.0, 32.0]])
    );
}

#[test]
fn test_unary_chain() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![1.0, 4.0, 9.0], DType::F32);
    let r = g.apply(Op::Sqrt, vec![a], DType::F32);
    let n = g.apply(Op::Negate, vec![r], DType::F32);

    let out = eval.run(&n, &mut ExecContext::new()).unwrap();
    assert_approx_value(&out, &Value::from(vec![-1.0, -2.0, -3.0]), 1e-5);
}

#[test]
fn test_sigmoid_and_grad() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(vec![0.0, 1.0], DType::F32);
    let s = g.apply(Op::Sigmoid, vec![x], DType::F32);

    let out = eval.run(&s, &mut ExecContext::new()).unwrap();
    let sig1 = 1.0 / (1.0 + (-1.0f64).exp());
    assert_approx_value(&out, &Value::from(vec![0.5, sig1]), 1e-5);
}

#[test]
fn test_int_arithmetic_and_coercion() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let i = g.constant_named("ints", vec![1.0, 2.0, 3.0], DType::I32);
    let f = g.constant_named("floats", vec![0.5, 0.5, 0.5], DType::F32);
    // int operand is cast to fp on-device before dispatch
    let c = g.apply(Op::Add, vec![f, i.clone()], DType::F32);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    assert_approx_value(&out, &Value::from(vec![1.5, 2.5, 3.5]), 1e-5);

    // pure int path stays int
    let j = g.constant_named("ints2", vec![10.0, 20.0, 30.0], DType::I32);
    let d = g.apply(Op::Add, vec![i, j], DType::I32);
    let out = eval.run(&d, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![11.0, 22.0, 33.0]));
}

// ─────────────────────────────────────────────────────────────────────
// Matmul
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_matmul() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], DType::F32);
    let b = g.constant(vec![vec![1.0], vec![2.0], vec![3.0]], DType::F32);
    let c = g.matmul(&a, &b, false, false);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![14.0], vec![32.0]]));
}

#[test]
fn test_matmul_transpose_mismatch() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], DType::F32);
    let b = g.constant(vec![vec![1.0], vec![2.0], vec![3.0]], DType::F32);
    let c = g.matmul(&a, &b, true, false);

    let err = eval.run(&c, &mut ExecContext::new()).unwrap_err();
    assert!(
        matches!(err.root_cause(), Error::ShapeMismatch { .. }),
        "expected ShapeMismatch, got {err}"
    );
}

#[test]
fn test_matmul_transposes() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    // a^T @ b^T with a = [[1,2],[3,4]] (stored), b = [[5,6],[7,8]]
    let a = g.constant(vec![vec![1.0, 2.0], vec![3.0, 4.0]], DType::F32);
    let b = g.constant(vec![vec![5.0, 6.0], vec![7.0, 8.0]], DType::F32);
    let c = g.matmul(&a, &b, true, true);

    let out = eval.run(&c, &mut ExecContext::new()).unwrap();
    // a^T = [[1,3],[2,4]], b^T = [[5,7],[6,8]] → [[23,31],[34,46]]
    assert_eq!(out, Value::from(vec![vec![23.0, 31.0], vec![34.0, 46.0]]));
}

#[test]
fn test_matmul_rank_error() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![1.0, 2.0], DType::F32);
    let b = g.constant(vec![vec![1.0], vec![2.0]], DType::F32);
    let c = g.matmul(&a, &b, false, false);

    let err = eval.run(&c, &mut ExecContext::new()).unwrap_err();
    assert!(matches!(err.root_cause(), Error::RankError { got: 1, .. }));
}

// ─────────────────────────────────────────────────────────────────────
// Variables, placeholders, assignment
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_variable_assign_add() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let v = g.variable(
        "acc",
        DType::F32,
        Shape::from(2),
        Some(Value::from(vec![1.0, 1.0])),
    );
    let delta = g.constant(vec![0.5, 0.25], DType::F32);
    let step = g.assign_add(&v, &delta);

    eval.run(&step, &mut ExecContext::new()).unwrap();
    let out = eval.run(&v, &mut ExecContext::new()).unwrap();
    assert_approx_value(&out, &Value::from(vec![1.5, 1.25]), 1e-5);

    // a second step accumulates on the persisted slot
    eval.run(&step, &mut ExecContext::new()).unwrap();
    let out = eval.run(&v, &mut ExecContext::new()).unwrap();
    assert_approx_value(&out, &Value::from(vec![2.0, 1.5]), 1e-5);
}

#[test]
fn test_assign_overwrites() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let v = g.variable("w", DType::F32, Shape::from(3), None);
    let first = g.assign(&v, &g.constant(vec![1.0, 2.0, 3.0], DType::F32));
    let second = g.assign(&v, &g.constant(vec![9.0, 9.0, 9.0], DType::F32));

    eval.run(&first, &mut ExecContext::new()).unwrap();
    eval.run(&second, &mut ExecContext::new()).unwrap();
    let out = eval.run(&v, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![9.0, 9.0, 9.0]));
}

#[test]
fn test_uninitialized_variable() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let v = g.variable("untouched", DType::F32, Shape::from(2), None);

    let err = eval.run(&v, &mut ExecContext::new()).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        Error::UninitializedVariable { name } if name == "untouched"
    ));
}

#[test]
fn test_placeholder_feed_and_missing() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.placeholder("x", DType::F32, Shape::from(2));
    let y = g.add(&x, &g.constant(vec![1.0, 1.0], DType::F32));

    let mut ctx = ExecContext::new().with_feed("x", vec![3.0, 4.0]);
    let out = eval.run(&y, &mut ctx).unwrap();
    assert_eq!(out, Value::from(vec![4.0, 5.0]));

    let err = eval.run(&y, &mut ExecContext::new()).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        Error::MissingPlaceholder { name } if name == "x"
    ));
}

// ─────────────────────────────────────────────────────────────────────
// Fills, shape ops
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_zeros_ones_like() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let z = g.apply_shaped(Op::Zeros, vec![], DType::F32, Shape::from((2, 2)));
    let out = eval.run(&z, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![0.0, 0.0], vec![0.0, 0.0]]));

    let a = g.constant(vec![vec![5.0, 5.0, 5.0]], DType::F32);
    let o = g.apply(Op::OnesLike, vec![a], DType::F32);
    let out = eval.run(&o, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![1.0, 1.0, 1.0]]));
}

#[test]
fn test_reshape_with_inference() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        DType::I32,
    );
    let spec = g.constant(vec![-1.0, 2.0], DType::I32);
    let r = g.reshape(&x, &spec);

    let out = eval.run(&r, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::from(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]])
    );
}

#[test]
fn test_reshape_round_trip() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(vec![vec![1.0, 2.0], vec![3.0, 4.0]], DType::F32);
    let s = g.shape_of(&x);
    let r = g.reshape(&x, &s);

    let out = eval.run(&r, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
}

#[test]
fn test_shape_of() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], DType::F32);
    let s = g.shape_of(&x);

    let out = eval.run(&s, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![2.0, 3.0]));
}

#[test]
fn test_index_and_truncate() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]], DType::F32);
    let i = g.constant(1.0, DType::I32);
    let row = g.apply(Op::Index, vec![x.clone(), i], DType::F32);
    let out = eval.run(&row, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![3.0, 4.0]));

    let target = g.constant(vec![2.0, 2.0], DType::I32);
    let t = g.apply(Op::Truncate, vec![x, target], DType::F32);
    let out = eval.run(&t, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]));
}

// ─────────────────────────────────────────────────────────────────────
// Reductions
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_sum_axes() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(vec![vec![1.0, 2.0], vec![3.0, 4.0]], DType::F32);

    let s0 = g.sum(&x, Some(vec![0]), false);
    let out = eval.run(&s0, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![4.0, 6.0]));

    let s1 = g.sum(&x, Some(vec![1]), false);
    let out = eval.run(&s1, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![3.0, 7.0]));

    let sall = g.sum(&x, None, false);
    let out = eval.run(&sall, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::Num(10.0));
}

#[test]
fn test_prod_of_ones() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let ones = g.apply_shaped(Op::Ones, vec![], DType::F32, Shape::from((3, 4)));
    let p = g.apply(
        Op::Prod {
            axes: None,
            keepdims: false,
        },
        vec![ones],
        DType::F32,
    );
    let out = eval.run(&p, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::Num(1.0));
}

#[test]
fn test_argmax_argmin() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let x = g.constant(vec![vec![1.0, 9.0, 3.0], vec![7.0, 2.0, 3.0]], DType::F32);

    let am = g.apply(Op::ArgMax { axis: 1 }, vec![x.clone()], DType::I32);
    let out = eval.run(&am, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![1.0, 0.0]));

    let an = g.apply(Op::ArgMin { axis: 0 }, vec![x], DType::I32);
    let out = eval.run(&an, &mut ExecContext::new()).unwrap();
    assert_eq!(out, Value::from(vec![0.0, 1.0, 0.0]));
}

// ─────────────────────────────────────────────────────────────────────
// Random generators
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_glorot_uniform_bounds_and_determinism() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::with_seed(1);
    let w = g.apply_shaped(
        Op::GlorotUniform { seed: Some(1) },
        vec![],
        DType::F32,
        Shape::from((64, 64)),
    );

    let first = eval.run(&w, &mut ExecContext::new()).unwrap();
    let second = eval.run(&w, &mut ExecContext::new()).unwrap();
    assert_eq!(first, second, "seeded glorot must repeat across runs");

    let limit = (6.0f64 / 128.0).sqrt();
    assert!(first
        .flatten()
        .iter()
        .all(|&x| x > -limit && x < limit));
}

#[test]
fn test_random_uniform_range() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::with_seed(7);
    let r = g.apply_shaped(
        Op::RandomUniform {
            min: -2.0,
            max: 3.0,
            seed: None,
        },
        vec![],
        DType::F32,
        Shape::from(128),
    );
    let out = eval.run(&r, &mut ExecContext::new()).unwrap();
    let flat = out.flatten();
    assert_eq!(flat.len(), 128);
    assert!(flat.iter().all(|&x| (-2.0..3.0).contains(&x)));
}

// ─────────────────────────────────────────────────────────────────────
// Walker behavior
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_memoized_single_evaluation() {
    let Some((cache, _)) = session() else { return };
    let eval = Evaluator::new(
        cache,
        EvaluatorOptions {
            log_intermediates: true,
            thread_pool: None,
        },
    );
    let g = Graph::new();
    let a = g.constant(vec![1.0, 2.0], DType::F32);
    let b = g.add(&a, &a);
    let c = g.add(&b, &b);

    let mut ctx = ExecContext::new();
    let out = eval.run(&c, &mut ctx).unwrap();
    assert_eq!(out, Value::from(vec![4.0, 8.0]));

    let b_records = ctx.history.iter().filter(|r| r.name == b.name).count();
    assert_eq!(b_records, 1, "shared node must be computed exactly once");
}

#[test]
fn test_flow_group() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![1.0], DType::F32);
    let b = g.constant(vec![2.0], DType::F32);
    let grp = g.apply(Op::FlowGroup, vec![a, b], DType::F32);

    let out = eval.run(&grp, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::List(vec![
            Value::from(vec![1.0]),
            Value::from(vec![2.0])
        ])
    );
}

#[test]
fn test_breakpoint_hook() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![1.0, 2.0], DType::F32);
    let b = g.constant(vec![3.0, 4.0], DType::F32);
    let c = g.add(&a, &b);

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    c.set_breakpoint(Rc::new(move |name, inputs, result| {
        assert!(name.starts_with("add_"));
        assert_eq!(inputs.len(), 2);
        assert_eq!(*result, Value::from(vec![4.0, 6.0]));
        seen.set(true);
    }));

    eval.run(&c, &mut ExecContext::new()).unwrap();
    assert!(fired.get(), "breakpoint hook must fire");
}

#[test]
fn test_broadcast_gradient_args_op() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let sa = g.constant(vec![2.0, 3.0], DType::I32);
    let sb = g.constant(vec![3.0], DType::I32);
    let bga = g.apply(Op::BroadcastGradientArgs, vec![sa, sb], DType::I32);

    let out = eval.run(&bga, &mut ExecContext::new()).unwrap();
    assert_eq!(
        out,
        Value::List(vec![Value::from(vec![0.0]), Value::List(vec![])])
    );
}

#[test]
fn test_error_carries_node_identity() {
    let Some((_, eval)) = session() else { return };
    let g = Graph::new();
    let a = g.constant(vec![1.0, 2.0], DType::F32);
    let b = g.constant(vec![vec![1.0], vec![2.0]], DType::F32);
    let c = g.matmul(&a, &b, false, false);

    let err = eval.run(&c, &mut ExecContext::new()).unwrap_err();
    match err {
        Error::Eval { node, .. } => assert_eq!(node, c.name),
        other => panic!("expected Eval envelope, got {other}"),
    }
}

// ─────────────────────────────────────────────────────────────────────
// Session cache behavior
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_buffer_cache_identity() {
    let Some((cache, _)) = session() else { return };
    let shape = Shape::from(4);
    let v = Value::from(vec![1.0, 2.0, 3.0, 4.0]);
    let a = cache
        .convert_to_device(&v, &shape, DType::F32, "cache_probe")
        .unwrap();
    let b = cache
        .convert_to_device(&v, &shape, DType::F32, "cache_probe")
        .unwrap();
    assert!(Rc::ptr_eq(&a, &b), "same (name, shape) must reuse the buffer");

    let c = cache
        .convert_to_device(&v, &Shape::from((4, 1)), DType::F32, "cache_probe")
        .unwrap();
    assert!(!Rc::ptr_eq(&a, &c), "different shape must not reuse");
}

#[test]
fn test_result_buffer_cache() {
    let Some((cache, _)) = session() else { return };
    let shape = Shape::from((2, 2));
    let a = cache.result_buffer(DType::F32, &shape, "probe").unwrap();
    let b = cache.result_buffer(DType::F32, &shape, "probe").unwrap();
    assert!(Rc::ptr_eq(&a, &b));
}

#[test]
fn test_kernel_build_failure_surfaces_log() {
    let Some(_) = session() else { return };
    let dir = std::env::temp_dir().join("vole_bad_kernels");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("broken.cl"), "__kernel void nope( {").unwrap();

    let cache = SessionCache::with_kernel_dir(&dir).unwrap();
    let err = cache.program("broken").unwrap_err();
    assert!(matches!(err, Error::KernelBuildFailure { ref op, .. } if op == "broken"));
}
