use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use vole_core::{bail, DType, Error, NodeKind, NodeRef, Op, Result, Shape, Value};

use crate::buffer::BufRef;
use crate::{dispatch, random, SessionCache};

// Evaluator — Memoized graph walk over the device queue
//
// The walker is an explicit worklist: each node is Entered (memo check,
// dependencies pushed) and later Executed once every dependency it chose to
// evaluate is memoized. The host side is strictly sequential; kernels
// overlap on the device because enqueues only wait on their operands'
// events. Host reads happen at the final result conversion and inside the
// few ops that genuinely need host data (broadcast materialization,
// reshape with -1, reductions, argmin/argmax, index, truncate).

/// Evaluator construction options.
#[derive(Clone, Default)]
pub struct EvaluatorOptions {
    /// Record every operation's host value into the context history.
    /// Forces a device sync per node; debugging only.
    pub log_intermediates: bool,
    /// Reserved for parallel walks; the evaluator is synchronous today.
    pub thread_pool: Option<Arc<rayon::ThreadPool>>,
}

/// One history record per computed operation when `log_intermediates` is
/// set.
#[derive(Debug, Clone)]
pub struct ComputeRecord {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
    pub source: Option<String>,
    pub description: String,
    pub value: Value,
}

/// Per-`run` execution context: placeholder feeds, the per-node memo, the
/// retain set, and the compute history.
#[derive(Default)]
pub struct ExecContext {
    feeds: HashMap<String, Value>,
    memo: HashMap<String, Evaluated>,
    retain: HashSet<String>,
    pub history: Vec<ComputeRecord>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply a placeholder value.
    pub fn feed(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.feeds.insert(name.to_string(), value.into());
        self
    }

    pub fn with_feed(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.feed(name, value);
        self
    }

    /// Mark a node as retained: the walker returns it unevaluated.
    pub fn retain(&mut self, name: &str) -> &mut Self {
        self.retain.insert(name.to_string());
        self
    }

    /// The memoized result of a node, if it was computed this run.
    pub fn memoized(&self, name: &str) -> Option<&Evaluated> {
        self.memo.get(name)
    }
}

/// The result of walking one node.
#[derive(Clone)]
pub enum Evaluated {
    /// A materialized device buffer.
    Buffer(BufRef),
    /// A list result (`flow_group`, `broadcast_transform`, ...).
    List(Vec<Evaluated>),
    /// A node from the retain set, returned as-is.
    Retained(NodeRef),
}

impl Evaluated {
    pub fn as_buffer(&self) -> Result<BufRef> {
        match self {
            Evaluated::Buffer(buf) => Ok(buf.clone()),
            Evaluated::List(_) => Err(Error::msg("expected a buffer, found a list result")),
            Evaluated::Retained(node) => Err(Error::msg(format!(
                "retained node '{}' used as an operand",
                node.name
            ))),
        }
    }
}

enum Task {
    Enter(NodeRef),
    Exec(NodeRef),
    Alias { from: String, to: String },
}

/// The evaluator. Holds the session cache and options; all per-run state
/// lives in the [`ExecContext`].
pub struct Evaluator {
    cache: Rc<SessionCache>,
    options: EvaluatorOptions,
}

impl Evaluator {
    pub fn new(cache: Rc<SessionCache>, options: EvaluatorOptions) -> Self {
        Evaluator { cache, options }
    }

    pub fn cache(&self) -> &Rc<SessionCache> {
        &self.cache
    }

    /// Evaluate a node and read its result back as a nested host value.
    pub fn run(&self, node: &NodeRef, ctx: &mut ExecContext) -> Result<Value> {
        let evaluated = self.run_node(node, ctx)?;
        self.complete_eval(&evaluated)
    }

    /// Walk the graph below `root`, memoizing one result per node.
    pub fn run_node(&self, root: &NodeRef, ctx: &mut ExecContext) -> Result<Evaluated> {
        let mut stack = vec![Task::Enter(root.clone())];
        while let Some(task) = stack.pop() {
            match task {
                Task::Enter(node) => {
                    if ctx.memo.contains_key(&node.name) {
                        continue;
                    }
                    if ctx.retain.contains(&node.name) {
                        ctx.memo
                            .insert(node.name.clone(), Evaluated::Retained(node.clone()));
                        continue;
                    }
                    if let NodeKind::Thunk(producer) = &node.kind {
                        let produced = producer();
                        stack.push(Task::Alias {
                            from: node.name.clone(),
                            to: produced.name.clone(),
                        });
                        stack.push(Task::Enter(produced));
                        continue;
                    }
                    stack.push(Task::Exec(node.clone()));
                    for dep in eval_deps(&node) {
                        stack.push(Task::Enter(dep));
                    }
                }
                Task::Exec(node) => {
                    if ctx.memo.contains_key(&node.name) {
                        continue;
                    }
                    let result = self.exec_node(&node, ctx).map_err(|e| {
                        Error::at_node(
                            &node.name,
                            node.source.clone().unwrap_or_else(|| node.description()),
                            e,
                        )
                    })?;
                    self.after_exec(&node, &result, ctx)?;
                    ctx.memo.insert(node.name.clone(), result);
                }
                Task::Alias { from, to } => {
                    if let Some(result) = ctx.memo.get(&to).cloned() {
                        ctx.memo.insert(from, result);
                    }
                }
            }
        }
        ctx.memo
            .get(&root.name)
            .cloned()
            .ok_or_else(|| Error::msg(format!("node '{}' was never evaluated", root.name)))
    }

    /// Finalize: read each result buffer with its pending event as the
    /// wait list, await queue completion, and convert to nested values.
    pub fn complete_eval(&self, evaluated: &Evaluated) -> Result<Value> {
        match evaluated {
            Evaluated::Buffer(buf) => {
                buf.borrow_mut().read_to_host()?;
                self.cache.queue().finish().map_err(Error::device)?;
                Ok(buf.borrow().to_value())
            }
            Evaluated::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|i| self.complete_eval(i))
                    .collect::<Result<_>>()?,
            )),
            Evaluated::Retained(node) => Err(Error::msg(format!(
                "retained node '{}' has no materialized value",
                node.name
            ))),
        }
    }

    // Node execution

    fn exec_node(&self, node: &NodeRef, ctx: &mut ExecContext) -> Result<Evaluated> {
        match &node.kind {
            NodeKind::Constant { value } => self.eval_constant(node, value),
            NodeKind::Placeholder => self.eval_placeholder(node, ctx),
            NodeKind::Variable { init } => self.eval_variable(node, init.as_ref()),
            NodeKind::Operation { op, items } => self.eval_operation(node, op, items, ctx),
            NodeKind::Thunk(_) => unreachable!("thunks are aliased during Enter"),
        }
    }

    fn eval_constant(&self, node: &NodeRef, value: &Value) -> Result<Evaluated> {
        if node.is_const {
            // Upload once; later runs reuse the session-cached object
            // without refilling.
            if let Some(buf) = self.cache.cached_buffer(&node.name, &node.shape) {
                return Ok(Evaluated::Buffer(buf));
            }
        }
        let buf = self
            .cache
            .convert_to_device(value, &node.shape, node.dtype, &node.name)?;
        Ok(Evaluated::Buffer(buf))
    }

    fn eval_placeholder(&self, node: &NodeRef, ctx: &ExecContext) -> Result<Evaluated> {
        let value = ctx
            .feeds
            .get(&node.name)
            .cloned()
            .ok_or_else(|| Error::MissingPlaceholder {
                name: node.name.clone(),
            })?;
        let shape = value.shape();
        let buf = self
            .cache
            .convert_to_device(&value, &shape, node.dtype, &node.name)?;
        Ok(Evaluated::Buffer(buf))
    }

    fn eval_variable(&self, node: &NodeRef, init: Option<&Value>) -> Result<Evaluated> {
        let existing = self.cache.variable(&node.name);
        let assigned = existing
            .as_ref()
            .map(|b| b.borrow().dirty)
            .unwrap_or(false);
        if init.is_none() && !assigned {
            return Err(Error::UninitializedVariable {
                name: node.name.clone(),
            });
        }
        if let Some(buf) = existing {
            return Ok(Evaluated::Buffer(buf));
        }
        // First use: upload the initial value into the variable's slot.
        let init = init.expect("checked above");
        let shape = if node.shape.rank() > 0 {
            node.shape.clone()
        } else {
            init.shape()
        };
        let buf = self
            .cache
            .convert_to_device(init, &shape, node.dtype, &node.name)?;
        self.cache.set_variable(&node.name, buf.clone());
        Ok(Evaluated::Buffer(buf))
    }

    fn eval_operation(
        &self,
        node: &NodeRef,
        op: &Op,
        items: &[NodeRef],
        ctx: &mut ExecContext,
    ) -> Result<Evaluated> {
        if op.is_binary_elementwise() {
            let a = input_buffer(ctx, items, 0)?;
            let b = input_buffer(ctx, items, 1)?;
            let out = dispatch::execute_binary(&self.cache, op.tag(), &a, &b, &node.name)?;
            return Ok(Evaluated::Buffer(out));
        }
        if op.is_unary_elementwise() {
            let a = input_buffer(ctx, items, 0)?;
            let out = dispatch::execute_unary(&self.cache, op.tag(), &a, &node.name)?;
            return Ok(Evaluated::Buffer(out));
        }

        match op {
            Op::Identity => Ok(input(ctx, items, 0)?.clone()),

            Op::Assign => {
                let target = item(items, 0)?;
                let value = input_buffer(ctx, items, 1)?;
                self.assign_variable(target, &value)
            }

            Op::AssignAdd => {
                let target = item(items, 0)?;
                let var = input_buffer(ctx, items, 0)?;
                let addend = input_buffer(ctx, items, 1)?;
                let sum = dispatch::execute_binary(&self.cache, "add", &var, &addend, &node.name)?;
                self.assign_variable(target, &sum)
            }

            Op::FlowGroup => {
                // Every item was evaluated for effect; return the list.
                let list = items
                    .iter()
                    .map(|item| {
                        ctx.memo.get(&item.name).cloned().ok_or_else(|| {
                            Error::msg(format!("flow_group item '{}' missing", item.name))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Evaluated::List(list))
            }

            Op::MatMul {
                transpose_a,
                transpose_b,
            } => {
                let a = input_buffer(ctx, items, 0)?;
                let b = input_buffer(ctx, items, 1)?;
                let out = dispatch::execute_matmul(
                    &self.cache,
                    &a,
                    &b,
                    *transpose_a,
                    *transpose_b,
                    &node.name,
                )?;
                Ok(Evaluated::Buffer(out))
            }

            Op::Zeros => self.upload_fill(node, node.shape.clone(), 0.0),
            Op::Ones => self.upload_fill(node, node.shape.clone(), 1.0),
            Op::ZerosLike => {
                let shape = input_buffer(ctx, items, 0)?.borrow().shape.clone();
                self.upload_fill(node, shape, 0.0)
            }
            Op::OnesLike => {
                let shape = input_buffer(ctx, items, 0)?.borrow().shape.clone();
                self.upload_fill(node, shape, 1.0)
            }

            Op::BroadcastTransform => {
                let a = input_buffer(ctx, items, 0)?;
                let b = input_buffer(ctx, items, 1)?;
                let (sa, sb) = (a.borrow().shape.clone(), b.borrow().shape.clone());
                if sa == sb {
                    return Ok(Evaluated::List(vec![
                        Evaluated::Buffer(a),
                        Evaluated::Buffer(b),
                    ]));
                }
                let target = Shape::broadcast_shape(&sa, &sb)?;
                let a2 = dispatch::materialize_broadcast(&self.cache, &a, &target)?;
                let b2 = dispatch::materialize_broadcast(&self.cache, &b, &target)?;
                Ok(Evaluated::List(vec![
                    Evaluated::Buffer(a2),
                    Evaluated::Buffer(b2),
                ]))
            }

            Op::BroadcastGradientArgs => {
                let sa = self.read_shape_operand(ctx, items, 0)?;
                let sb = self.read_shape_operand(ctx, items, 1)?;
                let ra = broadcast_gradient_args(&sa, &sb);
                let rb = broadcast_gradient_args(&sb, &sa);
                let buf_a = self.upload(
                    &format!("{}_a", node.name),
                    DType::I32,
                    Shape::from(ra.len()),
                    ra.iter().map(|&x| x as f64).collect(),
                )?;
                let buf_b = self.upload(
                    &format!("{}_b", node.name),
                    DType::I32,
                    Shape::from(rb.len()),
                    rb.iter().map(|&x| x as f64).collect(),
                )?;
                Ok(Evaluated::List(vec![
                    Evaluated::Buffer(buf_a),
                    Evaluated::Buffer(buf_b),
                ]))
            }

            Op::ShapeOf => {
                // Materialized from the declared shape; the operand itself
                // is never evaluated.
                let dims: Vec<f64> = item(items, 0)?
                    .shape
                    .dims()
                    .iter()
                    .map(|&d| d as f64)
                    .collect();
                let buf = self.upload(
                    &node.name,
                    node.dtype,
                    Shape::from(dims.len()),
                    dims,
                )?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::Reshape => {
                let a = input_buffer(ctx, items, 0)?;
                let (spec, _) = self.read_host(&input_buffer(ctx, items, 1)?)?;
                let total = a.borrow().host.len();
                let new_shape = infer_reshape(&spec, total)?;
                // In-place shape update; no data movement.
                a.borrow_mut().shape = new_shape;
                Ok(Evaluated::Buffer(a))
            }

            Op::Index => {
                let (flat, shape) = self.read_host(&input_buffer(ctx, items, 0)?)?;
                let (iflat, _) = self.read_host(&input_buffer(ctx, items, 1)?)?;
                let idx = iflat.first().copied().unwrap_or(0.0) as usize;
                let dims = shape.dims();
                if dims.is_empty() {
                    bail!("index needs a rank >= 1 operand");
                }
                if idx >= dims[0] {
                    bail!("index {} out of bounds for axis 0 of {}", idx, shape);
                }
                let chunk: usize = dims[1..].iter().product::<usize>().max(1);
                let out = flat[idx * chunk..(idx + 1) * chunk].to_vec();
                let buf = self.upload(&node.name, node.dtype, Shape::from(&dims[1..]), out)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::Truncate => {
                let a = input_buffer(ctx, items, 0)?;
                let (tflat, _) = self.read_host(&input_buffer(ctx, items, 1)?)?;
                let target = Shape::new(tflat.iter().map(|&d| d as usize).collect());
                if a.borrow().shape == target {
                    return Ok(Evaluated::Buffer(a));
                }
                let (flat, _) = self.read_host(&a)?;
                let n = target.elem_count().min(flat.len());
                let dtype = a.borrow().dtype;
                let buf = self.upload(&node.name, dtype, target, flat[..n].to_vec())?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::RandomUniform { min, max, seed } => {
                let rng = random::randomizer(&self.cache, &node.graph, op.tag(), *seed);
                let flat = random::uniform_vec(&rng, node.shape.elem_count(), *min, *max);
                let buf = self.upload(&node.name, node.dtype, node.shape.clone(), flat)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::RandomNormal { mean, std, seed } => {
                let rng = random::randomizer(&self.cache, &node.graph, op.tag(), *seed);
                let flat = random::normal_vec(&rng, node.shape.elem_count(), *mean, *std);
                let buf = self.upload(&node.name, node.dtype, node.shape.clone(), flat)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::GlorotUniform { seed } => {
                let rng = random::randomizer(&self.cache, &node.graph, op.tag(), *seed);
                let flat = random::glorot_uniform_vec(&rng, &node.shape);
                let buf = self.upload(&node.name, node.dtype, node.shape.clone(), flat)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::Sum { axes, keepdims } => {
                let (flat, shape) = self.read_host(&input_buffer(ctx, items, 0)?)?;
                let (out, oshape) =
                    reduce(&flat, &shape, axes.as_deref(), *keepdims, |a, b| a + b, 0.0);
                let buf = self.upload(&node.name, node.dtype, oshape, out)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::Prod { axes, keepdims } => {
                let (flat, shape) = self.read_host(&input_buffer(ctx, items, 0)?)?;
                let (out, oshape) =
                    reduce(&flat, &shape, axes.as_deref(), *keepdims, |a, b| a * b, 1.0);
                let buf = self.upload(&node.name, node.dtype, oshape, out)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::ArgMin { axis } => {
                let (flat, shape) = self.read_host(&input_buffer(ctx, items, 0)?)?;
                let (out, oshape) = arg_extremum(&flat, &shape, *axis, false)?;
                let buf = self.upload(&node.name, DType::I32, oshape, out)?;
                Ok(Evaluated::Buffer(buf))
            }

            Op::ArgMax { axis } => {
                let (flat, shape) = self.read_host(&input_buffer(ctx, items, 0)?)?;
                let (out, oshape) = arg_extremum(&flat, &shape, *axis, true)?;
                let buf = self.upload(&node.name, DType::I32, oshape, out)?;
                Ok(Evaluated::Buffer(buf))
            }

            // Elementwise ops were handled before the match.
            other => Err(Error::UnknownOp(other.tag().to_string())),
        }
    }

    // Helpers

    fn assign_variable(&self, target: &NodeRef, value: &BufRef) -> Result<Evaluated> {
        if !matches!(target.kind, NodeKind::Variable { .. }) {
            bail!("assign target '{}' is not a variable", target.name);
        }
        if let Some(existing) = self.cache.variable(&target.name) {
            // Device-to-device overwrite of the prior buffer.
            dispatch::copy_buffer(value, &existing)?;
            Ok(Evaluated::Buffer(existing))
        } else {
            // First assignment: create a fresh buffer from the host form.
            let host = self.complete_eval(&Evaluated::Buffer(value.clone()))?;
            let shape = value.borrow().shape.clone();
            let buf = self
                .cache
                .convert_to_device(&host, &shape, target.dtype, &target.name)?;
            buf.borrow_mut().dirty = true;
            self.cache.set_variable(&target.name, buf.clone());
            Ok(Evaluated::Buffer(buf))
        }
    }

    fn upload(&self, name: &str, dtype: DType, shape: Shape, flat: Vec<f64>) -> Result<BufRef> {
        self.cache
            .convert_to_device(&Value::from(flat), &shape, dtype, name)
    }

    fn upload_fill(&self, node: &NodeRef, shape: Shape, fill: f64) -> Result<Evaluated> {
        let flat = vec![fill; shape.elem_count()];
        let buf = self.upload(&node.name, node.dtype, shape, flat)?;
        Ok(Evaluated::Buffer(buf))
    }

    /// Read a buffer to the host: flat f64 data plus its current shape.
    /// A synchronization point; used only by host-data ops.
    fn read_host(&self, buf: &BufRef) -> Result<(Vec<f64>, Shape)> {
        let mut b = buf.borrow_mut();
        b.read_to_host()?;
        Ok((b.host.to_f64_vec(), b.shape.clone()))
    }

    /// Read an operand holding a shape vector.
    fn read_shape_operand(
        &self,
        ctx: &ExecContext,
        items: &[NodeRef],
        i: usize,
    ) -> Result<Vec<usize>> {
        let (flat, _) = self.read_host(&input_buffer(ctx, items, i)?)?;
        Ok(flat.iter().map(|&d| d as usize).collect())
    }

    /// Breakpoint hook and history recording after a node computes.
    fn after_exec(&self, node: &NodeRef, result: &Evaluated, ctx: &mut ExecContext) -> Result<()> {
        let NodeKind::Operation { items, .. } = &node.kind else {
            return Ok(());
        };
        let hook = node.breakpoint.borrow().clone();
        if let Some(hook) = hook {
            let mut inputs = Vec::with_capacity(items.len());
            for item in items {
                match ctx.memo.get(&item.name) {
                    Some(e) => inputs.push(self.complete_eval(e)?),
                    None => inputs.push(Value::List(vec![])),
                }
            }
            let value = self.complete_eval(result)?;
            hook(&node.name, &inputs, &value);
        }
        if self.options.log_intermediates {
            let value = self.complete_eval(result)?;
            let shape = match result {
                Evaluated::Buffer(buf) => buf.borrow().shape.clone(),
                _ => Shape::scalar(),
            };
            log::trace!("computed '{}' {} {}", node.name, node.dtype, shape);
            ctx.history.push(ComputeRecord {
                name: node.name.clone(),
                dtype: node.dtype,
                shape,
                source: node.source.clone(),
                description: node.description(),
                value,
            });
        }
        Ok(())
    }
}

/// The children a node evaluates before executing. Most ops evaluate every
/// item; `assign` must not evaluate its target (assigning to an
/// uninitialized variable is the initialization path), and generator ops
/// have nothing to evaluate.
fn eval_deps(node: &NodeRef) -> Vec<NodeRef> {
    match &node.kind {
        NodeKind::Operation { op, items } => match op {
            Op::Assign => items.get(1).cloned().into_iter().collect(),
            Op::Zeros
            | Op::Ones
            | Op::ShapeOf
            | Op::RandomUniform { .. }
            | Op::RandomNormal { .. }
            | Op::GlorotUniform { .. } => vec![],
            _ => items.clone(),
        },
        _ => vec![],
    }
}

fn item(items: &[NodeRef], i: usize) -> Result<&NodeRef> {
    items
        .get(i)
        .ok_or_else(|| Error::msg(format!("operation is missing input {}", i)))
}

fn input<'c>(ctx: &'c ExecContext, items: &[NodeRef], i: usize) -> Result<&'c Evaluated> {
    let item = item(items, i)?;
    ctx.memo
        .get(&item.name)
        .ok_or_else(|| Error::msg(format!("input '{}' was not evaluated", item.name)))
}

fn input_buffer(ctx: &ExecContext, items: &[NodeRef], i: usize) -> Result<BufRef> {
    input(ctx, items, i)?.as_buffer()
}

// Host-side reduction and argument helpers

/// Fold `flat` along the given axes (all axes when `None`). Negative axes
/// count from the back; axes are processed from largest to smallest so
/// earlier indices stay stable. With `keepdims`, reduced axes stay in the
/// output shape with extent 1.
pub fn reduce(
    flat: &[f64],
    shape: &Shape,
    axes: Option<&[i64]>,
    keepdims: bool,
    fold: impl Fn(f64, f64) -> f64 + Copy,
    init: f64,
) -> (Vec<f64>, Shape) {
    let rank = shape.rank();
    let Some(axes) = axes else {
        let total = flat.iter().copied().fold(init, fold);
        let oshape = if keepdims {
            Shape::new(vec![1; rank])
        } else {
            Shape::scalar()
        };
        return (vec![total], oshape);
    };

    let mut ax: Vec<usize> = axes
        .iter()
        .map(|&x| {
            if x < 0 {
                (rank as i64 + x).max(0) as usize
            } else {
                x as usize
            }
        })
        .collect();
    ax.sort_unstable();
    ax.dedup();

    let mut data = flat.to_vec();
    let mut dims = shape.dims().to_vec();
    for &axis in ax.iter().rev() {
        let (d, nd) = reduce_axis(&data, &dims, axis, fold, init);
        data = d;
        dims = nd;
    }
    if keepdims {
        let mut kd = shape.dims().to_vec();
        for &axis in &ax {
            kd[axis] = 1;
        }
        (data, Shape::new(kd))
    } else {
        (data, Shape::new(dims))
    }
}

fn reduce_axis(
    data: &[f64],
    dims: &[usize],
    axis: usize,
    fold: impl Fn(f64, f64) -> f64,
    init: f64,
) -> (Vec<f64>, Vec<usize>) {
    let len = dims[axis];
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let mut out = vec![init; (outer * inner).max(1)];
    for o in 0..outer {
        for j in 0..len {
            for i in 0..inner {
                let v = data[(o * len + j) * inner + i];
                let slot = &mut out[o * inner + i];
                *slot = fold(*slot, v);
            }
        }
    }
    let mut ndims = dims.to_vec();
    ndims.remove(axis);
    (out, ndims)
}

/// Index of the extremum along `axis` (default semantics: axis 0, negative
/// counts from the back). First-seen value wins ties.
pub fn arg_extremum(
    flat: &[f64],
    shape: &Shape,
    axis: i64,
    take_max: bool,
) -> Result<(Vec<f64>, Shape)> {
    let rank = shape.rank();
    if rank == 0 {
        return Ok((vec![0.0], Shape::scalar()));
    }
    let axis = if axis < 0 { rank as i64 + axis } else { axis };
    if axis < 0 || axis as usize >= rank {
        return Err(Error::msg(format!(
            "axis {} out of range for rank {}",
            axis, rank
        )));
    }
    let axis = axis as usize;
    let dims = shape.dims();
    let len = dims[axis];
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let mut out = Vec::with_capacity(outer * inner.max(1));
    for o in 0..outer {
        for i in 0..inner {
            let mut best = 0usize;
            let mut best_v = flat[o * len * inner + i];
            for j in 1..len {
                let v = flat[(o * len + j) * inner + i];
                if (take_max && v > best_v) || (!take_max && v < best_v) {
                    best = j;
                    best_v = v;
                }
            }
            out.push(best as f64);
        }
    }
    let mut ndims = dims.to_vec();
    ndims.remove(axis);
    Ok((out, Shape::new(ndims)))
}

/// Reduction axes needed to fold a gradient of `shape_a`'s extent back to
/// `shape_b`, walking reversed indices. Preserves the source behavior of
/// skipping axes where `shape_b` is the larger side.
pub fn broadcast_gradient_args(shape_a: &[usize], shape_b: &[usize]) -> Vec<i64> {
    if shape_a == shape_b {
        return vec![];
    }
    let ra = shape_a.len();
    let rb = shape_b.len();
    let mut out = Vec::new();
    for i in 0..ra {
        let a_dim = shape_a[ra - 1 - i];
        if i >= rb {
            out.push((ra - i - 1) as i64);
            continue;
        }
        let b_dim = shape_b[rb - 1 - i];
        if b_dim >= a_dim {
            continue;
        }
        out.push((ra - i - 1) as i64);
    }
    out
}

/// Resolve a reshape spec, inferring at most one `-1` dimension from the
/// operand's element count.
pub fn infer_reshape(spec: &[f64], total: usize) -> Result<Shape> {
    let mut dims: Vec<i64> = spec.iter().map(|&d| d as i64).collect();
    let known: i64 = dims.iter().filter(|&&d| d != -1).product();
    if let Some(pos) = dims.iter().position(|&d| d == -1) {
        if known == 0 || total as i64 % known != 0 {
            bail!(
                "cannot infer -1 in reshape to {:?} from {} elements",
                dims,
                total
            );
        }
        dims[pos] = total as i64 / known;
    }
    let product: i64 = dims.iter().product();
    if product.max(1) != total as i64 {
        bail!(
            "cannot reshape {} elements into {:?} ({} elements)",
            total,
            dims,
            product
        );
    }
    Ok(Shape::new(dims.iter().map(|&d| d as usize).collect()))
}
