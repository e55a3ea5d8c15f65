use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::shape::Shape;
use crate::value::Value;
use crate::{Error, Result};

// Graph — The symbolic computation graph the evaluator consumes
//
// A graph is a bag of immutable nodes. Each node is identified by a unique
// name and is either a constant, a placeholder, a variable, a deferred
// thunk, or an operation over other nodes. The operation set is sealed:
// dispatch is a total match over `Op`, and external tags map onto it
// through `Op::parse`.

static GRAPH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A computation graph. Holds the graph-level random seed and hands out
/// unique node names. Nodes keep an `Rc` back to their graph.
pub struct Graph {
    id: u64,
    /// Graph-level random seed; combined with per-op seeds by the
    /// randomizer policy.
    pub seed: Option<u64>,
    counter: Cell<u64>,
}

impl Graph {
    pub fn new() -> Rc<Self> {
        Rc::new(Graph {
            id: GRAPH_COUNTER.fetch_add(1, Ordering::Relaxed),
            seed: None,
            counter: Cell::new(0),
        })
    }

    pub fn with_seed(seed: u64) -> Rc<Self> {
        Rc::new(Graph {
            id: GRAPH_COUNTER.fetch_add(1, Ordering::Relaxed),
            seed: Some(seed),
            counter: Cell::new(0),
        })
    }

    /// Stable identity for session-scoped caches keyed by graph.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn next_name(&self, tag: &str) -> String {
        let n = self.counter.get();
        self.counter.set(n + 1);
        format!("{}_{}", tag, n)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("seed", &self.seed)
            .finish()
    }
}

/// Shared reference to a graph node.
pub type NodeRef = Rc<Node>;

/// A deferred node producer; invoked when the walker encounters it.
pub type Thunk = Rc<dyn Fn() -> NodeRef>;

/// A per-node debug hook: `(node name, host-form inputs, host-form result)`.
pub type BreakpointHook = Rc<dyn Fn(&str, &[Value], &Value)>;

// Op — The sealed operation set

/// Every operation the evaluator dispatches on. The set is closed; adding
/// an operation means adding a variant here, its kernel file (if any), and
/// its arm in the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // Elementwise two-operand
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    SigmoidGrad,

    // Elementwise unary
    Sign,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Abs,
    Sqrt,
    Negate,
    Square,
    Reciprocal,
    Tanh,
    TanhGrad,
    Sigmoid,

    // Control and assignment
    Identity,
    Assign,
    AssignAdd,
    FlowGroup,

    // Linear algebra
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
    },

    // Fills
    Zeros,
    Ones,
    ZerosLike,
    OnesLike,

    // Broadcasting
    BroadcastTransform,
    BroadcastGradientArgs,

    // Shape ops
    ShapeOf,
    Reshape,
    Index,
    Truncate,

    // Random generators
    RandomUniform {
        min: f64,
        max: f64,
        seed: Option<u64>,
    },
    RandomNormal {
        mean: f64,
        std: f64,
        seed: Option<u64>,
    },
    GlorotUniform {
        seed: Option<u64>,
    },

    // Reductions
    Sum {
        axes: Option<Vec<i64>>,
        keepdims: bool,
    },
    Prod {
        axes: Option<Vec<i64>>,
        keepdims: bool,
    },
    ArgMin {
        axis: i64,
    },
    ArgMax {
        axis: i64,
    },
}

impl Op {
    /// The external tag for this operation.
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Pow => "pow",
            Op::SigmoidGrad => "sigmoid_grad",
            Op::Sign => "sign",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Tan => "tan",
            Op::Abs => "abs",
            Op::Sqrt => "sqrt",
            Op::Negate => "negate",
            Op::Square => "square",
            Op::Reciprocal => "reciprocal",
            Op::Tanh => "tanh",
            Op::TanhGrad => "tanh_grad",
            Op::Sigmoid => "sigmoid",
            Op::Identity => "identity",
            Op::Assign => "assign",
            Op::AssignAdd => "assign_add",
            Op::FlowGroup => "flow_group",
            Op::MatMul { .. } => "matmul",
            Op::Zeros => "zeros",
            Op::Ones => "ones",
            Op::ZerosLike => "zeros_like",
            Op::OnesLike => "ones_like",
            Op::BroadcastTransform => "broadcast_transform",
            Op::BroadcastGradientArgs => "broadcast_gradient_args",
            Op::ShapeOf => "shape",
            Op::Reshape => "reshape",
            Op::Index => "index",
            Op::Truncate => "truncate",
            Op::RandomUniform { .. } => "random_uniform",
            Op::RandomNormal { .. } => "random_normal",
            Op::GlorotUniform { .. } => "glorot_uniform",
            Op::Sum { .. } => "sum",
            Op::Prod { .. } => "prod",
            Op::ArgMin { .. } => "argmin",
            Op::ArgMax { .. } => "argmax",
        }
    }

    /// The kernel source file an operation compiles from, when it has one.
    /// Elementwise ops map to `<tag>.cl`; matmul maps to `gemm.cl`.
    pub fn kernel_name(&self) -> Option<&'static str> {
        if self.is_binary_elementwise() || self.is_unary_elementwise() {
            Some(self.tag())
        } else if matches!(self, Op::MatMul { .. }) {
            Some("gemm")
        } else {
            None
        }
    }

    pub fn is_binary_elementwise(&self) -> bool {
        matches!(
            self,
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow | Op::SigmoidGrad
        )
    }

    pub fn is_unary_elementwise(&self) -> bool {
        matches!(
            self,
            Op::Sign
                | Op::Exp
                | Op::Log
                | Op::Sin
                | Op::Cos
                | Op::Tan
                | Op::Abs
                | Op::Sqrt
                | Op::Negate
                | Op::Square
                | Op::Reciprocal
                | Op::Tanh
                | Op::TanhGrad
                | Op::Sigmoid
        )
    }

    /// The per-op random seed, for the random generator ops.
    pub fn seed(&self) -> Option<u64> {
        match self {
            Op::RandomUniform { seed, .. }
            | Op::RandomNormal { seed, .. }
            | Op::GlorotUniform { seed } => *seed,
            _ => None,
        }
    }

    /// Map an external operation tag onto the sealed set. Parameterized
    /// operations come back with their defaults; an unrecognized tag is an
    /// `UnknownOp` error.
    pub fn parse(tag: &str) -> Result<Op> {
        Ok(match tag {
            "add" => Op::Add,
            "sub" => Op::Sub,
            "mul" => Op::Mul,
            "div" => Op::Div,
            "pow" => Op::Pow,
            "sigmoid_grad" => Op::SigmoidGrad,
            "sign" => Op::Sign,
            "exp" => Op::Exp,
            "log" => Op::Log,
            "sin" => Op::Sin,
            "cos" => Op::Cos,
            "tan" => Op::Tan,
            "abs" => Op::Abs,
            "sqrt" => Op::Sqrt,
            "negate" => Op::Negate,
            "square" => Op::Square,
            "reciprocal" => Op::Reciprocal,
            "tanh" => Op::Tanh,
            "tanh_grad" => Op::TanhGrad,
            "sigmoid" => Op::Sigmoid,
            "identity" => Op::Identity,
            "assign" => Op::Assign,
            "assign_add" => Op::AssignAdd,
            "flow_group" => Op::FlowGroup,
            "matmul" | "mat_mul" => Op::MatMul {
                transpose_a: false,
                transpose_b: false,
            },
            "zeros" => Op::Zeros,
            "ones" => Op::Ones,
            "zeros_like" => Op::ZerosLike,
            "ones_like" => Op::OnesLike,
            "broadcast_transform" => Op::BroadcastTransform,
            "broadcast_gradient_args" => Op::BroadcastGradientArgs,
            "shape" => Op::ShapeOf,
            "reshape" => Op::Reshape,
            "index" => Op::Index,
            "truncate" => Op::Truncate,
            "random_uniform" => Op::RandomUniform {
                min: 0.0,
                max: 1.0,
                seed: None,
            },
            "random_standard_normal" | "random_normal" => Op::RandomNormal {
                mean: 0.0,
                std: 1.0,
                seed: None,
            },
            "glorot_uniform" => Op::GlorotUniform { seed: None },
            "sum" | "reduce_sum" => Op::Sum {
                axes: None,
                keepdims: false,
            },
            "prod" | "reduce_prod" => Op::Prod {
                axes: None,
                keepdims: false,
            },
            "argmin" => Op::ArgMin { axis: 0 },
            "argmax" => Op::ArgMax { axis: 0 },
            other => return Err(Error::UnknownOp(other.to_string())),
        })
    }
}

// Node

/// What a node is: a materializable leaf or an operation over other nodes.
pub enum NodeKind {
    /// A literal tensor; uploaded once and memoized when `is_const`.
    Constant { value: Value },
    /// A named input supplied per evaluation through the feed map.
    Placeholder,
    /// A named mutable tensor. Its device buffer slot lives in the session
    /// cache, keyed by name, and persists across `run` calls.
    Variable { init: Option<Value> },
    /// An operation over `items`.
    Operation { op: Op, items: Vec<NodeRef> },
    /// A deferred producer, invoked when the walker reaches it.
    Thunk(Thunk),
}

/// An immutable graph node.
pub struct Node {
    pub name: String,
    pub dtype: DType,
    /// Declared shape. Placeholders may be declared with a best-effort
    /// shape; their concrete shape comes from the fed value at run time.
    pub shape: Shape,
    pub kind: NodeKind,
    /// Provenance: where in user code this node was constructed.
    pub source: Option<String>,
    pub is_const: bool,
    /// Debug hook invoked with host-form inputs and result after the node
    /// computes. Settable after construction.
    pub breakpoint: RefCell<Option<BreakpointHook>>,
    pub graph: Rc<Graph>,
}

impl Node {
    /// The operation of an `Operation` node.
    pub fn op(&self) -> Option<&Op> {
        match &self.kind {
            NodeKind::Operation { op, .. } => Some(op),
            _ => None,
        }
    }

    /// The input nodes of an `Operation` node (empty otherwise).
    pub fn items(&self) -> &[NodeRef] {
        match &self.kind {
            NodeKind::Operation { items, .. } => items,
            _ => &[],
        }
    }

    /// Human-readable description for history records and errors.
    pub fn description(&self) -> String {
        match &self.kind {
            NodeKind::Constant { .. } => format!("const {}", self.name),
            NodeKind::Placeholder => format!("placeholder {}", self.name),
            NodeKind::Variable { .. } => format!("variable {}", self.name),
            NodeKind::Thunk(_) => format!("thunk {}", self.name),
            NodeKind::Operation { op, items } => {
                let args: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
                format!("{}({})", op.tag(), args.join(", "))
            }
        }
    }

    pub fn set_breakpoint(&self, hook: BreakpointHook) {
        *self.breakpoint.borrow_mut() = Some(hook);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("desc", &self.description())
            .finish()
    }
}

// Node constructors
//
// Plain constructors, not a builder DSL. `apply` derives a best-effort
// declared shape; ops whose shape is only known at run time (reductions,
// reshape) leave it scalar and the evaluator sizes the result buffer from
// live operands.

impl Graph {
    pub fn constant(self: &Rc<Self>, value: impl Into<Value>, dtype: DType) -> NodeRef {
        let name = self.next_name("const");
        self.constant_named(&name, value, dtype)
    }

    pub fn constant_named(
        self: &Rc<Self>,
        name: &str,
        value: impl Into<Value>,
        dtype: DType,
    ) -> NodeRef {
        let value = value.into();
        let shape = value.shape();
        Rc::new(Node {
            name: name.to_string(),
            dtype,
            shape,
            kind: NodeKind::Constant { value },
            source: None,
            is_const: true,
            breakpoint: RefCell::new(None),
            graph: self.clone(),
        })
    }

    pub fn placeholder(self: &Rc<Self>, name: &str, dtype: DType, shape: Shape) -> NodeRef {
        Rc::new(Node {
            name: name.to_string(),
            dtype,
            shape,
            kind: NodeKind::Placeholder,
            source: None,
            is_const: false,
            breakpoint: RefCell::new(None),
            graph: self.clone(),
        })
    }

    pub fn variable(
        self: &Rc<Self>,
        name: &str,
        dtype: DType,
        shape: Shape,
        init: Option<Value>,
    ) -> NodeRef {
        Rc::new(Node {
            name: name.to_string(),
            dtype,
            shape,
            kind: NodeKind::Variable { init },
            source: None,
            is_const: false,
            breakpoint: RefCell::new(None),
            graph: self.clone(),
        })
    }

    pub fn thunk(self: &Rc<Self>, producer: Thunk, dtype: DType) -> NodeRef {
        let name = self.next_name("thunk");
        Rc::new(Node {
            name,
            dtype,
            shape: Shape::scalar(),
            kind: NodeKind::Thunk(producer),
            source: None,
            is_const: false,
            breakpoint: RefCell::new(None),
            graph: self.clone(),
        })
    }

    /// Generic operation node with a derived declared shape.
    pub fn apply(self: &Rc<Self>, op: Op, items: Vec<NodeRef>, dtype: DType) -> NodeRef {
        let shape = derived_shape(&op, &items);
        self.apply_shaped(op, items, dtype, shape)
    }

    /// Operation node with an explicit declared shape (fills and random
    /// generators).
    pub fn apply_shaped(
        self: &Rc<Self>,
        op: Op,
        items: Vec<NodeRef>,
        dtype: DType,
        shape: Shape,
    ) -> NodeRef {
        let name = self.next_name(op.tag());
        Rc::new(Node {
            name,
            dtype,
            shape,
            kind: NodeKind::Operation { op, items },
            source: None,
            is_const: false,
            breakpoint: RefCell::new(None),
            graph: self.clone(),
        })
    }

    // Thin wrappers for the operations tests build most often.

    pub fn add(self: &Rc<Self>, a: &NodeRef, b: &NodeRef) -> NodeRef {
        let dtype = a.dtype;
        self.apply(Op::Add, vec![a.clone(), b.clone()], dtype)
    }

    pub fn mul(self: &Rc<Self>, a: &NodeRef, b: &NodeRef) -> NodeRef {
        let dtype = a.dtype;
        self.apply(Op::Mul, vec![a.clone(), b.clone()], dtype)
    }

    pub fn matmul(self: &Rc<Self>, a: &NodeRef, b: &NodeRef, ta: bool, tb: bool) -> NodeRef {
        let dtype = a.dtype;
        self.apply(
            Op::MatMul {
                transpose_a: ta,
                transpose_b: tb,
            },
            vec![a.clone(), b.clone()],
            dtype,
        )
    }

    pub fn assign(self: &Rc<Self>, var: &NodeRef, value: &NodeRef) -> NodeRef {
        let dtype = var.dtype;
        self.apply(Op::Assign, vec![var.clone(), value.clone()], dtype)
    }

    pub fn assign_add(self: &Rc<Self>, var: &NodeRef, value: &NodeRef) -> NodeRef {
        let dtype = var.dtype;
        self.apply(Op::AssignAdd, vec![var.clone(), value.clone()], dtype)
    }

    pub fn sum(self: &Rc<Self>, a: &NodeRef, axes: Option<Vec<i64>>, keepdims: bool) -> NodeRef {
        let dtype = a.dtype;
        self.apply(Op::Sum { axes, keepdims }, vec![a.clone()], dtype)
    }

    pub fn reshape(self: &Rc<Self>, a: &NodeRef, new_shape: &NodeRef) -> NodeRef {
        let dtype = a.dtype;
        self.apply(Op::Reshape, vec![a.clone(), new_shape.clone()], dtype)
    }

    pub fn shape_of(self: &Rc<Self>, a: &NodeRef) -> NodeRef {
        self.apply(Op::ShapeOf, vec![a.clone()], DType::I32)
    }
}

fn item_shape(items: &[NodeRef]) -> Shape {
    items
        .first()
        .map(|a| a.shape.clone())
        .unwrap_or_else(Shape::scalar)
}

fn derived_shape(op: &Op, items: &[NodeRef]) -> Shape {
    if op.is_binary_elementwise() {
        if let [a, b] = items {
            if let Ok(s) = Shape::broadcast_shape(&a.shape, &b.shape) {
                return s;
            }
        }
        return Shape::scalar();
    }
    if op.is_unary_elementwise() {
        return item_shape(items);
    }
    match op {
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => {
            if let [a, b] = items {
                let (ad, bd) = (a.shape.dims(), b.shape.dims());
                if ad.len() >= 2 && bd.len() >= 2 {
                    let m = if *transpose_a { ad[1] } else { ad[0] };
                    let n = if *transpose_b { bd[0] } else { bd[1] };
                    return Shape::from((m, n));
                }
            }
            Shape::scalar()
        }
        Op::Identity | Op::Assign | Op::AssignAdd | Op::ZerosLike | Op::OnesLike => {
            item_shape(items)
        }
        Op::ShapeOf => Shape::from(items.first().map(|a| a.shape.rank()).unwrap_or(0)),
        _ => Shape::scalar(),
    }
}
