//! # vole-core
//!
//! Symbolic tensor-graph primitives for the vole evaluator.
//!
//! This crate provides:
//! - [`Graph`] / [`Node`] — the symbolic computation graph (constants,
//!   placeholders, variables, operations)
//! - [`Op`] — the sealed operation set with its kernel-name string table
//! - [`Shape`] — n-dimensional shapes and broadcast shape inference
//! - [`DType`] — data types (fp32, int32, bool)
//! - [`Value`] — nested host-side values fed into and read out of a run
//! - [`Error`] — the single error taxonomy, including the per-node
//!   evaluation envelope

pub mod dtype;
pub mod error;
pub mod graph;
pub mod shape;
pub mod value;

pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use graph::{BreakpointHook, Graph, Node, NodeKind, NodeRef, Op, Thunk};
pub use shape::Shape;
pub use value::Value;
