//! Dynamic tensor compute graph with automatic operation batching.
//!
//! Graphs are built one primitive operation per node ([`graph::Variable`]
//! edges carry tensor values between [`graph::Node`]s) and evaluated on
//! demand. The engine's distinguishing feature is that evaluation discovers,
//! at run time, sets of independent nodes that can execute as a single wide
//! tensor operation: many small kernel launches become few large ones,
//! without any visible transformation of the user's graph.
//!
//! Forward, [`engine::BatchEngine::value`] pops ready operations off a
//! three-class schedule, gathers their operands into batched tensors
//! (splicing, or recovering an existing batch with a slice view), runs one
//! kernel and leaves lazy back-references on the original outputs. Backward,
//! [`engine::BatchEngine::backward`] follows those back-references so
//! gradients flow through the batched operations, pulling each requested
//! parameter's gradient from its consumers.

#![recursion_limit = "512"]

pub mod arena;
pub mod dtype;
pub mod engine;
pub mod graph;
pub mod ops;
pub mod tensor;

pub use arena::{ArenaAllocator, ArenaStats, ARENA_SIZE};
pub use dtype::DType;
pub use engine::{BatchEngine, EngineStats};
pub use graph::{ConsumerList, Node, VarKind, Variable, VariableFields};
pub use ops::{AttrValue, Attributes, OpCode};
pub use tensor::Tensor;
