//! Core intermediate representation and pass contract for vesper.
//!
//! This crate provides the foundation the compiler and operator crates build on:
//! - Arena-based IR (`Graph`, `StageNode`, `TensorDesc`, `Edge`)
//! - Operator variants (`Op`) and their per-pass contract (`StageOp`)
//! - Layout descriptors (`MemoryOrder`, `StrideRequirement`, `BatchSupport`)
//! - The `Pass` trait and ordered compile `Phase`s
//! - The constant-folding registry type (`FoldRegistry`)
//! - Memory-plan types and the backend serialization sinks

pub mod broadcast;
pub mod dot;
pub mod edit;
pub mod error;
pub mod ir;
pub mod layout;
pub mod ops;
pub mod pass;
pub mod plan;
pub mod registry;
pub mod serialize;
pub mod stage;
pub mod types;

// Re-export commonly used types
pub use broadcast::broadcast_shape;
pub use edit::{GraphEdit, PendingEdits};
pub use error::{Diagnostic, Error, Result};
pub use ir::{
    Edge, Graph, Port, StageId, StageNode, StateId, TempBuffer, TensorContent, TensorDesc,
    TensorId,
};
pub use layout::{BatchSupport, MemoryOrder, StrideRequirement};
pub use ops::{Op, OpKind};
pub use pass::{Pass, Phase};
pub use plan::{Allocation, Lifetime, MemoryPlan, Region};
pub use registry::{ConstantFolder, FoldCtx, FoldRegistry};
pub use serialize::{
    BackendSerializer, Binding, BlobSerializer, DataRef, DataSink, StageRecord,
};
pub use stage::{Arity, Count, OrderRequest, StageCtx, StageOp};
pub use types::{DataType, TensorData, TensorValue};
