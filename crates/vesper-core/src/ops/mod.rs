//! Operator variants.
//!
//! [`Op`] is a closed sum type: each variant carries its own typed attribute
//! payload, and each payload implements [`StageOp`]. [`OpKind`] is the
//! fieldless tag used as the constant-folding registry key and in
//! diagnostics.

mod activation;
mod conv;
mod eltwise;
mod generate;
mod indexing;
mod memory;
mod normalization;
mod resample;
mod roi;
mod shape;

use std::fmt;

pub use activation::{Activation, Power};
pub use conv::{Convolution, Pool, PoolKind};
pub use eltwise::BinaryOp;
pub use generate::{Fill, Range};
pub use indexing::{Concat, Gather, Slice, Split, Tile};
pub use memory::{MemoryRead, MemoryWrite};
pub use normalization::{Mvn, Normalize, MVN_MAX_EPS};
pub use resample::{Resample, ResampleMode};
pub use roi::PsRoiPooling;
pub use shape::{InPlace, Passthrough, Permute, Reshape};

use crate::ir::{Port, StateId, TempBuffer};
use crate::layout::{BatchSupport, StrideRequirement};
use crate::serialize::{BlobSerializer, DataSink};
use crate::stage::{Arity, OrderRequest, StageCtx, StageOp};
use crate::Result;

/// Fieldless operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Relu,
    Sigmoid,
    Tanh,
    Clamp,
    Power,
    MaxPool,
    AvgPool,
    Convolution,
    Reshape,
    Squeeze,
    Unsqueeze,
    Flatten,
    Permute,
    Gather,
    Slice,
    Split,
    Concat,
    Tile,
    Fill,
    Range,
    Mvn,
    Normalize,
    Resample,
    PsRoiPooling,
    Copy,
    MemoryRead,
    MemoryWrite,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An operator with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Binary(BinaryOp),
    Activation(Activation),
    Power(Power),
    Pool(Pool),
    Convolution(Convolution),
    Reshape(Reshape),
    InPlace(InPlace),
    Permute(Permute),
    Gather(Gather),
    Slice(Slice),
    Split(Split),
    Concat(Concat),
    Tile(Tile),
    Fill(Fill),
    Range(Range),
    Mvn(Mvn),
    Normalize(Normalize),
    Resample(Resample),
    PsRoiPooling(PsRoiPooling),
    Copy(Passthrough),
    MemoryRead(MemoryRead),
    MemoryWrite(MemoryWrite),
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            Op::Binary($op) => $body,
            Op::Activation($op) => $body,
            Op::Power($op) => $body,
            Op::Pool($op) => $body,
            Op::Convolution($op) => $body,
            Op::Reshape($op) => $body,
            Op::InPlace($op) => $body,
            Op::Permute($op) => $body,
            Op::Gather($op) => $body,
            Op::Slice($op) => $body,
            Op::Split($op) => $body,
            Op::Concat($op) => $body,
            Op::Tile($op) => $body,
            Op::Fill($op) => $body,
            Op::Range($op) => $body,
            Op::Mvn($op) => $body,
            Op::Normalize($op) => $body,
            Op::Resample($op) => $body,
            Op::PsRoiPooling($op) => $body,
            Op::Copy($op) => $body,
            Op::MemoryRead($op) => $body,
            Op::MemoryWrite($op) => $body,
        }
    };
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Binary(op) => op.kind(),
            Op::Activation(op) => op.kind(),
            Op::Power(_) => OpKind::Power,
            Op::Pool(op) => match op.kind {
                PoolKind::Max => OpKind::MaxPool,
                PoolKind::Avg => OpKind::AvgPool,
            },
            Op::Convolution(_) => OpKind::Convolution,
            Op::Reshape(_) => OpKind::Reshape,
            Op::InPlace(op) => op.kind(),
            Op::Permute(_) => OpKind::Permute,
            Op::Gather(_) => OpKind::Gather,
            Op::Slice(_) => OpKind::Slice,
            Op::Split(_) => OpKind::Split,
            Op::Concat(_) => OpKind::Concat,
            Op::Tile(_) => OpKind::Tile,
            Op::Fill(_) => OpKind::Fill,
            Op::Range(_) => OpKind::Range,
            Op::Mvn(_) => OpKind::Mvn,
            Op::Normalize(_) => OpKind::Normalize,
            Op::Resample(_) => OpKind::Resample,
            Op::PsRoiPooling(_) => OpKind::PsRoiPooling,
            Op::Copy(_) => OpKind::Copy,
            Op::MemoryRead(_) => OpKind::MemoryRead,
            Op::MemoryWrite(_) => OpKind::MemoryWrite,
        }
    }

    /// The feedback state a memory stage reads or writes.
    pub fn memory_state(&self) -> Option<StateId> {
        match self {
            Op::MemoryRead(op) => Some(op.state),
            Op::MemoryWrite(op) => Some(op.state),
            _ => None,
        }
    }
}

impl StageOp for Op {
    fn arity(&self) -> Arity {
        dispatch!(self, op => op.arity())
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        dispatch!(self, op => op.propagate_scale(ctx))
    }

    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        dispatch!(self, op => op.propagate_order(ctx))
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        dispatch!(self, op => op.required_strides(ctx))
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        dispatch!(self, op => op.batch_support(ctx))
    }

    fn finalize_layout(&self, ctx: &StageCtx<'_>) -> Result<Vec<TempBuffer>> {
        dispatch!(self, op => op.finalize_layout(ctx))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        dispatch!(self, op => op.final_check(ctx))
    }

    fn serialize_params(&self, ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        dispatch!(self, op => op.serialize_params(ctx, out))
    }

    fn serialize_data(&self, ctx: &StageCtx<'_>, sink: &mut DataSink) -> Result<()> {
        dispatch!(self, op => op.serialize_data(ctx, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Count;

    #[test]
    fn test_kind_display() {
        assert_eq!(OpKind::PsRoiPooling.to_string(), "PsRoiPooling");
        assert_eq!(Op::Binary(BinaryOp::Mul).kind(), OpKind::Mul);
        assert_eq!(
            Op::Pool(Pool::new(PoolKind::Avg, [2, 2], [2, 2])).kind(),
            OpKind::AvgPool
        );
        assert_eq!(Op::InPlace(InPlace::Flatten { axis: 1 }).kind(), OpKind::Flatten);
    }

    #[test]
    fn test_declared_arity() {
        assert!(Op::Binary(BinaryOp::Add).arity().accepts(2, 1));
        assert!(!Op::Binary(BinaryOp::Add).arity().accepts(1, 1));
        assert_eq!(
            Op::Convolution(Convolution::default()).arity().inputs,
            Count::Range(2, 3)
        );
        assert!(Op::Concat(Concat { axis: 1 }).arity().accepts(5, 1));
        assert!(Op::MemoryRead(MemoryRead { state: StateId(0) })
            .arity()
            .accepts(0, 1));
    }

    #[test]
    fn test_memory_state() {
        let state = StateId(3);
        assert_eq!(Op::MemoryWrite(MemoryWrite { state }).memory_state(), Some(state));
        assert_eq!(Op::Copy(Passthrough).memory_state(), None);
    }
}
