//! Paired stateful feedback stages.
//!
//! A `MemoryRead` yields the value its state held at the end of the previous
//! execution; its output lives in the state's persistent buffer. The matching
//! `MemoryWrite` copies the next value into that buffer once every reader of
//! the current value has run.

use crate::ir::{Port, StateId};
use crate::layout::MemoryOrder;
use crate::serialize::BlobSerializer;
use crate::stage::{Arity, OrderRequest, StageCtx, StageOp};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRead {
    pub state: StateId,
}

impl StageOp for MemoryRead {
    fn arity(&self) -> Arity {
        Arity::exact(0, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        Ok(vec![ctx.output(0)?.scale])
    }

    /// State buffers are stored row-major.
    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        Ok(vec![OrderRequest {
            port: Port::Output(0),
            order: MemoryOrder::identity(ctx.output(0)?.rank()),
        }])
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.state.0);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryWrite {
    pub state: StateId,
}

impl StageOp for MemoryWrite {
    fn arity(&self) -> Arity {
        Arity::exact(1, 0)
    }

    fn propagate_scale(&self, _ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        Ok(Vec::new())
    }

    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        Ok(vec![OrderRequest {
            port: Port::Input(0),
            order: MemoryOrder::identity(ctx.input(0)?.rank()),
        }])
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.state.0);
        Ok(())
    }
}
