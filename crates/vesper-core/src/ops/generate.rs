//! Tensor generators whose inputs are usually compile-time scalars.

use crate::stage::{Arity, OrderRequest, StageCtx, StageOp};
use crate::Result;

/// Broadcast a scalar `value` into a tensor of shape `dims`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fill;

impl StageOp for Fill {
    fn arity(&self) -> Arity {
        Arity::exact(2, 1)
    }

    fn propagate_order(&self, _ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        Ok(Vec::new())
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if ctx.input(1)?.numel() != 1 {
            return Err(ctx.model("fill value must be a scalar"));
        }
        Ok(())
    }
}

/// `start, start + delta, ...` up to (excluding) `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range;

impl StageOp for Range {
    fn arity(&self) -> Arity {
        Arity::exact(3, 1)
    }

    fn propagate_order(&self, _ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        Ok(Vec::new())
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        for i in 0..3 {
            if ctx.input(i)?.numel() != 1 {
                return Err(ctx.model(format!("range input {i} must be a scalar")));
            }
        }
        Ok(())
    }
}
