//! Shape-only operators and the passthrough copy.

use crate::ir::Port;
use crate::layout::{BatchSupport, MemoryOrder, StrideRequirement};
use crate::ops::OpKind;
use crate::serialize::BlobSerializer;
use crate::stage::{
    all_ports, preserve_input_scale, Arity, OrderRequest, StageCtx, StageOp,
};
use crate::Result;

/// Reinterpret the input with a new shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl StageOp for Reshape {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(all_ports(ctx, StrideRequirement::Compact))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let output = ctx.output(0)?;
        if output.shape != self.shape {
            return Err(ctx.internal(format!(
                "output shape {:?} differs from the target shape {:?}",
                output.shape, self.shape
            )));
        }
        if input.numel() != output.numel() {
            return Err(ctx.model(format!(
                "cannot reshape {:?} into {:?}",
                input.shape, output.shape
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        let dims: Vec<u32> = self.shape.iter().map(|&d| d as u32).collect();
        out.append(dims.len() as u32).append_slice(&dims);
        Ok(())
    }
}

/// In-place shape ops that only add or drop unit axes.
#[derive(Debug, Clone, PartialEq)]
pub enum InPlace {
    Squeeze { axes: Vec<usize> },
    Unsqueeze { axes: Vec<usize> },
    Flatten { axis: usize },
}

impl InPlace {
    pub fn kind(&self) -> OpKind {
        match self {
            InPlace::Squeeze { .. } => OpKind::Squeeze,
            InPlace::Unsqueeze { .. } => OpKind::Unsqueeze,
            InPlace::Flatten { .. } => OpKind::Flatten,
        }
    }
}

impl StageOp for InPlace {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(all_ports(ctx, StrideRequirement::Compact))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let output = ctx.output(0)?;
        if input.numel() != output.numel() {
            return Err(ctx.model(format!(
                "{:?} -> {:?} changes the element count",
                input.shape, output.shape
            )));
        }
        Ok(())
    }
}

/// Transpose the logical axes.
#[derive(Debug, Clone, PartialEq)]
pub struct Permute {
    pub perm: Vec<usize>,
}

impl StageOp for Permute {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    /// The output is always produced densely in row-major order.
    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        Ok(vec![OrderRequest {
            port: Port::Output(0),
            order: MemoryOrder::identity(ctx.output(0)?.rank()),
        }])
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(all_ports(ctx, StrideRequirement::Compact))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        let rank = ctx.input(0)?.rank();
        if self.perm.len() != rank || MemoryOrder::from_perm(self.perm.clone()).is_err() {
            return Err(ctx.model(format!(
                "{:?} is not a permutation of a rank-{rank} tensor",
                self.perm
            )));
        }
        let input = &ctx.input(0)?.shape;
        let expected: Vec<usize> = self.perm.iter().map(|&axis| input[axis]).collect();
        let output = &ctx.output(0)?.shape;
        if *output != expected {
            return Err(ctx.model(format!(
                "permuting {input:?} by {:?} gives {expected:?}, not {output:?}",
                self.perm
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        let perm: Vec<u32> = self.perm.iter().map(|&a| a as u32).collect();
        out.append(perm.len() as u32).append_slice(&perm);
        Ok(())
    }
}

/// Identity copy. Places no order constraint, which makes it the stage used
/// to convert between layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Passthrough;

impl StageOp for Passthrough {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn propagate_order(&self, _ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        Ok(Vec::new())
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(all_ports(ctx, BatchSupport::Split))
    }
}
