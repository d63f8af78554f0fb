//! Pooling and convolution family.

use crate::ir::Port;
use crate::layout::{BatchSupport, StrideRequirement};
use crate::serialize::BlobSerializer;
use crate::stage::{all_ports, preserve_input_scale, Arity, Count, StageCtx, StageOp};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Max,
    Avg,
}

/// 2-D pooling over the spatial axes.
#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    pub kind: PoolKind,
    pub kernel: [u32; 2],
    pub stride: [u32; 2],
    /// Top, left, bottom, right.
    pub pads: [u32; 4],
}

impl Pool {
    pub fn new(kind: PoolKind, kernel: [u32; 2], stride: [u32; 2]) -> Self {
        Self {
            kind,
            kernel,
            stride,
            pads: [0; 4],
        }
    }
}

impl StageOp for Pool {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(all_ports(ctx, BatchSupport::Split))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if self.kernel.contains(&0) || self.stride.contains(&0) {
            return Err(ctx.model(format!(
                "pooling kernel {:?} and stride {:?} must be positive",
                self.kernel, self.stride
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append_slice(&self.kernel)
            .append_slice(&self.stride)
            .append_slice(&self.pads);
        Ok(())
    }
}

/// 2-D convolution: data, constant weights, optional constant bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Convolution {
    pub stride: [u32; 2],
    pub pads: [u32; 4],
    pub dilation: [u32; 2],
    pub group: u32,
}

impl Default for Convolution {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            pads: [0; 4],
            dilation: [1, 1],
            group: 1,
        }
    }
}

impl StageOp for Convolution {
    fn arity(&self) -> Arity {
        Arity {
            inputs: Count::Range(2, 3),
            outputs: Count::Exact(1),
        }
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        Ok(vec![ctx.input_scale(0)? * ctx.input_scale(1)?])
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(all_ports(ctx, StrideRequirement::Compact))
    }

    fn batch_support(&self, _ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(vec![
            (Port::Input(0), BatchSupport::Split),
            (Port::Output(0), BatchSupport::Split),
        ])
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        for (index, what) in [(1, "weights"), (2, "bias")] {
            if index < ctx.input_count() && !ctx.input_is_constant(index)? {
                return Err(ctx.model(format!("missing constant weight: {what} must be constant")));
            }
        }
        if self.group == 0 || self.stride.contains(&0) || self.dilation.contains(&0) {
            return Err(ctx.model(format!(
                "group {}, stride {:?} and dilation {:?} must be positive",
                self.group, self.stride, self.dilation
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append_slice(&self.stride)
            .append_slice(&self.pads)
            .append_slice(&self.dilation)
            .append(self.group);
        Ok(())
    }
}
