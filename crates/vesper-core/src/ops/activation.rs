//! Unary activations and the affine power stage.

use crate::ir::Port;
use crate::layout::BatchSupport;
use crate::ops::OpKind;
use crate::serialize::BlobSerializer;
use crate::stage::{all_ports, preserve_input_scale, Arity, StageCtx, StageOp};
use crate::Result;

/// Pointwise activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Clamp { min: f32, max: f32 },
}

impl Activation {
    pub fn kind(self) -> OpKind {
        match self {
            Activation::Relu => OpKind::Relu,
            Activation::Sigmoid => OpKind::Sigmoid,
            Activation::Tanh => OpKind::Tanh,
            Activation::Clamp { .. } => OpKind::Clamp,
        }
    }
}

impl StageOp for Activation {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        match self {
            Activation::Relu | Activation::Clamp { .. } => preserve_input_scale(ctx),
            Activation::Sigmoid | Activation::Tanh => Ok(vec![1.0]),
        }
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(all_ports(ctx, BatchSupport::Split))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if let Activation::Clamp { min, max } = self {
            if min > max {
                return Err(ctx.model(format!("clamp bounds are inverted: {min} > {max}")));
            }
        }
        Ok(())
    }

    fn serialize_params(&self, ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        if let Activation::Clamp { min, max } = *self {
            // Bounds are compared against scaled data.
            let scale = ctx.output(0)?.scale;
            out.append(min * scale).append(max * scale);
        }
        Ok(())
    }
}

/// `y = (scale * x + shift) ^ power`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Power {
    pub scale: f32,
    pub shift: f32,
    pub power: f32,
}

impl Default for Power {
    fn default() -> Self {
        Self {
            scale: 1.0,
            shift: 0.0,
            power: 1.0,
        }
    }
}

impl Power {
    pub fn apply(&self, x: f32) -> f32 {
        let base = self.scale * x + self.shift;
        if self.power == 1.0 {
            base
        } else {
            base.powf(self.power)
        }
    }
}

impl StageOp for Power {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        if self.power == 1.0 {
            preserve_input_scale(ctx)
        } else {
            Ok(vec![1.0])
        }
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(all_ports(ctx, BatchSupport::Split))
    }

    fn serialize_params(&self, ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        let shift = self.shift * ctx.output(0)?.scale;
        out.append(self.scale).append(shift).append(self.power);
        Ok(())
    }
}
