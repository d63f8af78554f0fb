//! Normalization variants.

use crate::ir::{Port, TempBuffer};
use crate::layout::{axis, BatchSupport};
use crate::serialize::{BlobSerializer, DataSink};
use crate::stage::{Arity, StageCtx, StageOp};
use crate::Result;

/// Largest epsilon the MVN kernels honor; they always use a fixed 1e-9.
pub const MVN_MAX_EPS: f32 = 1e-7;

/// Mean-variance normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Mvn {
    pub normalize_variance: bool,
    pub across_channels: bool,
    pub eps: f32,
}

impl StageOp for Mvn {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn batch_support(&self, _ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(vec![
            (Port::Input(0), BatchSupport::Split),
            (Port::Output(0), BatchSupport::Split),
        ])
    }

    /// Mean and variance per channel (or one pair when normalizing across
    /// channels), stored as f32.
    fn finalize_layout(&self, ctx: &StageCtx<'_>) -> Result<Vec<TempBuffer>> {
        let shape = &ctx.input(0)?.shape;
        let channels = if self.across_channels || shape.len() <= axis::C {
            1
        } else {
            shape[axis::C]
        };
        Ok(vec![TempBuffer {
            name: "mean_variance".to_string(),
            bytes: channels * 2 * std::mem::size_of::<f32>(),
        }])
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if self.eps > MVN_MAX_EPS {
            return Err(ctx.model(format!(
                "eps {} is not supported (at most {MVN_MAX_EPS})",
                self.eps
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append_bool(self.normalize_variance)
            .append_bool(self.across_channels);
        Ok(())
    }
}

/// L2 normalization followed by a per-channel scale held in input 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalize {
    pub across_spatial: bool,
    pub channel_shared: bool,
    pub eps: f32,
}

impl StageOp for Normalize {
    fn arity(&self) -> Arity {
        Arity::exact(2, 1)
    }

    fn batch_support(&self, _ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(vec![
            (Port::Input(0), BatchSupport::Split),
            (Port::Output(0), BatchSupport::Split),
        ])
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if !ctx.input_is_constant(1)? {
            return Err(ctx.model("missing constant weight: scales must be constant"));
        }
        let data = ctx.input(0)?;
        let expected = if self.channel_shared || data.rank() <= axis::C {
            1
        } else {
            data.shape[axis::C]
        };
        let scales = ctx.input(1)?.numel();
        if scales != expected {
            return Err(ctx.model(format!("expected {expected} scales, found {scales}")));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append_bool(self.across_spatial)
            .append_bool(self.channel_shared)
            .append(self.eps);
        Ok(())
    }

    /// Data, output, then the scales.
    fn serialize_data(&self, ctx: &StageCtx<'_>, sink: &mut DataSink) -> Result<()> {
        sink.tensor(ctx.input_id(0)?)
            .tensor(ctx.output_id(0)?)
            .tensor(ctx.input_id(1)?);
        Ok(())
    }
}
