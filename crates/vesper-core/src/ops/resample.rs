//! Spatial resampling.

use crate::ir::Port;
use crate::layout::BatchSupport;
use crate::serialize::BlobSerializer;
use crate::stage::{Arity, StageCtx, StageOp};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResampleMode {
    Nearest,
    Bilinear,
}

impl ResampleMode {
    fn code(self) -> u32 {
        match self {
            ResampleMode::Nearest => 0,
            ResampleMode::Bilinear => 1,
        }
    }
}

/// Resize the spatial axes by `factor`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resample {
    pub factor: f32,
    pub mode: ResampleMode,
    pub antialias: bool,
}

impl StageOp for Resample {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn batch_support(&self, _ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(vec![
            (Port::Input(0), BatchSupport::Split),
            (Port::Output(0), BatchSupport::Split),
        ])
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if !self.factor.is_finite() || self.factor <= 0.0 {
            return Err(ctx.model(format!(
                "resample factor {} must be positive",
                self.factor
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append_bool(self.antialias)
            .append(self.factor)
            .append(self.mode.code());
        Ok(())
    }
}
