//! Binary elementwise operator family.
//!
//! Covers: Add, Sub, Mul, Div, Max, Min

use crate::ir::Port;
use crate::layout::BatchSupport;
use crate::ops::OpKind;
use crate::serialize::BlobSerializer;
use crate::stage::{
    all_ports, match_input_orders, preserve_input_order, Arity, OrderRequest, StageCtx, StageOp,
};
use crate::Result;

/// Scales closer than this are treated as equal.
const SCALE_TOLERANCE: f32 = 1e-6;

/// Binary elementwise operator.
///
/// All members share the same structure (two inputs broadcast against each
/// other, one output in input 0's order) and differ only in how quantization
/// scale flows through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub fn kind(self) -> OpKind {
        match self {
            BinaryOp::Add => OpKind::Add,
            BinaryOp::Sub => OpKind::Sub,
            BinaryOp::Mul => OpKind::Mul,
            BinaryOp::Div => OpKind::Div,
            BinaryOp::Max => OpKind::Max,
            BinaryOp::Min => OpKind::Min,
        }
    }

    /// Backend operation code.
    fn code(self) -> u32 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
            BinaryOp::Max => 4,
            BinaryOp::Min => 5,
        }
    }
}

impl StageOp for BinaryOp {
    fn arity(&self) -> Arity {
        Arity::exact(2, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        let a = ctx.input_scale(0)?;
        let b = ctx.input_scale(1)?;
        let scale = match self {
            BinaryOp::Mul => a * b,
            BinaryOp::Div if b != 0.0 => a / b,
            BinaryOp::Div => 1.0,
            // Additive and selecting ops only stay exact on a shared scale.
            _ if (a - b).abs() <= SCALE_TOLERANCE => a,
            _ => 1.0,
        };
        Ok(vec![scale])
    }

    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        let mut requests = preserve_input_order(ctx)?;
        requests.extend(match_input_orders(ctx, 1)?);
        Ok(requests)
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(all_ports(ctx, BatchSupport::Split))
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.code());
        Ok(())
    }
}
