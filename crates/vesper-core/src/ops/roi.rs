//! Position-sensitive region-of-interest pooling.

use crate::ir::Port;
use crate::layout::{axis, MemoryOrder, StrideRequirement};
use crate::serialize::{BlobSerializer, DataSink};
use crate::stage::{all_ports, Arity, OrderRequest, StageCtx, StageOp};
use crate::Result;

/// Physical position (from the innermost) the channel axis must occupy.
const CHANNEL_POSITION: usize = 2;

/// Inputs: feature map, then the regions of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct PsRoiPooling {
    pub group_size: u32,
    pub output_dim: u32,
    pub spatial_scale: f32,
}

impl Default for PsRoiPooling {
    fn default() -> Self {
        Self {
            group_size: 7,
            output_dim: 21,
            spatial_scale: 0.0625,
        }
    }
}

impl StageOp for PsRoiPooling {
    fn arity(&self) -> Arity {
        Arity::exact(2, 1)
    }

    /// Channels go to a fixed physical position on the features and the
    /// output; the other axes keep their relative order.
    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        let mut requests = Vec::new();
        let ports = [
            (Port::Input(0), ctx.input(0)?),
            (Port::Output(0), ctx.output(0)?),
        ];
        for (port, desc) in ports {
            let current = desc
                .order
                .clone()
                .unwrap_or_else(|| MemoryOrder::identity(desc.rank()));
            if let Some(order) = current.with_axis_at(axis::C, CHANNEL_POSITION) {
                requests.push(OrderRequest { port, order });
            }
        }
        Ok(requests)
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(all_ports(ctx, StrideRequirement::Compact))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if self.group_size == 0 || self.output_dim == 0 {
            return Err(ctx.model(format!(
                "group_size {} and output_dim {} must be positive",
                self.group_size, self.output_dim
            )));
        }
        let rank = ctx.input(0)?.rank();
        if rank != 4 {
            return Err(ctx.model(format!("features must be rank 4, found rank {rank}")));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.group_size)
            .append(self.output_dim)
            .append(self.spatial_scale);
        Ok(())
    }

    /// Features, output, then the regions.
    fn serialize_data(&self, ctx: &StageCtx<'_>, sink: &mut DataSink) -> Result<()> {
        sink.tensor(ctx.input_id(0)?)
            .tensor(ctx.output_id(0)?)
            .tensor(ctx.input_id(1)?);
        Ok(())
    }
}
