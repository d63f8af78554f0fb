//! Gather, slice, split, concat and tile.

use crate::ir::Port;
use crate::layout::{BatchSupport, StrideRequirement};
use crate::serialize::BlobSerializer;
use crate::stage::{
    all_ports, match_input_orders, preserve_input_order, preserve_input_scale, Arity, Count,
    OrderRequest, StageCtx, StageOp,
};
use crate::Result;

/// Batch support of ops that act along one axis: the batch can be split
/// unless the op works on the batch axis itself.
fn split_unless_batch_axis(ctx: &StageCtx<'_>, axes: &[usize]) -> Vec<(Port, BatchSupport)> {
    if axes.contains(&0) {
        Vec::new()
    } else {
        all_ports(ctx, BatchSupport::Split)
    }
}

fn check_axis(ctx: &StageCtx<'_>, axis: usize) -> Result<()> {
    let rank = ctx.input(0)?.rank();
    if axis >= rank {
        return Err(ctx.model(format!("axis {axis} is out of range for rank {rank}")));
    }
    Ok(())
}

/// Pick slices of `data` along `axis` using an index tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Gather {
    pub axis: usize,
}

impl StageOp for Gather {
    fn arity(&self) -> Arity {
        Arity::exact(2, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn required_strides(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(all_ports(ctx, StrideRequirement::Compact))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        check_axis(ctx, self.axis)
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.axis as u32);
        Ok(())
    }
}

/// Strided-free slice: `[starts, ends)` on the listed axes.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub starts: Vec<usize>,
    pub ends: Vec<usize>,
    pub axes: Vec<usize>,
}

impl StageOp for Slice {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(split_unless_batch_axis(ctx, &self.axes))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        if self.starts.len() != self.axes.len() || self.ends.len() != self.axes.len() {
            return Err(ctx.model(format!(
                "slice has {} starts and {} ends for {} axes",
                self.starts.len(),
                self.ends.len(),
                self.axes.len()
            )));
        }
        let shape = &ctx.input(0)?.shape;
        for ((&axis, &start), &end) in self.axes.iter().zip(&self.starts).zip(&self.ends) {
            check_axis(ctx, axis)?;
            if start >= end || end > shape[axis] {
                return Err(ctx.model(format!(
                    "slice [{start}, {end}) is empty or exceeds dimension {} of axis {axis}",
                    shape[axis]
                )));
            }
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.axes.len() as u32);
        for ((&axis, &start), &end) in self.axes.iter().zip(&self.starts).zip(&self.ends) {
            out.append(axis as u32).append(start as u32).append(end as u32);
        }
        Ok(())
    }
}

/// Split along `axis` into pieces of the given sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub axis: usize,
    pub sizes: Vec<usize>,
}

impl StageOp for Split {
    fn arity(&self) -> Arity {
        Arity {
            inputs: Count::Exact(1),
            outputs: Count::AtLeast(1),
        }
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(split_unless_batch_axis(ctx, &[self.axis]))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        check_axis(ctx, self.axis)?;
        let dim = ctx.input(0)?.shape[self.axis];
        if self.sizes.len() != ctx.output_count() || self.sizes.iter().sum::<usize>() != dim {
            return Err(ctx.model(format!(
                "split sizes {:?} do not partition dimension {dim} into {} outputs",
                self.sizes,
                ctx.output_count()
            )));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.axis as u32);
        Ok(())
    }
}

/// Join inputs along `axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct Concat {
    pub axis: usize,
}

impl StageOp for Concat {
    fn arity(&self) -> Arity {
        Arity {
            inputs: Count::AtLeast(1),
            outputs: Count::Exact(1),
        }
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        let first = ctx.input_scale(0)?;
        for i in 1..ctx.input_count() {
            if (ctx.input_scale(i)? - first).abs() > 1e-6 {
                return Ok(vec![1.0]);
            }
        }
        Ok(vec![first])
    }

    /// Every input is written into one buffer, so they share input 0's order.
    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        let mut requests = preserve_input_order(ctx)?;
        requests.extend(match_input_orders(ctx, 1)?);
        Ok(requests)
    }

    fn batch_support(&self, ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(split_unless_batch_axis(ctx, &[self.axis]))
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        check_axis(ctx, self.axis)
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.axis as u32);
        Ok(())
    }
}

/// Repeat the input `tiles` times along `axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub axis: usize,
    pub tiles: usize,
}

impl StageOp for Tile {
    fn arity(&self) -> Arity {
        Arity::exact(1, 1)
    }

    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        preserve_input_scale(ctx)
    }

    fn final_check(&self, ctx: &StageCtx<'_>) -> Result<()> {
        check_axis(ctx, self.axis)?;
        if self.tiles == 0 {
            return Err(ctx.model("tile count must be positive"));
        }
        Ok(())
    }

    fn serialize_params(&self, _ctx: &StageCtx<'_>, out: &mut BlobSerializer) -> Result<()> {
        out.append(self.axis as u32).append(self.tiles as u32);
        Ok(())
    }
}
