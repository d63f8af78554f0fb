//! Indexing kinds: Concat, Split, Gather, Slice, Tile.
//!
//! Each evaluator computes the flat source index of every output element and
//! selects those elements from the input data.

use vesper_core::{FoldCtx, FoldRegistry, Op, OpKind, Result, TensorValue};

use crate::helpers::{concat_data, fold_error, gather_flat, split_at_axis, strides};

fn unexpected_payload(ctx: &FoldCtx<'_>) -> vesper_core::Error {
    fold_error(ctx, format!("unexpected payload {:?}", ctx.op))
}

fn concat(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let Op::Concat(op) = ctx.op else {
        return Err(unexpected_payload(ctx));
    };
    let first = ctx.input(0)?;
    let (outer, _, inner) = split_at_axis(ctx, &first.shape, op.axis)?;

    let mut shape = first.shape.clone();
    shape[op.axis] = 0;
    let mut extents = Vec::with_capacity(ctx.input_count());
    for value in ctx.inputs {
        let mismatched = value.shape.len() != first.shape.len()
            || value
                .shape
                .iter()
                .zip(&first.shape)
                .enumerate()
                .any(|(axis, (a, b))| axis != op.axis && a != b);
        if mismatched {
            return Err(fold_error(
                ctx,
                format!("cannot join {:?} with {:?}", value.shape, first.shape),
            ));
        }
        shape[op.axis] += value.shape[op.axis];
        extents.push(value.shape[op.axis] * inner);
    }

    let parts: Vec<_> = ctx.inputs.iter().map(|value| &value.data).collect();
    let joined = concat_data(ctx, &parts)?;

    // Start of each input inside the joined buffer.
    let mut bases = Vec::with_capacity(extents.len());
    let mut base = 0;
    for (value, &extent) in ctx.inputs.iter().zip(&extents) {
        bases.push(base);
        base += value.len();
        debug_assert_eq!(value.len(), outer * extent);
    }

    let mut indices = Vec::with_capacity(base);
    for o in 0..outer {
        for (&start, &extent) in bases.iter().zip(&extents) {
            indices.extend(start + o * extent..start + (o + 1) * extent);
        }
    }
    Ok(vec![gather_flat(&joined, &indices, shape)?])
}

fn split(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let Op::Split(op) = ctx.op else {
        return Err(unexpected_payload(ctx));
    };
    let input = ctx.input(0)?;
    let (outer, dim, inner) = split_at_axis(ctx, &input.shape, op.axis)?;
    if op.sizes.iter().sum::<usize>() != dim {
        return Err(fold_error(
            ctx,
            format!("sizes {:?} do not partition dimension {dim}", op.sizes),
        ));
    }

    let mut outputs = Vec::with_capacity(op.sizes.len());
    let mut offset = 0;
    for &size in &op.sizes {
        let mut indices = Vec::with_capacity(outer * size * inner);
        for o in 0..outer {
            let start = (o * dim + offset) * inner;
            indices.extend(start..start + size * inner);
        }
        let mut shape = input.shape.clone();
        shape[op.axis] = size;
        outputs.push(gather_flat(&input.data, &indices, shape)?);
        offset += size;
    }
    Ok(outputs)
}

fn gather(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let Op::Gather(op) = ctx.op else {
        return Err(unexpected_payload(ctx));
    };
    let data = ctx.input(0)?;
    let index_value = ctx.input(1)?;
    let (outer, dim, inner) = split_at_axis(ctx, &data.shape, op.axis)?;

    let positions = index_value
        .data
        .to_i64_vec()
        .ok_or_else(|| fold_error(ctx, "indices must be integers"))?
        .into_iter()
        .map(|i| {
            let wrapped = if i < 0 { i + dim as i64 } else { i };
            usize::try_from(wrapped)
                .ok()
                .filter(|&p| p < dim)
                .ok_or_else(|| fold_error(ctx, format!("index {i} is out of range for {dim}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut indices = Vec::with_capacity(outer * positions.len() * inner);
    for o in 0..outer {
        for &p in &positions {
            let start = (o * dim + p) * inner;
            indices.extend(start..start + inner);
        }
    }

    let shape: Vec<usize> = data.shape[..op.axis]
        .iter()
        .chain(&index_value.shape)
        .chain(&data.shape[op.axis + 1..])
        .copied()
        .collect();
    Ok(vec![gather_flat(&data.data, &indices, shape)?])
}

fn slice(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let Op::Slice(op) = ctx.op else {
        return Err(unexpected_payload(ctx));
    };
    let input = ctx.input(0)?;
    if op.starts.len() != op.axes.len() || op.ends.len() != op.axes.len() {
        return Err(fold_error(ctx, "starts, ends and axes differ in length"));
    }

    let mut begin = vec![0; input.shape.len()];
    let mut shape = input.shape.clone();
    for ((&axis, &start), &end) in op.axes.iter().zip(&op.starts).zip(&op.ends) {
        let (_, dim, _) = split_at_axis(ctx, &input.shape, axis)?;
        if start >= end || end > dim {
            return Err(fold_error(
                ctx,
                format!("[{start}, {end}) is not a slice of dimension {dim}"),
            ));
        }
        begin[axis] = start;
        shape[axis] = end - start;
    }

    let in_strides = strides(&input.shape);
    let out_strides = strides(&shape);
    let numel: usize = shape.iter().product();
    let indices: Vec<usize> = (0..numel)
        .map(|flat| {
            out_strides
                .iter()
                .zip(&shape)
                .zip(begin.iter().zip(&in_strides))
                .map(|((&out_stride, &extent), (&offset, &in_stride))| {
                    ((flat / out_stride) % extent + offset) * in_stride
                })
                .sum()
        })
        .collect();
    Ok(vec![gather_flat(&input.data, &indices, shape)?])
}

fn tile(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let Op::Tile(op) = ctx.op else {
        return Err(unexpected_payload(ctx));
    };
    let input = ctx.input(0)?;
    let (outer, dim, inner) = split_at_axis(ctx, &input.shape, op.axis)?;
    if op.tiles == 0 {
        return Err(fold_error(ctx, "tile count must be positive"));
    }

    let block = dim * inner;
    let mut indices = Vec::with_capacity(outer * op.tiles * block);
    for o in 0..outer {
        for _ in 0..op.tiles {
            indices.extend(o * block..(o + 1) * block);
        }
    }
    let mut shape = input.shape.clone();
    shape[op.axis] = dim * op.tiles;
    Ok(vec![gather_flat(&input.data, &indices, shape)?])
}

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    registry
        .register(OpKind::Concat, concat)?
        .register(OpKind::Split, split)?
        .register(OpKind::Gather, gather)?
        .register(OpKind::Slice, slice)?
        .register(OpKind::Tile, tile)?;
    Ok(())
}
