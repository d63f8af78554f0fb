//! Generators: Fill and Range.

use vesper_core::{FoldCtx, FoldRegistry, OpKind, Result, TensorData, TensorValue};

use crate::helpers::{fold_error, scalar_f32, scalar_i64};

/// `dims` (integer vector) filled with the scalar `value`.
fn fill(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let shape = ctx
        .input(0)?
        .data
        .to_i64_vec()
        .ok_or_else(|| fold_error(ctx, "dims must be integers"))?
        .into_iter()
        .map(|d| usize::try_from(d).map_err(|_| fold_error(ctx, format!("negative dim {d}"))))
        .collect::<Result<Vec<_>>>()?;

    let value = ctx.input(1)?;
    if value.len() != 1 {
        return Err(fold_error(ctx, "fill value must be a scalar"));
    }
    let numel: usize = shape.iter().product();
    Ok(vec![TensorValue::try_new(
        value.data.select(&vec![0; numel]),
        shape,
    )?])
}

/// Number of range elements; zero when the range is empty.
fn range_len(start: f64, limit: f64, delta: f64) -> usize {
    ((limit - start) / delta).ceil().max(0.0) as usize
}

/// `start, start + delta, ...` excluding `limit`, in the element type of
/// `start`.
fn range(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let data = match ctx.input(0)?.data {
        TensorData::F32(_) => {
            let (start, limit, delta) = (scalar_f32(ctx, 0)?, scalar_f32(ctx, 1)?, scalar_f32(ctx, 2)?);
            if delta == 0.0 {
                return Err(fold_error(ctx, "delta must be non-zero"));
            }
            let len = range_len(start.into(), limit.into(), delta.into());
            TensorData::F32((0..len).map(|i| start + i as f32 * delta).collect())
        }
        TensorData::I64(_) | TensorData::I32(_) => {
            let (start, limit, delta) = (scalar_i64(ctx, 0)?, scalar_i64(ctx, 1)?, scalar_i64(ctx, 2)?);
            if delta == 0 {
                return Err(fold_error(ctx, "delta must be non-zero"));
            }
            let len = range_len(start as f64, limit as f64, delta as f64);
            let values = (0..len as i64).map(|i| start + i * delta);
            match ctx.input(0)?.data {
                TensorData::I32(_) => TensorData::I32(
                    values
                        .map(i32::try_from)
                        .collect::<std::result::Result<_, _>>()
                        .map_err(|_| fold_error(ctx, "range exceeds i32"))?,
                ),
                _ => TensorData::I64(values.collect()),
            }
        }
        ref other => {
            return Err(fold_error(
                ctx,
                format!("{:?} ranges are not supported", other.dtype()),
            ))
        }
    };
    let len = data.len();
    Ok(vec![TensorValue::try_new(data, vec![len])?])
}

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    registry
        .register(OpKind::Fill, fill)?
        .register(OpKind::Range, range)?;
    Ok(())
}
