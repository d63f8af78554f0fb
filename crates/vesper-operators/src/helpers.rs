//! Shared plumbing for the evaluators.

use vesper_core::{Error, FoldCtx, Result, TensorData, TensorValue};

/// Evaluator-side failure; the stage is left for runtime.
pub(crate) fn fold_error(ctx: &FoldCtx<'_>, message: impl std::fmt::Display) -> Error {
    Error::Fold(format!("{}: {message}", ctx.op.kind()))
}

/// Row-major `(outer, dim, inner)` split of `shape` around `axis`.
pub(crate) fn split_at_axis(
    ctx: &FoldCtx<'_>,
    shape: &[usize],
    axis: usize,
) -> Result<(usize, usize, usize)> {
    if axis >= shape.len() {
        return Err(fold_error(
            ctx,
            format!("axis {axis} is out of range for rank {}", shape.len()),
        ));
    }
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    Ok((outer, shape[axis], inner))
}

/// Row-major strides of `shape`.
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Gather `indices` out of `source` and attach `shape`.
pub(crate) fn gather_flat(
    source: &TensorData,
    indices: &[usize],
    shape: Vec<usize>,
) -> Result<TensorValue> {
    TensorValue::try_new(source.select(indices), shape)
}

/// Append every part into one buffer. All parts must share a variant.
pub(crate) fn concat_data(ctx: &FoldCtx<'_>, parts: &[&TensorData]) -> Result<TensorData> {
    macro_rules! join {
        ($variant:ident) => {{
            let mut joined = Vec::new();
            for part in parts {
                match part {
                    TensorData::$variant(values) => joined.extend_from_slice(values),
                    other => {
                        return Err(fold_error(
                            ctx,
                            format!("mixed element types {:?} and {:?}", other.dtype(), parts[0].dtype()),
                        ))
                    }
                }
            }
            TensorData::$variant(joined)
        }};
    }

    let Some(first) = parts.first() else {
        return Err(fold_error(ctx, "nothing to concatenate"));
    };
    Ok(match first {
        TensorData::I64(_) => join!(I64),
        TensorData::I32(_) => join!(I32),
        TensorData::F32(_) => join!(F32),
        TensorData::Bool(_) => join!(Bool),
        TensorData::U8(_) => join!(U8),
    })
}

/// Read a single-element input as i64.
pub(crate) fn scalar_i64(ctx: &FoldCtx<'_>, index: usize) -> Result<i64> {
    let value = ctx.input(index)?;
    match value.data.to_i64_vec().as_deref() {
        Some([v]) => Ok(*v),
        _ => Err(fold_error(ctx, format!("input {index} is not an integer scalar"))),
    }
}

/// Read a single-element f32 input.
pub(crate) fn scalar_f32(ctx: &FoldCtx<'_>, index: usize) -> Result<f32> {
    match ctx.input(index)?.as_f32() {
        Some([v]) => Ok(*v),
        _ => Err(fold_error(ctx, format!("input {index} is not an f32 scalar"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[5]), vec![1]);
        assert!(strides(&[]).is_empty());
    }
}
