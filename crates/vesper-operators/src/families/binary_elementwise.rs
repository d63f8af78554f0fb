//! Binary elementwise evaluator family.
//!
//! Covers: Add, Sub, Mul, Div, Max, Min

use vesper_core::broadcast::{broadcast_shape, source_index};
use vesper_core::{
    ConstantFolder, FoldCtx, FoldRegistry, OpKind, Result, TensorData, TensorValue,
};

use crate::helpers::fold_error;

/// Binary elementwise evaluator.
///
/// Every member broadcasts its two inputs NumPy-style and differs only in
/// the per-element function. Integer functions are checked: overflow or
/// division by zero leaves the stage for runtime.
pub struct BinaryElementwiseFolder {
    kind: OpKind,
    fold_fn_f32: fn(f32, f32) -> f32,
    fold_fn_i64: fn(i64, i64) -> Option<i64>,
    fold_fn_i32: fn(i32, i32) -> Option<i32>,
}

impl BinaryElementwiseFolder {
    pub fn add() -> Self {
        Self {
            kind: OpKind::Add,
            fold_fn_f32: |a, b| a + b,
            fold_fn_i64: i64::checked_add,
            fold_fn_i32: i32::checked_add,
        }
    }

    pub fn sub() -> Self {
        Self {
            kind: OpKind::Sub,
            fold_fn_f32: |a, b| a - b,
            fold_fn_i64: i64::checked_sub,
            fold_fn_i32: i32::checked_sub,
        }
    }

    pub fn mul() -> Self {
        Self {
            kind: OpKind::Mul,
            fold_fn_f32: |a, b| a * b,
            fold_fn_i64: i64::checked_mul,
            fold_fn_i32: i32::checked_mul,
        }
    }

    pub fn div() -> Self {
        Self {
            kind: OpKind::Div,
            fold_fn_f32: |a, b| a / b,
            fold_fn_i64: i64::checked_div,
            fold_fn_i32: i32::checked_div,
        }
    }

    pub fn max() -> Self {
        Self {
            kind: OpKind::Max,
            fold_fn_f32: f32::max,
            fold_fn_i64: |a, b| Some(a.max(b)),
            fold_fn_i32: |a, b| Some(a.max(b)),
        }
    }

    pub fn min() -> Self {
        Self {
            kind: OpKind::Min,
            fold_fn_f32: f32::min,
            fold_fn_i64: |a, b| Some(a.min(b)),
            fold_fn_i32: |a, b| Some(a.min(b)),
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl ConstantFolder for BinaryElementwiseFolder {
    fn fold(&self, ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
        let a = ctx.input(0)?;
        let b = ctx.input(1)?;
        let shape = broadcast_shape(&a.shape, &b.shape)?;
        let numel: usize = shape.iter().product();

        let pairs = |i: usize| {
            (
                source_index(&shape, &a.shape, i),
                source_index(&shape, &b.shape, i),
            )
        };

        let data = match (&a.data, &b.data) {
            (TensorData::F32(x), TensorData::F32(y)) => TensorData::F32(
                (0..numel)
                    .map(|i| {
                        let (ia, ib) = pairs(i);
                        (self.fold_fn_f32)(x[ia], y[ib])
                    })
                    .collect(),
            ),
            (TensorData::I64(x), TensorData::I64(y)) => TensorData::I64(
                (0..numel)
                    .map(|i| {
                        let (ia, ib) = pairs(i);
                        (self.fold_fn_i64)(x[ia], y[ib])
                    })
                    .collect::<Option<_>>()
                    .ok_or_else(|| fold_error(ctx, "integer overflow or division by zero"))?,
            ),
            (TensorData::I32(x), TensorData::I32(y)) => TensorData::I32(
                (0..numel)
                    .map(|i| {
                        let (ia, ib) = pairs(i);
                        (self.fold_fn_i32)(x[ia], y[ib])
                    })
                    .collect::<Option<_>>()
                    .ok_or_else(|| fold_error(ctx, "integer overflow or division by zero"))?,
            ),
            (x, y) => {
                return Err(fold_error(
                    ctx,
                    format!("cannot combine {:?} with {:?}", x.dtype(), y.dtype()),
                ))
            }
        };

        Ok(vec![TensorValue::try_new(data, shape)?])
    }
}

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    for folder in [
        BinaryElementwiseFolder::add(),
        BinaryElementwiseFolder::sub(),
        BinaryElementwiseFolder::mul(),
        BinaryElementwiseFolder::div(),
        BinaryElementwiseFolder::max(),
        BinaryElementwiseFolder::min(),
    ] {
        registry.register(folder.kind(), folder)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ops::BinaryOp;
    use vesper_core::{DataType, Error, Op, StageId};

    fn fold(folder: &BinaryElementwiseFolder, a: TensorValue, b: TensorValue) -> Result<TensorValue> {
        let op = Op::Binary(BinaryOp::Add);
        let inputs = [a, b];
        let ctx = FoldCtx {
            stage: StageId::new(0),
            op: &op,
            inputs: &inputs,
            output_shapes: &[],
        };
        Ok(folder.fold(&ctx)?.remove(0))
    }

    #[test]
    fn test_mul_f32() {
        let out = fold(
            &BinaryElementwiseFolder::mul(),
            TensorValue::from_f32(vec![2.0]),
            TensorValue::from_f32(vec![3.0]),
        )
        .unwrap();
        assert_eq!(out.as_f32(), Some(&[6.0][..]));
        assert_eq!(out.dtype, DataType::F32);
    }

    #[test]
    fn test_add_broadcasts_row() {
        let a = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 3],
            DataType::F32,
        );
        let b = TensorValue::from_f32(vec![10.0, 20.0, 30.0]);
        let out = fold(&BinaryElementwiseFolder::add(), a, b).unwrap();
        assert_eq!(out.shape, vec![2, 3]);
        assert_eq!(
            out.as_f32(),
            Some(&[11.0, 22.0, 33.0, 14.0, 25.0, 36.0][..])
        );
    }

    #[test]
    fn test_integer_division_by_zero_is_left_for_runtime() {
        let err = fold(
            &BinaryElementwiseFolder::div(),
            TensorValue::from_i64(vec![4, 6]),
            TensorValue::from_i64(vec![2, 0]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Fold(_)));
    }

    #[test]
    fn test_mixed_types_rejected() {
        let err = fold(
            &BinaryElementwiseFolder::min(),
            TensorValue::from_i64(vec![1]),
            TensorValue::from_f32(vec![1.0]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Fold(_)));
    }
}
