//! Unary elementwise evaluator family.
//!
//! Covers: Relu, Power

use vesper_core::{
    ConstantFolder, FoldCtx, FoldRegistry, Op, OpKind, Result, TensorData, TensorValue,
};

use crate::helpers::fold_error;

/// Unary elementwise evaluator.
///
/// The f32 function receives the stage's operator so parametrized members
/// (Power) can read their attributes. Integer data is only supported by
/// members that map integers to integers.
pub struct UnaryElementwiseFolder {
    kind: OpKind,
    fold_fn_f32: fn(&Op, f32) -> Option<f32>,
    fold_fn_i64: Option<fn(i64) -> i64>,
}

impl UnaryElementwiseFolder {
    pub fn relu() -> Self {
        Self {
            kind: OpKind::Relu,
            fold_fn_f32: |_, x| Some(x.max(0.0)),
            fold_fn_i64: Some(|x| x.max(0)),
        }
    }

    /// `(scale * x + shift) ^ power`
    pub fn power() -> Self {
        Self {
            kind: OpKind::Power,
            fold_fn_f32: |op, x| match op {
                Op::Power(power) => Some(power.apply(x)),
                _ => None,
            },
            fold_fn_i64: None,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl ConstantFolder for UnaryElementwiseFolder {
    fn fold(&self, ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
        let input = ctx.input(0)?;
        let data = match (&input.data, self.fold_fn_i64) {
            (TensorData::F32(values), _) => TensorData::F32(
                values
                    .iter()
                    .map(|&x| (self.fold_fn_f32)(ctx.op, x))
                    .collect::<Option<_>>()
                    .ok_or_else(|| fold_error(ctx, "operator attributes do not match"))?,
            ),
            (TensorData::I64(values), Some(f)) => {
                TensorData::I64(values.iter().map(|&x| f(x)).collect())
            }
            (TensorData::I32(values), Some(f)) => TensorData::I32(
                values
                    .iter()
                    .map(|&x| i32::try_from(f(i64::from(x))))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| fold_error(ctx, "result does not fit in i32"))?,
            ),
            (other, _) => {
                return Err(fold_error(
                    ctx,
                    format!("{:?} data is not supported", other.dtype()),
                ))
            }
        };
        Ok(vec![TensorValue::try_new(data, input.shape.clone())?])
    }
}

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    for folder in [UnaryElementwiseFolder::relu(), UnaryElementwiseFolder::power()] {
        registry.register(folder.kind(), folder)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ops::{Activation, Power};
    use vesper_core::{Error, StageId};

    fn fold_with(op: Op, folder: UnaryElementwiseFolder, input: TensorValue) -> Result<TensorValue> {
        let inputs = [input];
        let ctx = FoldCtx {
            stage: StageId::new(0),
            op: &op,
            inputs: &inputs,
            output_shapes: &[],
        };
        Ok(folder.fold(&ctx)?.remove(0))
    }

    #[test]
    fn test_relu() {
        let out = fold_with(
            Op::Activation(Activation::Relu),
            UnaryElementwiseFolder::relu(),
            TensorValue::from_f32(vec![-1.0, 0.5]),
        )
        .unwrap();
        assert_eq!(out.as_f32(), Some(&[0.0, 0.5][..]));

        let out = fold_with(
            Op::Activation(Activation::Relu),
            UnaryElementwiseFolder::relu(),
            TensorValue::from_i64(vec![-4, 9]),
        )
        .unwrap();
        assert_eq!(out.as_i64(), Some(&[0, 9][..]));
    }

    #[test]
    fn test_power_uses_attributes() {
        let op = Op::Power(Power {
            scale: 2.0,
            shift: 1.0,
            power: 2.0,
        });
        let out = fold_with(op, UnaryElementwiseFolder::power(), TensorValue::from_f32(vec![1.0, 2.0]))
            .unwrap();
        let values = out.as_f32().unwrap();
        assert!((values[0] - 9.0).abs() < 1e-6);
        assert!((values[1] - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_power_on_integers_is_left_for_runtime() {
        let err = fold_with(
            Op::Power(Power::default()),
            UnaryElementwiseFolder::power(),
            TensorValue::from_i64(vec![3]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Fold(_)));
    }
}
