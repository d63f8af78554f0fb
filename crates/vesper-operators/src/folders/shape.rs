//! Shape-only kinds: the data is unchanged, only the declared shape differs.

use vesper_core::{FoldCtx, FoldRegistry, OpKind, Result, TensorValue};

/// Reinterpret input 0 with the stage's declared output shape.
fn reshape_to_output(ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
    let input = ctx.input(0)?;
    let shape = ctx.output_shape(0)?;
    Ok(vec![input.reshape(shape.to_vec())?])
}

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    for kind in [
        OpKind::Reshape,
        OpKind::Squeeze,
        OpKind::Unsqueeze,
        OpKind::Flatten,
        OpKind::Copy,
    ] {
        registry.register(kind, reshape_to_output)?;
    }
    Ok(())
}
