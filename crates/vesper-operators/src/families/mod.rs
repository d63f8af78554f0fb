//! Evaluator families: operator kinds that share one evaluation routine and
//! differ only in the per-element function.

pub mod binary_elementwise;
pub mod unary_elementwise;

pub use binary_elementwise::BinaryElementwiseFolder;
pub use unary_elementwise::UnaryElementwiseFolder;

use vesper_core::{FoldRegistry, Result};

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    binary_elementwise::register(registry)?;
    unary_elementwise::register(registry)
}
