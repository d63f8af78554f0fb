//! Evaluators for operator kinds that do not fit a family.

mod generate;
mod indexing;
mod shape;

use vesper_core::{FoldRegistry, Result};

pub(crate) fn register(registry: &mut FoldRegistry) -> Result<()> {
    shape::register(registry)?;
    indexing::register(registry)?;
    generate::register(registry)
}
