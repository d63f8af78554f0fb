//! The built-in constant-folding registry.

use std::sync::OnceLock;

use tracing::error;
use vesper_core::{FoldRegistry, Result};

use crate::{families, folders};

static FOLD_REGISTRY: OnceLock<FoldRegistry> = OnceLock::new();

/// Build a registry holding every built-in evaluator.
///
/// The registry includes:
/// - 6 binary elementwise evaluators (Add, Sub, Mul, Div, Max, Min)
/// - 2 unary elementwise evaluators (Relu, Power)
/// - 5 shape evaluators (Reshape, Squeeze, Unsqueeze, Flatten, Copy)
/// - 5 indexing evaluators (Concat, Split, Gather, Slice, Tile)
/// - 2 generators (Fill, Range)
///
/// Custom evaluators can be added to the returned registry via
/// `registry.register(kind, folder)`.
pub fn core_fold_registry() -> Result<FoldRegistry> {
    let mut registry = FoldRegistry::new();
    families::register(&mut registry)?;
    folders::register(&mut registry)?;
    Ok(registry)
}

/// The process-wide registry, built on first access and read-only after.
///
/// If building it fails the error is logged and an empty registry is
/// installed, which disables folding without affecting correctness.
pub fn fold_registry() -> &'static FoldRegistry {
    FOLD_REGISTRY.get_or_init(|| {
        core_fold_registry().unwrap_or_else(|err| {
            error!(%err, "failed to build the fold registry; folding is disabled");
            FoldRegistry::new()
        })
    })
}
