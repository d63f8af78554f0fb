//! Constant-folding registry: operator kind to compile-time evaluator.

use std::collections::HashMap;

use crate::ir::StageId;
use crate::ops::{Op, OpKind};
use crate::types::TensorValue;
use crate::{Error, Result};

/// Inputs handed to a compile-time evaluator.
pub struct FoldCtx<'a> {
    pub stage: StageId,
    pub op: &'a Op,

    /// Constant value of every input, in port order.
    pub inputs: &'a [TensorValue],

    /// Declared shape of every output, in port order.
    pub output_shapes: &'a [Vec<usize>],
}

impl<'a> FoldCtx<'a> {
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&'a TensorValue> {
        self.inputs.get(index).ok_or_else(|| {
            Error::Fold(format!(
                "{} has no input {index} ({} given)",
                self.op.kind(),
                self.inputs.len()
            ))
        })
    }

    pub fn output_shape(&self, index: usize) -> Result<&'a [usize]> {
        self.output_shapes
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Fold(format!("{} has no output {index}", self.op.kind())))
    }
}

/// A compile-time evaluator for one operator kind.
///
/// Returns one value per stage output. An `Err` means the stage cannot be
/// evaluated with these inputs and is left for runtime.
pub trait ConstantFolder: Send + Sync {
    fn fold(&self, ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>>;
}

impl<F> ConstantFolder for F
where
    F: Fn(&FoldCtx<'_>) -> Result<Vec<TensorValue>> + Send + Sync,
{
    fn fold(&self, ctx: &FoldCtx<'_>) -> Result<Vec<TensorValue>> {
        self(ctx)
    }
}

/// Dispatch table from operator kind to evaluator.
///
/// Populated once, then shared read-only. A kind can be registered only
/// once, so the populated table does not depend on registration order.
///
/// # Example
///
/// ```ignore
/// let mut registry = FoldRegistry::new();
/// registry
///     .register(OpKind::Add, BinaryFolder::new(|a, b| a + b))?
///     .register(OpKind::Mul, BinaryFolder::new(|a, b| a * b))?;
/// ```
pub struct FoldRegistry {
    folders: HashMap<OpKind, Box<dyn ConstantFolder>>,
}

impl FoldRegistry {
    pub fn new() -> Self {
        Self {
            folders: HashMap::new(),
        }
    }

    /// Register the evaluator for an operator kind.
    ///
    /// Returns `self` for method chaining; fails if the kind already has one.
    pub fn register<F>(&mut self, kind: OpKind, folder: F) -> Result<&mut Self>
    where
        F: ConstantFolder + 'static,
    {
        if self.folders.contains_key(&kind) {
            return Err(Error::Registry(format!(
                "An evaluator for {kind} is already registered"
            )));
        }
        self.folders.insert(kind, Box::new(folder));
        Ok(self)
    }

    /// Look up the evaluator for a kind.
    pub fn get(&self, kind: OpKind) -> Option<&dyn ConstantFolder> {
        self.folders.get(&kind).map(|folder| folder.as_ref())
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.folders.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Registered kinds, in no particular order.
    pub fn kinds(&self) -> impl Iterator<Item = OpKind> + '_ {
        self.folders.keys().copied()
    }
}

impl Default for FoldRegistry {
    fn default() -> Self {
        Self::new()
    }
}
