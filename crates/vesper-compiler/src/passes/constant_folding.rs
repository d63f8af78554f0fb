//! Constant folding pass.
//!
//! Forward pass in topological order that replaces stages whose inputs are
//! all compile-time constants by constant tensors holding their outputs.

use tracing::{debug, trace, warn};
use vesper_core::{
    Error, FoldCtx, FoldRegistry, Graph, Pass, Phase, Result, StageId, TensorValue,
};

use super::checked_stages;

/// Pass that folds constant stages at compile time.
///
/// For each stage whose every input carries content, the evaluator
/// registered for its kind is invoked and the stage is replaced by its
/// precomputed outputs. Stages without an evaluator stay for runtime, as do
/// stages whose evaluator rejects the inputs. Constant tensors left without
/// consumers are removed afterwards.
pub struct ConstantFoldingPass {
    enabled: bool,
}

impl ConstantFoldingPass {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// A pass that only establishes the phase without folding anything.
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Attempt to fold a single stage. Returns whether it was replaced.
    fn fold_stage(&self, graph: &mut Graph, id: StageId, registry: &FoldRegistry) -> Result<bool> {
        let node = graph.stage(id)?;
        if node.is_finalized() || node.inputs().is_empty() {
            return Ok(false);
        }
        let kind = node.kind();
        let Some(folder) = registry.get(kind) else {
            return Ok(false);
        };
        let Some(inputs) = constant_inputs(graph, id)? else {
            return Ok(false);
        };

        let mut output_shapes = Vec::with_capacity(node.outputs().len());
        let mut output_types = Vec::with_capacity(node.outputs().len());
        for &output in node.outputs() {
            let desc = graph.tensor(output)?;
            output_shapes.push(desc.shape.clone());
            output_types.push(desc.dtype);
        }

        let ctx = FoldCtx {
            stage: id,
            op: node.op(),
            inputs: &inputs,
            output_shapes: &output_shapes,
        };
        let values = match folder.fold(&ctx) {
            Ok(values) => values,
            Err(e) => {
                warn!(stage = %node.name, %kind, error = %e, "evaluator failed, leaving stage for runtime");
                return Ok(false);
            }
        };

        if values.len() != output_shapes.len() {
            return Err(Error::internal(
                id,
                kind,
                self.name(),
                format!(
                    "evaluator returned {} values for {} outputs",
                    values.len(),
                    output_shapes.len()
                ),
            ));
        }
        for (i, value) in values.iter().enumerate() {
            if value.shape != output_shapes[i] || value.dtype != output_types[i] {
                return Err(Error::internal(
                    id,
                    kind,
                    self.name(),
                    format!(
                        "evaluator returned {:?} {:?} for output {i} declared as {:?} {:?}",
                        value.dtype, value.shape, output_types[i], output_shapes[i]
                    ),
                ));
            }
        }

        trace!(stage = %node.name, %kind, "folded");
        graph.fold_stage(id, values)?;
        Ok(true)
    }
}

/// Values of every input, or `None` if any input is produced at runtime.
fn constant_inputs(graph: &Graph, id: StageId) -> Result<Option<Vec<TensorValue>>> {
    let node = graph.stage(id)?;
    let mut values = Vec::with_capacity(node.inputs().len());
    for &input in node.inputs() {
        match graph.tensor(input)?.constant_value()? {
            Some(value) => values.push(value),
            None => return Ok(None),
        }
    }
    Ok(Some(values))
}

/// Remove constants nothing reads anymore. Returns how many were removed.
fn eliminate_dead_constants(graph: &mut Graph) -> Result<usize> {
    let dead: Vec<_> = graph
        .tensors()
        .filter(|&(id, desc)| {
            desc.is_constant()
                && graph.producer(id).is_none()
                && graph.consumers(id).is_empty()
                && !graph.is_boundary(id)
        })
        .map(|(id, _)| id)
        .collect();
    for &id in &dead {
        graph.remove_tensor(id)?;
    }
    Ok(dead.len())
}

impl Pass for ConstantFoldingPass {
    fn name(&self) -> &str {
        "constant_folding"
    }

    fn phase(&self) -> Phase {
        Phase::Folded
    }

    fn run(&self, graph: &mut Graph, registry: &FoldRegistry) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let mut folded = 0;
        for id in checked_stages(graph, self.name())? {
            if self.fold_stage(graph, id, registry)? {
                folded += 1;
            }
        }
        let removed = eliminate_dead_constants(graph)?;

        debug!(folded, removed, "constant folding complete");
        Ok(folded > 0 || removed > 0)
    }
}

impl Default for ConstantFoldingPass {
    fn default() -> Self {
        Self::new()
    }
}
