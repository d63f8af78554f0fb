//! Batch-splitting classification.

use tracing::{debug, trace};
use vesper_core::{
    BatchSupport, FoldRegistry, Graph, Pass, Phase, Port, Result, StageCtx, StageOp,
};

use super::checked_stages;

/// Record per port whether each stage can run once per batch element, then
/// mark the tensors every one of whose edges is splittable.
pub struct BatchClassificationPass;

impl BatchClassificationPass {
    pub fn new() -> Self {
        Self
    }

    /// Whether every edge of a runtime tensor allows splitting.
    fn tensor_splittable(graph: &Graph, id: vesper_core::TensorId) -> bool {
        let Ok(desc) = graph.tensor(id) else {
            return false;
        };
        let edges: Vec<_> = graph
            .producer(id)
            .into_iter()
            .chain(graph.consumers(id))
            .collect();
        !desc.is_constant()
            && !edges.is_empty()
            && edges.iter().all(|edge| {
                graph
                    .stage(edge.stage)
                    .map(|node| node.batch_support(edge.port) == BatchSupport::Split)
                    .unwrap_or(false)
            })
    }
}

impl Pass for BatchClassificationPass {
    fn name(&self) -> &str {
        "batch_classification"
    }

    fn phase(&self) -> Phase {
        Phase::BatchClassified
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let mut changed = 0;
        for id in checked_stages(graph, self.name())? {
            let node = graph.stage(id)?;
            if node.is_finalized() {
                continue;
            }
            let mut inputs = vec![BatchSupport::Whole; node.inputs().len()];
            let mut outputs = vec![BatchSupport::Whole; node.outputs().len()];
            {
                let ctx = StageCtx::new(graph, id, self.name())?;
                for (port, support) in node.op().batch_support(&ctx)? {
                    let slot = match port {
                        Port::Input(i) => inputs.get_mut(i),
                        Port::Output(i) => outputs.get_mut(i),
                    };
                    let Some(slot) = slot else {
                        return Err(ctx.internal(format!("batch support for missing {port:?}")));
                    };
                    *slot = support;
                }
            }

            let unchanged = inputs
                .iter()
                .enumerate()
                .all(|(i, &s)| node.batch_support(Port::Input(i)) == s)
                && outputs
                    .iter()
                    .enumerate()
                    .all(|(i, &s)| node.batch_support(Port::Output(i)) == s);
            if !unchanged {
                trace!(stage = %node.name, ?inputs, ?outputs, "batch support");
                graph.stage_mut(id)?.set_batch_support(inputs, outputs)?;
                changed += 1;
            }
        }

        let tensors: Vec<_> = graph.tensors().map(|(id, _)| id).collect();
        for id in tensors {
            let splittable = Self::tensor_splittable(graph, id);
            let desc = graph.tensor_mut(id)?;
            if !desc.finalized && desc.batch_splittable != splittable {
                desc.batch_splittable = splittable;
                changed += 1;
            }
        }

        debug!(changed, dynamic_batch = graph.supports_dynamic_batch(), "batch classified");
        Ok(changed > 0)
    }
}

impl Default for BatchClassificationPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ops::{Activation, Permute};
    use vesper_core::{DataType, Op, TensorDesc};

    #[test]
    fn test_split_only_when_every_edge_allows_it() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![2, 3]);
        let y = graph.add_tensor(TensorDesc::new("y", DataType::F32, vec![2, 3]));
        let z = graph.add_tensor(TensorDesc::new("z", DataType::F32, vec![3, 2]));
        let relu = graph
            .add_stage("relu", Op::Activation(Activation::Relu), vec![x], vec![y])
            .unwrap();
        graph
            .add_stage("permute", Op::Permute(Permute { perm: vec![1, 0] }), vec![y], vec![z])
            .unwrap();

        let pass = BatchClassificationPass::new();
        assert!(pass.run(&mut graph, &FoldRegistry::new()).unwrap());

        let node = graph.stage(relu).unwrap();
        assert_eq!(node.batch_support(Port::Input(0)), BatchSupport::Split);
        assert!(graph.tensor(x).unwrap().batch_splittable);
        // permute needs the whole batch, so y is not splittable.
        assert!(!graph.tensor(y).unwrap().batch_splittable);
        assert!(!graph.supports_dynamic_batch());

        assert!(!pass.run(&mut graph, &FoldRegistry::new()).unwrap());
    }
}
