//! Final validation before scheduling.

use tracing::debug;
use vesper_core::{Diagnostic, Error, FoldRegistry, Graph, Pass, Phase, Result, StageCtx, StageOp};

use super::checked_stages;

/// Run every stage's attribute checks against the finalized layout.
///
/// The first failure aborts compilation with the stage and the reason.
pub struct FinalCheckPass;

impl FinalCheckPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for FinalCheckPass {
    fn name(&self) -> &str {
        "final_check"
    }

    fn phase(&self) -> Phase {
        Phase::Checked
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        if let Some((_, desc)) = graph.tensors().find(|(_, desc)| !desc.finalized) {
            return Err(Error::Internal(Diagnostic::new(
                self.name(),
                format!("tensor '{}' reached the final check unfinalized", desc.name),
            )));
        }

        let stages = checked_stages(graph, self.name())?;
        for &id in &stages {
            let ctx = StageCtx::new(graph, id, self.name())?;
            if !ctx.node.is_finalized() {
                return Err(ctx.internal("stage reached the final check unfinalized"));
            }
            ctx.node.op().final_check(&ctx)?;
        }

        debug!(stages = stages.len(), "all stages checked");
        Ok(false)
    }
}

impl Default for FinalCheckPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ops::{BinaryOp, Mvn};
    use vesper_core::{DataType, Op, OpKind, TensorDesc};

    fn finalize_all(graph: &mut Graph) {
        let ids: Vec<_> = graph.tensors().map(|(id, _)| id).collect();
        for id in ids {
            graph.tensor_mut(id).unwrap().finalized = true;
        }
        for id in graph.stages().to_vec() {
            graph.stage_mut(id).unwrap().finalize(Vec::new());
        }
    }

    #[test]
    fn test_arity_mismatch_is_internal() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![4]);
        let y = graph.add_tensor(TensorDesc::new("y", DataType::F32, vec![4]));
        graph
            .add_stage("add", Op::Binary(BinaryOp::Add), vec![x], vec![y])
            .unwrap();
        finalize_all(&mut graph);

        let err = FinalCheckPass::new()
            .run(&mut graph, &FoldRegistry::new())
            .unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.diagnostic().unwrap().kind, Some(OpKind::Add));
    }

    #[test]
    fn test_unsupported_parameter_is_model_error() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![1, 2, 2, 2]);
        let y = graph.add_tensor(TensorDesc::new("y", DataType::F32, vec![1, 2, 2, 2]));
        let mvn = graph
            .add_stage(
                "mvn",
                Op::Mvn(Mvn {
                    normalize_variance: true,
                    across_channels: true,
                    eps: 1e-3,
                }),
                vec![x],
                vec![y],
            )
            .unwrap();
        finalize_all(&mut graph);

        match FinalCheckPass::new().run(&mut graph, &FoldRegistry::new()) {
            Err(Error::Model(diag)) => {
                assert_eq!(diag.stage, Some(mvn));
                assert_eq!(diag.kind, Some(OpKind::Mvn));
                assert_eq!(diag.pass, "final_check");
            }
            other => panic!("expected a model error, got {other:?}"),
        }
    }

    #[test]
    fn test_unfinalized_tensor_is_internal() {
        let mut graph = Graph::new();
        graph.add_input("x", DataType::F32, vec![4]);

        let err = FinalCheckPass::new()
            .run(&mut graph, &FoldRegistry::new())
            .unwrap_err();
        assert!(err.is_internal());
    }
}
