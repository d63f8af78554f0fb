//! Stride requirement propagation.

use tracing::debug;
use vesper_core::{FoldRegistry, Graph, Pass, Phase, Result, StageCtx, StageOp};

use super::{checked_stages, port_tensor};

/// Merge every stage's stride requests into the tensors they touch.
///
/// Merging keeps the most restrictive request and is monotonic, so a single
/// pass is enough.
pub struct StridePropagationPass;

impl StridePropagationPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for StridePropagationPass {
    fn name(&self) -> &str {
        "stride_propagation"
    }

    fn phase(&self) -> Phase {
        Phase::StridesResolved
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let mut tightened = 0;
        for id in checked_stages(graph, self.name())? {
            let requests = {
                let ctx = StageCtx::new(graph, id, self.name())?;
                let mut resolved = Vec::new();
                for (port, requirement) in ctx.node.op().required_strides(&ctx)? {
                    resolved.push((port_tensor(&ctx, port)?, requirement));
                }
                resolved
            };

            for (tensor, requirement) in requests {
                let desc = graph.tensor_mut(tensor)?;
                let merged = desc.strides.merge(requirement);
                if !desc.finalized && merged != desc.strides {
                    desc.strides = merged;
                    tightened += 1;
                }
            }
        }

        debug!(tightened, "strides resolved");
        Ok(tightened > 0)
    }
}

impl Default for StridePropagationPass {
    fn default() -> Self {
        Self::new()
    }
}
