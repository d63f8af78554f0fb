//! Layout finalization.

use tracing::{debug, trace};
use vesper_core::{FoldRegistry, Graph, MemoryOrder, Pass, Phase, Result, StageCtx, StageOp};

use super::checked_stages;

/// Lock every tensor layout, then finalize every stage.
///
/// Tensors whose order was never constrained get the row-major order. Each
/// stage may then request its scratch buffers; once finalized its edges and
/// attributes are immutable.
pub struct FinalizeLayoutPass;

impl FinalizeLayoutPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for FinalizeLayoutPass {
    fn name(&self) -> &str {
        "finalize_layout"
    }

    fn phase(&self) -> Phase {
        Phase::LayoutFinalized
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let open: Vec<_> = graph
            .tensors()
            .filter(|(_, desc)| !desc.finalized)
            .map(|(id, _)| id)
            .collect();
        for &id in &open {
            let desc = graph.tensor_mut(id)?;
            if desc.order.is_none() {
                desc.order = Some(MemoryOrder::identity(desc.rank()));
            }
            desc.finalized = true;
        }

        let mut stages = 0;
        for id in checked_stages(graph, self.name())? {
            if graph.stage(id)?.is_finalized() {
                continue;
            }
            let temps = {
                let ctx = StageCtx::new(graph, id, self.name())?;
                ctx.node.op().finalize_layout(&ctx)?
            };
            trace!(stage = id.index(), temps = temps.len(), "finalized");
            graph.stage_mut(id)?.finalize(temps);
            stages += 1;
        }

        debug!(tensors = open.len(), stages, "layouts finalized");
        Ok(!open.is_empty() || stages > 0)
    }
}

impl Default for FinalizeLayoutPass {
    fn default() -> Self {
        Self::new()
    }
}
