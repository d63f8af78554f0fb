//! Quantization scale propagation.

use tracing::{debug, trace};
use vesper_core::{FoldRegistry, Graph, Pass, Phase, Result, StageCtx, StageOp};

use super::checked_stages;

/// Forward pass computing every stage output's scale from its input scales.
///
/// Stages are visited in dependency order, so one pass sees final input
/// scales everywhere.
pub struct ScalePropagationPass;

impl ScalePropagationPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for ScalePropagationPass {
    fn name(&self) -> &str {
        "scale_propagation"
    }

    fn phase(&self) -> Phase {
        Phase::ScalesPropagated
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let mut updated = 0;
        for id in checked_stages(graph, self.name())? {
            let (outputs, scales) = {
                let ctx = StageCtx::new(graph, id, self.name())?;
                let scales = ctx.node.op().propagate_scale(&ctx)?;
                if scales.len() != ctx.output_count() {
                    return Err(ctx.internal(format!(
                        "{} scales returned for {} outputs",
                        scales.len(),
                        ctx.output_count()
                    )));
                }
                (ctx.node.outputs().to_vec(), scales)
            };

            for (tensor, scale) in outputs.into_iter().zip(scales) {
                let desc = graph.tensor_mut(tensor)?;
                if desc.finalized || desc.scale == scale {
                    continue;
                }
                trace!(tensor = %desc.name, from = desc.scale, to = scale, "scale");
                desc.scale = scale;
                updated += 1;
            }
        }

        debug!(updated, "scales propagated");
        Ok(updated > 0)
    }
}

impl Default for ScalePropagationPass {
    fn default() -> Self {
        Self::new()
    }
}
