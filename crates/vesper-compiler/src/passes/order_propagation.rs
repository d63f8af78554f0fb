//! Memory order propagation to a fixed point.
//!
//! Every sweep visits the stages in dependency order and applies the order
//! requests each one declares:
//! - an unset tensor adopts the requested order;
//! - a producer may replace the order of a tensor it writes; when that
//!   order was fixed from outside the producer writes a fresh tensor
//!   instead and a conversion stage fills the fixed one;
//! - a consumer that needs a different order than the tensor has gets a
//!   conversion stage.
//!
//! Conversions are queued and inserted when the sweep ends. A fixed order on
//! a feedback state buffer cannot be converted: the buffer is the state
//! itself, so a mismatch there is a layout conflict.
//!
//! Sweeps repeat until one changes nothing.

use tracing::{debug, trace};
use vesper_core::{
    Diagnostic, Error, FoldRegistry, Graph, MemoryOrder, OrderRequest, Pass, PendingEdits,
    Phase, Port, Result, StageCtx, StageId, StageOp,
};

use super::{checked_stages, port_tensor};

/// Default bound on the number of sweeps.
pub const DEFAULT_MAX_SWEEPS: usize = 16;

pub struct OrderPropagationPass {
    max_sweeps: usize,
}

impl OrderPropagationPass {
    pub fn new(max_sweeps: usize) -> Self {
        Self { max_sweeps }
    }

    /// Give unproduced runtime tensors (graph inputs) the row-major order.
    fn seed_sources(&self, graph: &mut Graph) -> Result<usize> {
        let sources: Vec<_> = graph
            .tensors()
            .filter(|&(id, desc)| {
                desc.order.is_none()
                    && !desc.finalized
                    && !desc.is_constant()
                    && graph.producer(id).is_none()
            })
            .map(|(id, _)| id)
            .collect();
        for &id in &sources {
            let desc = graph.tensor_mut(id)?;
            desc.order = Some(MemoryOrder::identity(desc.rank()));
        }
        Ok(sources.len())
    }

    /// One visit of every stage. Returns the number of orders changed.
    fn sweep(&self, graph: &mut Graph, edits: &mut PendingEdits) -> Result<usize> {
        let mut changed = 0;
        for id in checked_stages(graph, self.name())? {
            if graph.stage(id)?.is_finalized() {
                continue;
            }
            let requests = {
                let ctx = StageCtx::new(graph, id, self.name())?;
                let requests = ctx.node.op().propagate_order(&ctx)?;
                let mut resolved = Vec::with_capacity(requests.len());
                for request in requests {
                    let tensor = port_tensor(&ctx, request.port)?;
                    let rank = ctx.graph.tensor(tensor)?.rank();
                    if request.order.rank() != rank {
                        return Err(ctx.internal(format!(
                            "order {} requested for rank-{rank} tensor {tensor}",
                            request.order
                        )));
                    }
                    resolved.push((tensor, request));
                }
                resolved
            };

            for (tensor, request) in requests {
                if self.apply_request(graph, id, tensor, request, edits)? {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    fn apply_request(
        &self,
        graph: &mut Graph,
        stage: StageId,
        tensor: vesper_core::TensorId,
        request: OrderRequest,
        edits: &mut PendingEdits,
    ) -> Result<bool> {
        let desc = graph.tensor_mut(tensor)?;
        if desc.finalized {
            return Ok(false);
        }
        let Some(existing) = desc.order.clone() else {
            trace!(tensor = %desc.name, order = %request.order, "adopt");
            desc.order = Some(request.order);
            return Ok(true);
        };
        if existing == request.order {
            return Ok(false);
        }

        match request.port {
            Port::Output(_) if desc.order_fixed && desc.persistent.is_some() => {
                Err(Error::LayoutConflict {
                    tensor,
                    existing: None,
                    existing_order: existing.to_string(),
                    requester: stage,
                    requested: request.order.to_string(),
                })
            }
            Port::Output(port) if desc.order_fixed => {
                trace!(tensor = %desc.name, fixed = %existing, produced = %request.order, "output conversion");
                edits.request_output_conversion(stage, port, tensor, request.order);
                Ok(false)
            }
            Port::Output(_) => {
                trace!(tensor = %desc.name, from = %existing, to = %request.order, "producer override");
                desc.order = Some(request.order);
                Ok(true)
            }
            Port::Input(port) => {
                trace!(tensor = %desc.name, have = %existing, want = %request.order, "conversion");
                edits.request_conversion(tensor, request.order, stage, port);
                Ok(false)
            }
        }
    }
}

impl Pass for OrderPropagationPass {
    fn name(&self) -> &str {
        "order_propagation"
    }

    fn phase(&self) -> Phase {
        Phase::OrdersResolved
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let mut changed = self.seed_sources(graph)? > 0;

        for sweep in 1..=self.max_sweeps {
            let mut edits = PendingEdits::new();
            let updated = self.sweep(graph, &mut edits)?;
            let conversions = if edits.is_empty() {
                0
            } else {
                graph.apply(edits)?.len()
            };
            debug!(sweep, updated, conversions, "order sweep");

            if updated == 0 && conversions == 0 {
                return Ok(changed);
            }
            changed = true;
        }

        Err(Error::Model(Diagnostic::new(
            self.name(),
            format!(
                "memory orders did not converge within {} sweeps (cyclic layout dependency)",
                self.max_sweeps
            ),
        )))
    }
}

impl Default for OrderPropagationPass {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SWEEPS)
    }
}
