//! The fixed lowering passes, one per compile phase.

mod batch_classification;
mod constant_folding;
mod final_check;
mod finalize;
mod memory_planning;
mod order_propagation;
mod permute_fusion;
mod scale_propagation;
mod scheduling;
mod stride_propagation;

pub use batch_classification::BatchClassificationPass;
pub use constant_folding::ConstantFoldingPass;
pub use final_check::FinalCheckPass;
pub use finalize::FinalizeLayoutPass;
pub use memory_planning::MemoryPlanningPass;
pub use order_propagation::{OrderPropagationPass, DEFAULT_MAX_SWEEPS};
pub use permute_fusion::PermuteFusionPass;
pub use scale_propagation::ScalePropagationPass;
pub use scheduling::SchedulingPass;
pub use stride_propagation::StridePropagationPass;

use vesper_core::{Graph, Port, Result, StageCtx, StageId, TensorId};

/// Stages in dependency order, with the edge-count precondition checked on
/// every one of them.
fn checked_stages(graph: &Graph, pass: &str) -> Result<Vec<StageId>> {
    let order = crate::scheduler::schedule(graph)?;
    for &id in &order {
        graph.stage(id)?.check_arity(id, pass)?;
    }
    Ok(order)
}

/// The tensor bound to a port of the stage in `ctx`.
fn port_tensor(ctx: &StageCtx<'_>, port: Port) -> Result<TensorId> {
    match port {
        Port::Input(i) => ctx.input_id(i),
        Port::Output(i) => ctx.output_id(i),
    }
}
