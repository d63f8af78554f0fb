//! Compiler pass trait and the ordered compile phases.

use crate::ir::Graph;
use crate::registry::FoldRegistry;
use crate::Result;

/// Compile phase a graph has reached.
///
/// Each pass establishes exactly one phase, and phases are strictly ordered:
/// a pass may only run on a graph sitting at the phase right before its own
/// (or at its own phase, re-running the latest pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Freshly built by the front end.
    Raw,

    /// Compile-time-constant stages replaced by constant tensors.
    Folded,

    /// Every tensor carries its quantization scale.
    ScalesPropagated,

    /// Memory orders reached a fixed point (conversions inserted).
    OrdersResolved,

    /// Stride requirements merged per tensor.
    StridesResolved,

    /// Every port classified as batch-splittable or whole.
    BatchClassified,

    /// Layouts locked; stages finalized.
    LayoutFinalized,

    /// Every stage passed its final check.
    Checked,

    /// Stages ordered for execution.
    Scheduled,

    /// Buffers assigned.
    MemoryPlanned,
}

impl Phase {
    /// The phase that must be complete before this one can run.
    pub fn previous(self) -> Option<Phase> {
        match self {
            Phase::Raw => None,
            Phase::Folded => Some(Phase::Raw),
            Phase::ScalesPropagated => Some(Phase::Folded),
            Phase::OrdersResolved => Some(Phase::ScalesPropagated),
            Phase::StridesResolved => Some(Phase::OrdersResolved),
            Phase::BatchClassified => Some(Phase::StridesResolved),
            Phase::LayoutFinalized => Some(Phase::BatchClassified),
            Phase::Checked => Some(Phase::LayoutFinalized),
            Phase::Scheduled => Some(Phase::Checked),
            Phase::MemoryPlanned => Some(Phase::Scheduled),
        }
    }

    /// Whether a pass establishing `self` may run on a graph at `current`.
    pub fn can_run_after(self, current: Phase) -> bool {
        current == self || self.previous() == Some(current)
    }
}

/// Trait for implementing compiler passes.
///
/// A pass transforms or validates the graph and establishes one [`Phase`].
///
/// # Return Value
///
/// `run()` returns `Ok(true)` if the pass changed the graph and `Ok(false)`
/// otherwise; re-running a pass on its own output must return `Ok(false)`.
pub trait Pass: Send + Sync {
    /// Pass name, used for logging and diagnostics.
    fn name(&self) -> &str;

    /// The phase this pass establishes.
    fn phase(&self) -> Phase;

    /// Run the pass on the given graph.
    fn run(&self, graph: &mut Graph, registry: &FoldRegistry) -> Result<bool>;
}
