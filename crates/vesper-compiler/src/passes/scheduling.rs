//! Execution ordering.

use tracing::debug;
use vesper_core::{FoldRegistry, Graph, Pass, Phase, Result};

use crate::scheduler::schedule;

/// Replace the graph's iteration order by its topological schedule.
pub struct SchedulingPass;

impl SchedulingPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for SchedulingPass {
    fn name(&self) -> &str {
        "scheduling"
    }

    fn phase(&self) -> Phase {
        Phase::Scheduled
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let order = schedule(graph)?;
        if graph.schedule() == Some(order.as_slice()) {
            return Ok(false);
        }
        debug!(stages = order.len(), "scheduled");
        graph.set_schedule(order)?;
        Ok(true)
    }
}

impl Default for SchedulingPass {
    fn default() -> Self {
        Self::new()
    }
}
