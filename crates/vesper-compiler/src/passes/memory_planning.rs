//! Buffer assignment.

use vesper_core::{FoldRegistry, Graph, Pass, Phase, Result};

use crate::memory::plan_memory;

/// Attach a memory plan to the scheduled graph.
pub struct MemoryPlanningPass;

impl MemoryPlanningPass {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for MemoryPlanningPass {
    fn name(&self) -> &str {
        "memory_planning"
    }

    fn phase(&self) -> Phase {
        Phase::MemoryPlanned
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let plan = plan_memory(graph)?;
        if graph.memory_plan() == Some(&plan) {
            return Ok(false);
        }
        graph.set_memory_plan(plan);
        Ok(true)
    }
}

impl Default for MemoryPlanningPass {
    fn default() -> Self {
        Self::new()
    }
}
