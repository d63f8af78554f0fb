//! The result of a successful compile and its emission to a backend.

use tracing::debug;
use vesper_core::{
    BackendSerializer, Binding, BlobSerializer, DataRef, DataSink, Diagnostic, Error, Graph,
    MemoryPlan, Phase, Result, StageCtx, StageId, StageOp, StageRecord, StrideRequirement,
    TensorDesc,
};

use crate::memory::plan_memory_with;

const SERIALIZE: &str = "serialize";

/// A fully lowered graph: every stage finalized and checked, scheduled, and
/// with buffers assigned.
///
/// Only [`compile`](crate::compile) produces one, so everything reachable
/// from it has passed the final check.
#[derive(Debug)]
pub struct CompiledGraph {
    graph: Graph,
    schedule: Vec<StageId>,
    memory_plan: MemoryPlan,
}

impl CompiledGraph {
    pub(crate) fn new(graph: Graph) -> Result<Self> {
        if graph.phase() != Phase::MemoryPlanned {
            return Err(Error::Internal(Diagnostic::new(
                "compile",
                format!("pipeline stopped at phase {:?}", graph.phase()),
            )));
        }
        let missing = |what: &str| {
            Error::Internal(Diagnostic::new("compile", format!("compiled graph has no {what}")))
        };
        let schedule = graph.schedule().ok_or_else(|| missing("schedule"))?.to_vec();
        let memory_plan = graph
            .memory_plan()
            .cloned()
            .ok_or_else(|| missing("memory plan"))?;
        Ok(Self {
            graph,
            schedule,
            memory_plan,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Stages in execution order.
    pub fn schedule(&self) -> &[StageId] {
        &self.schedule
    }

    pub fn memory_plan(&self) -> &MemoryPlan {
        &self.memory_plan
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Emit every stage in schedule order: its parameter blob and its bound
    /// buffers with their finalized layout, scale and region.
    pub fn serialize<S>(&self, out: &mut S) -> Result<()>
    where
        S: BackendSerializer + ?Sized,
    {
        for &id in &self.schedule {
            let ctx = StageCtx::new(&self.graph, id, SERIALIZE)?;
            let op = ctx.node.op();

            let mut params = BlobSerializer::new();
            op.serialize_params(&ctx, &mut params)?;
            let mut sink = DataSink::new();
            op.serialize_data(&ctx, &mut sink)?;

            let data = sink
                .into_bindings()
                .into_iter()
                .map(|binding| self.resolve(&ctx, binding))
                .collect::<Result<Vec<_>>>()?;

            out.emit_stage(StageRecord {
                stage: id,
                kind: ctx.kind(),
                params: params.into_bytes(),
                data,
            })?;
        }
        debug!(stages = self.schedule.len(), "serialized");
        Ok(())
    }

    fn resolve(&self, ctx: &StageCtx<'_>, binding: Binding) -> Result<DataRef> {
        match binding {
            Binding::Tensor(id) => {
                let desc = self.graph.tensor(id)?;
                let allocation = self
                    .memory_plan
                    .tensor(id)
                    .ok_or_else(|| ctx.internal(format!("tensor {id} has no buffer")))?;
                Ok(DataRef {
                    binding,
                    order: desc.order.clone(),
                    strides: desc.strides,
                    scale: desc.scale,
                    region: allocation.region,
                })
            }
            Binding::Temp(index) => {
                let allocation = self
                    .memory_plan
                    .temp(ctx.stage, index)
                    .ok_or_else(|| ctx.internal(format!("scratch buffer {index} has no buffer")))?;
                Ok(DataRef {
                    binding,
                    order: None,
                    strides: StrideRequirement::Compact,
                    scale: 1.0,
                    region: allocation.region,
                })
            }
        }
    }

    /// Recompute the memory plan for a different batch size.
    ///
    /// The leading dimension of every batch-splittable tensor becomes
    /// `batch`. Only graphs whose every edge is splittable can be re-planned.
    pub fn replan_for_batch(&mut self, batch: usize) -> Result<&MemoryPlan> {
        const PASS: &str = "replan_for_batch";
        if batch == 0 {
            return Err(Error::Model(Diagnostic::new(PASS, "batch size must be positive")));
        }
        if !self.graph.supports_dynamic_batch() {
            return Err(Error::Model(Diagnostic::new(
                PASS,
                "the graph has stages that need the whole batch",
            )));
        }

        let plan = plan_memory_with(&self.graph, |desc| batched_size(desc, batch))?;
        debug!(batch, arena_bytes = plan.arena_size(), "re-planned");
        self.graph.set_memory_plan(plan.clone());
        self.memory_plan = plan;
        Ok(&self.memory_plan)
    }
}

fn batched_size(desc: &TensorDesc, batch: usize) -> usize {
    match desc.shape.split_first() {
        Some((_, rest)) if desc.batch_splittable => {
            batch * rest.iter().product::<usize>() * desc.dtype.size_in_bytes()
        }
        _ => desc.size_in_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::DataType;

    #[test]
    fn test_batched_size() {
        let mut desc = TensorDesc::new("x", DataType::F32, vec![1, 3, 4]);
        assert_eq!(batched_size(&desc, 8), 48);
        desc.batch_splittable = true;
        assert_eq!(batched_size(&desc, 8), 8 * 12 * 4);
    }
}
