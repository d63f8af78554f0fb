//! Permute chain fusion.
//!
//! Runs right after constant folding. A permute reading the output of
//! another permute that has no other reader is merged into it, so a chain
//! collapses into one stage with the composed permutation. A permute whose
//! permutation is the identity is dropped and its readers take its input.

use tracing::{debug, trace};
use vesper_core::{
    FoldRegistry, Graph, MemoryOrder, Op, Pass, Phase, Result, StageId, TensorId,
};

use super::checked_stages;

#[derive(Debug, Default)]
struct Fused {
    merged: usize,
    removed: usize,
}

pub struct PermuteFusionPass;

impl PermuteFusionPass {
    pub fn new() -> Self {
        Self
    }

    /// Merge `id` with an upstream permute and drop it if it became the
    /// identity. Stages that are not permutes are skipped.
    fn fuse(&self, graph: &mut Graph, id: StageId, fused: &mut Fused) -> Result<()> {
        let Some((input, output, mut perm)) = permute_of(graph, id)? else {
            return Ok(());
        };

        if let Some((upstream, source, composed)) = upstream_merge(graph, input, &perm)? {
            trace!(stage = %graph.stage(id)?.name, ?composed, "merged upstream permute");
            graph.rewire_input(id, 0, source)?;
            graph.remove_stage(upstream)?;
            if let Op::Permute(permute) = graph.stage_mut(id)?.op_mut()? {
                permute.perm = composed.clone();
            }
            perm = composed;
            fused.merged += 1;
        }

        let source = graph.stage(id)?.inputs()[0];
        if is_identity(&perm) && removable(graph, source, output)? {
            trace!(stage = %graph.stage(id)?.name, "dropped identity permute");
            graph.replace_tensor(output, source)?;
            graph.remove_stage(id)?;
            fused.removed += 1;
        }
        Ok(())
    }
}

/// Input, output and permutation of a live, unfinalized permute stage.
fn permute_of(graph: &Graph, id: StageId) -> Result<Option<(TensorId, TensorId, Vec<usize>)>> {
    if !graph.contains_stage(id) {
        return Ok(None);
    }
    let node = graph.stage(id)?;
    let Op::Permute(permute) = node.op() else {
        return Ok(None);
    };
    if node.is_finalized() {
        return Ok(None);
    }
    Ok(Some((node.inputs()[0], node.outputs()[0], permute.perm.clone())))
}

/// The upstream permute feeding `input` when it can be merged away: its
/// output has no other reader and is not a graph tensor, and both
/// permutations are valid for the same rank. Returns the upstream stage, its
/// input and the composed permutation.
fn upstream_merge(
    graph: &Graph,
    input: TensorId,
    perm: &[usize],
) -> Result<Option<(StageId, TensorId, Vec<usize>)>> {
    let Some(edge) = graph.producer(input) else {
        return Ok(None);
    };
    if graph.consumers(input).len() != 1 || graph.is_boundary(input) {
        return Ok(None);
    }
    let upstream = edge.stage;
    let Some((source, _, first)) = permute_of(graph, upstream)? else {
        return Ok(None);
    };
    if first.len() != perm.len() || !is_permutation(&first) || !is_permutation(perm) {
        return Ok(None);
    }

    // out[i] = mid[perm[i]] = in[first[perm[i]]]
    let composed = perm.iter().map(|&axis| first[axis]).collect();
    Ok(Some((upstream, source, composed)))
}

/// Whether readers of `output` can read `source` directly instead.
fn removable(graph: &Graph, source: TensorId, output: TensorId) -> Result<bool> {
    if graph.is_boundary(output) {
        return Ok(false);
    }
    let (from, to) = (graph.tensor(source)?, graph.tensor(output)?);
    Ok(from.dtype == to.dtype && from.shape == to.shape)
}

fn is_permutation(perm: &[usize]) -> bool {
    MemoryOrder::from_perm(perm.to_vec()).is_ok()
}

fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &axis)| i == axis)
}

impl Pass for PermuteFusionPass {
    fn name(&self) -> &str {
        "permute_fusion"
    }

    fn phase(&self) -> Phase {
        Phase::Folded
    }

    fn run(&self, graph: &mut Graph, _registry: &FoldRegistry) -> Result<bool> {
        let mut fused = Fused::default();
        for id in checked_stages(graph, self.name())? {
            self.fuse(graph, id, &mut fused)?;
        }

        debug!(merged = fused.merged, removed = fused.removed, "permute fusion complete");
        Ok(fused.merged > 0 || fused.removed > 0)
    }
}

impl Default for PermuteFusionPass {
    fn default() -> Self {
        Self::new()
    }
}
