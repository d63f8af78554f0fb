//! Memory planning over a scheduled graph.
//!
//! Every tensor gets a region. Graph inputs and outputs stay with the
//! caller, feedback state gets one persistent slot per state id holding the
//! `MemoryRead` output, constants
//! are stored with the weights, and everything else shares one reusable
//! arena. Arena buffers are placed greedily first-fit in order of lifetime
//! start, so two buffers share bytes only when their lifetimes are disjoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace};
use vesper_core::{
    Allocation, Diagnostic, Error, Graph, Lifetime, MemoryPlan, Region, Result, StageId,
    TensorDesc, TensorId,
};

/// Arena offsets and sizes are multiples of this.
pub const ALIGNMENT: usize = 64;

/// Plan buffers using each tensor's declared byte size.
pub fn plan_memory(graph: &Graph) -> Result<MemoryPlan> {
    plan_memory_with(graph, TensorDesc::size_in_bytes)
}

/// Plan buffers with a custom tensor size function.
///
/// Used by re-planning to substitute the batch dimension.
pub fn plan_memory_with<F>(graph: &Graph, size_of: F) -> Result<MemoryPlan>
where
    F: Fn(&TensorDesc) -> usize,
{
    let schedule = graph.schedule().ok_or_else(|| {
        Error::Internal(Diagnostic::new(
            "memory_planning",
            "the graph must be scheduled before planning memory",
        ))
    })?;
    let position: HashMap<StageId, usize> =
        schedule.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // Writes without a read still need a slot to commit into.
    let mut states = BTreeSet::new();
    for &id in schedule {
        states.extend(graph.stage(id)?.op().memory_state());
    }
    let slots: BTreeMap<_, usize> = states.into_iter().enumerate().map(|(i, s)| (s, i)).collect();

    let mut fixed = Vec::new();
    let mut requests = Vec::new();
    for (id, desc) in graph.tensors() {
        let region = if graph.is_boundary(id) {
            Region::Boundary
        } else if let Some(index) = desc.persistent.and_then(|state| slots.get(&state)) {
            Region::Persistent { index: *index }
        } else if desc.is_constant() {
            Region::Constant
        } else {
            requests.push(Request {
                owner: Owner::Tensor(id),
                lifetime: tensor_lifetime(graph, id, &position),
                size: aligned(size_of(desc)),
            });
            continue;
        };
        fixed.push((id, region));
    }

    for (pos, &stage) in schedule.iter().enumerate() {
        for (index, temp) in graph.stage(stage)?.temps().iter().enumerate() {
            requests.push(Request {
                owner: Owner::Temp(stage, index),
                lifetime: Lifetime {
                    start: pos,
                    end: pos,
                },
                size: aligned(temp.bytes),
            });
        }
    }

    requests.sort_by_key(|r| (r.lifetime.start, r.owner.sort_key(&position)));

    let mut arena = ArenaAllocator::default();
    let mut placed = Vec::with_capacity(requests.len());
    for request in requests {
        arena.release_before(request.lifetime.start);
        let offset = arena.allocate(request.size, request.lifetime.end);
        trace!(owner = ?request.owner, offset, size = request.size, "placed");
        placed.push((request, offset));
    }

    let mut plan = MemoryPlan::new(arena.top, slots);
    for (id, region) in fixed {
        plan.insert_tensor(
            id,
            Allocation {
                region,
                lifetime: None,
            },
        );
    }
    for (request, offset) in placed {
        let allocation = Allocation {
            region: Region::Arena {
                offset,
                size: request.size,
            },
            lifetime: Some(request.lifetime),
        };
        match request.owner {
            Owner::Tensor(id) => plan.insert_tensor(id, allocation),
            Owner::Temp(stage, index) => plan.insert_temp(stage, index, allocation),
        }
    }

    debug!(
        arena_bytes = plan.arena_size(),
        persistent_slots = plan.persistent_slots(),
        "memory planned"
    );
    Ok(plan)
}

/// Round up to the alignment; empty buffers still take one aligned block.
fn aligned(bytes: usize) -> usize {
    bytes.div_ceil(ALIGNMENT).max(1) * ALIGNMENT
}

/// Inclusive range from the producer's position to the last consumer's.
/// Unproduced tensors are live from the start.
fn tensor_lifetime(graph: &Graph, id: TensorId, position: &HashMap<StageId, usize>) -> Lifetime {
    let start = graph
        .producer(id)
        .and_then(|edge| position.get(&edge.stage))
        .copied()
        .unwrap_or(0);
    let end = graph
        .consumers(id)
        .iter()
        .filter_map(|edge| position.get(&edge.stage))
        .copied()
        .max()
        .unwrap_or(start)
        .max(start);
    Lifetime { start, end }
}

#[derive(Debug, Clone, Copy)]
enum Owner {
    Tensor(TensorId),
    Temp(StageId, usize),
}

impl Owner {
    /// Tensors by id first, then scratch buffers by stage position.
    fn sort_key(&self, position: &HashMap<StageId, usize>) -> (u8, usize, usize) {
        match *self {
            Owner::Tensor(id) => (0, id.index(), 0),
            Owner::Temp(stage, index) => (1, position.get(&stage).copied().unwrap_or(0), index),
        }
    }
}

#[derive(Debug)]
struct Request {
    owner: Owner,
    lifetime: Lifetime,
    size: usize,
}

/// First-fit allocator over a coalescing free list.
#[derive(Debug, Default)]
struct ArenaAllocator {
    /// Free blocks `(offset, size)`, sorted by offset and never adjacent.
    free: Vec<(usize, usize)>,
    /// Live blocks `(last position, offset, size)`.
    live: Vec<(usize, usize, usize)>,
    top: usize,
}

impl ArenaAllocator {
    /// Return every block whose lifetime ended before `start`.
    fn release_before(&mut self, start: usize) {
        let mut index = 0;
        while index < self.live.len() {
            if self.live[index].0 < start {
                let (_, offset, size) = self.live.swap_remove(index);
                self.free_block(offset, size);
            } else {
                index += 1;
            }
        }
    }

    fn free_block(&mut self, offset: usize, size: usize) {
        let at = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(at, (offset, size));

        if at + 1 < self.free.len() {
            let (next_offset, next_size) = self.free[at + 1];
            if offset + size == next_offset {
                self.free[at].1 += next_size;
                self.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_offset, prev_size) = self.free[at - 1];
            if prev_offset + prev_size == self.free[at].0 {
                self.free[at - 1].1 += self.free[at].1;
                self.free.remove(at);
            }
        }
    }

    /// Place `size` bytes at the lowest offset that fits.
    fn allocate(&mut self, size: usize, end: usize) -> usize {
        let offset = if let Some(index) = self.free.iter().position(|&(_, s)| s >= size) {
            let (offset, block) = self.free[index];
            if block == size {
                self.free.remove(index);
            } else {
                self.free[index] = (offset + size, block - size);
            }
            offset
        } else if let Some(&(offset, block)) = self.free.last().filter(|&&(o, s)| o + s == self.top)
        {
            // Grow the trailing free block instead of leaving it stranded.
            self.free.pop();
            self.top += size - block;
            offset
        } else {
            let offset = self.top;
            self.top += size;
            offset
        };
        self.live.push((end, offset, size));
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::ops::{Activation, MemoryRead, MemoryWrite, Mvn};
    use vesper_core::{DataType, Op, StateId, TensorValue};

    fn relu() -> Op {
        Op::Activation(Activation::Relu)
    }

    /// x -> a -> b -> c -> d -> out, each tensor 256 bytes.
    fn chain(graph: &mut Graph) -> Vec<TensorId> {
        let x = graph.add_input("x", DataType::F32, vec![64]);
        let mut tensors = vec![x];
        for name in ["a", "b", "c", "d"] {
            let t = graph.add_tensor(TensorDesc::new(name, DataType::F32, vec![64]));
            let prev = *tensors.last().unwrap();
            graph.add_stage(name, relu(), vec![prev], vec![t]).unwrap();
            tensors.push(t);
        }
        let out = *tensors.last().unwrap();
        graph.mark_output(out).unwrap();
        let order = graph.stages().to_vec();
        graph.set_schedule(order).unwrap();
        tensors
    }

    #[test]
    fn test_aligned() {
        assert_eq!(aligned(0), 64);
        assert_eq!(aligned(1), 64);
        assert_eq!(aligned(64), 64);
        assert_eq!(aligned(65), 128);
    }

    #[test]
    fn test_chain_reuses_slots() {
        let mut graph = Graph::new();
        let t = chain(&mut graph);
        let plan = plan_memory(&graph).unwrap();

        assert_eq!(plan.tensor(t[0]).unwrap().region, Region::Boundary);
        assert_eq!(plan.tensor(t[4]).unwrap().region, Region::Boundary);

        // a: [0,1], b: [1,2], c: [2,3]; a and c may share, b may not.
        let range = |id| plan.tensor(id).unwrap().region.arena_range().unwrap();
        assert!(range(t[1]).end <= range(t[2]).start || range(t[2]).end <= range(t[1]).start);
        assert_eq!(range(t[1]), range(t[3]));
        assert_eq!(plan.arena_size(), 512);
    }

    #[test]
    fn test_overlapping_lifetimes_never_share() {
        let mut graph = Graph::new();
        chain(&mut graph);
        let plan = plan_memory(&graph).unwrap();

        let arena: Vec<_> = plan
            .tensors()
            .filter_map(|(_, a)| Some((a.region.arena_range()?, a.lifetime?)))
            .collect();
        for (i, (ra, la)) in arena.iter().enumerate() {
            for (rb, lb) in &arena[i + 1..] {
                if la.overlaps(lb) {
                    assert!(ra.end <= rb.start || rb.end <= ra.start);
                }
            }
        }
    }

    #[test]
    fn test_constants_and_state_are_not_pooled() {
        let mut graph = Graph::new();
        let state = StateId(2);
        let h = graph.add_tensor(TensorDesc::new("h", DataType::F32, vec![4]));
        let w = graph.add_constant_tensor("w", TensorValue::from_f32(vec![1.0; 4]));
        let next = graph.add_tensor(TensorDesc::new("next", DataType::F32, vec![4]));
        graph
            .add_stage("read", Op::MemoryRead(MemoryRead { state }), vec![], vec![h])
            .unwrap();
        graph
            .add_stage(
                "add",
                Op::Binary(vesper_core::ops::BinaryOp::Add),
                vec![h, w],
                vec![next],
            )
            .unwrap();
        graph
            .add_stage("write", Op::MemoryWrite(MemoryWrite { state }), vec![next], vec![])
            .unwrap();
        let order = graph.stages().to_vec();
        graph.set_schedule(order).unwrap();

        let plan = plan_memory(&graph).unwrap();
        assert_eq!(plan.tensor(h).unwrap().region, Region::Persistent { index: 0 });
        assert_eq!(plan.tensor(w).unwrap().region, Region::Constant);
        assert_eq!(plan.persistent_slots(), 1);
        assert_eq!(plan.state_slot(state), Some(0));

        // The next value is staged in the arena until the write commits it.
        let staged = plan.tensor(next).unwrap();
        assert_eq!(staged.region, Region::Arena { offset: 0, size: 64 });
        assert_eq!(staged.lifetime, Some(Lifetime { start: 1, end: 2 }));
        assert_eq!(plan.arena_size(), 64);
    }

    #[test]
    fn test_write_without_read_gets_a_slot() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![4]);
        graph
            .add_stage(
                "write",
                Op::MemoryWrite(MemoryWrite { state: StateId(5) }),
                vec![x],
                vec![],
            )
            .unwrap();
        let order = graph.stages().to_vec();
        graph.set_schedule(order).unwrap();

        let plan = plan_memory(&graph).unwrap();
        assert_eq!(plan.state_slot(StateId(5)), Some(0));
        assert_eq!(plan.tensor(x).unwrap().region, Region::Boundary);
    }

    #[test]
    fn test_temps_live_at_their_stage() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", DataType::F32, vec![1, 8, 2, 2]);
        let y = graph.add_tensor(TensorDesc::new("y", DataType::F32, vec![1, 8, 2, 2]));
        let mvn = graph
            .add_stage(
                "mvn",
                Op::Mvn(Mvn {
                    normalize_variance: true,
                    across_channels: false,
                    eps: 1e-9,
                }),
                vec![x],
                vec![y],
            )
            .unwrap();
        graph.mark_output(y).unwrap();
        graph.stage_mut(mvn).unwrap().finalize(vec![vesper_core::TempBuffer {
            name: "scratch".to_string(),
            bytes: 100,
        }]);
        graph.set_schedule(vec![mvn]).unwrap();

        let plan = plan_memory(&graph).unwrap();
        let temp = plan.temp(mvn, 0).unwrap();
        assert_eq!(temp.lifetime, Some(Lifetime { start: 0, end: 0 }));
        assert_eq!(temp.region, Region::Arena { offset: 0, size: 128 });
    }

    #[test]
    fn test_unscheduled_graph_is_internal_error() {
        let graph = Graph::new();
        assert!(plan_memory(&graph).unwrap_err().is_internal());
    }

    #[test]
    fn test_free_list_coalesces() {
        let mut arena = ArenaAllocator::default();
        let a = arena.allocate(64, 0);
        let b = arena.allocate(64, 0);
        let c = arena.allocate(64, 5);
        assert_eq!((a, b, c), (0, 64, 128));

        arena.release_before(1);
        assert_eq!(arena.free, vec![(0, 128)]);
        assert_eq!(arena.allocate(128, 2), 0);

        arena.release_before(6);
        assert_eq!(arena.free, vec![(0, 192)]);
        assert_eq!(arena.allocate(256, 7), 0);
        assert_eq!(arena.top, 256);
    }
}
