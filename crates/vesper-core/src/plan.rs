//! Memory plan produced by the planner and handed to the backend.

use std::collections::BTreeMap;

use crate::ir::{StageId, StateId, TensorId};

/// Where a buffer lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Graph input or output, owned by the caller.
    Boundary,

    /// Stateful feedback buffer held across executions; one slot per state,
    /// holding the `MemoryRead` output.
    Persistent { index: usize },

    /// Compile-time content, stored with the weights.
    Constant,

    /// A slice of the reusable scratch arena.
    Arena { offset: usize, size: usize },
}

impl Region {
    /// Byte range inside the arena, for arena regions.
    pub fn arena_range(&self) -> Option<std::ops::Range<usize>> {
        match *self {
            Region::Arena { offset, size } => Some(offset..offset + size),
            _ => None,
        }
    }
}

/// Schedule positions during which a buffer must stay intact.
///
/// Both ends are inclusive: `start` is the producer's position and `end`
/// the position of the last consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifetime {
    pub start: usize,
    pub end: usize,
}

impl Lifetime {
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Placement of one tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    pub region: Region,

    /// Only arena tensors have a lifetime.
    pub lifetime: Option<Lifetime>,
}

/// Buffer assignment for every tensor and scratch buffer of a scheduled graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPlan {
    pub(crate) tensors: BTreeMap<TensorId, Allocation>,
    pub(crate) temps: BTreeMap<(StageId, usize), Allocation>,
    pub(crate) arena_size: usize,
    pub(crate) states: BTreeMap<StateId, usize>,
}

impl MemoryPlan {
    /// `states` maps every feedback state to its persistent slot.
    pub fn new(arena_size: usize, states: BTreeMap<StateId, usize>) -> Self {
        Self {
            arena_size,
            states,
            ..Self::default()
        }
    }

    pub fn insert_tensor(&mut self, tensor: TensorId, allocation: Allocation) {
        self.tensors.insert(tensor, allocation);
    }

    pub fn insert_temp(&mut self, stage: StageId, index: usize, allocation: Allocation) {
        self.temps.insert((stage, index), allocation);
    }

    pub fn tensor(&self, tensor: TensorId) -> Option<&Allocation> {
        self.tensors.get(&tensor)
    }

    pub fn temp(&self, stage: StageId, index: usize) -> Option<&Allocation> {
        self.temps.get(&(stage, index))
    }

    /// Tensor allocations in tensor id order.
    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &Allocation)> {
        self.tensors.iter().map(|(&id, alloc)| (id, alloc))
    }

    /// Scratch buffer allocations keyed by stage and buffer index.
    pub fn temps(&self) -> impl Iterator<Item = ((StageId, usize), &Allocation)> {
        self.temps.iter().map(|(&key, alloc)| (key, alloc))
    }

    /// Bytes needed for the reusable arena.
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    /// Number of persistent state slots.
    pub fn persistent_slots(&self) -> usize {
        self.states.len()
    }

    /// Slot a `MemoryWrite` of `state` commits into.
    pub fn state_slot(&self, state: StateId) -> Option<usize> {
        self.states.get(&state).copied()
    }
}
