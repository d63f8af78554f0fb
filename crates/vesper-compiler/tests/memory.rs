//! Buffer assignment on compiled graphs: arena reuse, feedback state and
//! batch re-planning.

mod common;

use common::*;
use vesper_compiler::memory::ALIGNMENT;
use vesper_core::ops::{Activation, BinaryOp, MemoryRead, MemoryWrite, Permute};
use vesper_core::{Allocation, DataType, Graph, Op, StateId, TensorValue};

fn arena_allocations(compiled: &CompiledGraph) -> Vec<Allocation> {
    let plan = compiled.memory_plan();
    plan.tensors()
        .map(|(_, alloc)| *alloc)
        .chain(plan.temps().map(|(_, alloc)| *alloc))
        .filter(|alloc| alloc.region.arena_range().is_some())
        .collect()
}

#[test]
fn test_live_buffers_never_overlap() {
    init_tracing();
    let mut graph = make_diamond(&[4, 16]);
    let x = graph.inputs()[0];
    let mut current = graph.outputs()[0];
    // Fan out so several arena buffers are live at once.
    let mut branches = Vec::new();
    for i in 0..3 {
        let (_, out) = unary(
            &mut graph,
            &format!("branch_{i}"),
            Op::Activation(Activation::Tanh),
            x,
            &[4, 16],
        );
        branches.push(out);
    }
    for (i, &branch) in branches.iter().enumerate() {
        let (_, out) = binary(
            &mut graph,
            &format!("join_{i}"),
            BinaryOp::Add,
            current,
            branch,
            &[4, 16],
        );
        current = out;
    }
    graph.mark_output(current).unwrap();

    let compiled = compile_default(graph).unwrap();
    let allocations = arena_allocations(&compiled);
    assert!(!allocations.is_empty());

    for (i, a) in allocations.iter().enumerate() {
        let range = a.region.arena_range().unwrap();
        assert_eq!(range.start % ALIGNMENT, 0);
        assert!(range.end <= compiled.memory_plan().arena_size());
        for b in &allocations[i + 1..] {
            let other = b.region.arena_range().unwrap();
            let disjoint_bytes = range.end <= other.start || other.end <= range.start;
            if !disjoint_bytes {
                assert!(
                    !a.lifetime.unwrap().overlaps(&b.lifetime.unwrap()),
                    "{a:?} and {b:?} share bytes while both live"
                );
            }
        }
    }
}

#[test]
fn test_chain_ping_pongs_two_buffers() {
    let (graph, _) = make_relu_chain(6, &[32]);
    let compiled = compile_default(graph).unwrap();

    // 5 intermediates of 128 bytes each; only two are ever live together.
    assert_eq!(arena_allocations(&compiled).len(), 5);
    assert_eq!(compiled.memory_plan().arena_size(), 2 * 128);
}

#[test]
fn test_feedback_state_has_one_persistent_slot() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", DataType::F32, vec![1, 16]);
    let state = activation(&mut graph, "state", &[1, 16]);
    let read = graph
        .add_stage(
            "read",
            Op::MemoryRead(MemoryRead { state: StateId(7) }),
            vec![],
            vec![state],
        )
        .unwrap();
    let (_, next) = binary(&mut graph, "accumulate", BinaryOp::Add, x, state, &[1, 16]);
    let write = graph
        .add_stage(
            "write",
            Op::MemoryWrite(MemoryWrite { state: StateId(7) }),
            vec![next],
            vec![],
        )
        .unwrap();
    let (_, y) = unary(
        &mut graph,
        "relu",
        Op::Activation(Activation::Relu),
        next,
        &[1, 16],
    );
    graph.mark_output(y).unwrap();

    let compiled = compile_default(graph).unwrap();
    let schedule = compiled.schedule();
    assert!(position(schedule, read) < position(schedule, write));

    let plan = compiled.memory_plan();
    assert_eq!(plan.persistent_slots(), 1);
    assert_eq!(plan.state_slot(StateId(7)), Some(0));
    assert_eq!(
        plan.tensor(state).unwrap().region,
        Region::Persistent { index: 0 }
    );
    assert!(plan.tensor(next).unwrap().region.arena_range().is_some());
    assert_eq!(plan.tensor(y).unwrap().region, Region::Boundary);
}

#[test]
fn test_state_survives_until_its_last_reader() {
    let mut graph = Graph::new();
    let h = activation(&mut graph, "h", &[1, 16]);
    let read = graph
        .add_stage(
            "read",
            Op::MemoryRead(MemoryRead { state: StateId(1) }),
            vec![],
            vec![h],
        )
        .unwrap();
    let (step, next) = unary(
        &mut graph,
        "step",
        Op::Activation(Activation::Sigmoid),
        h,
        &[1, 16],
    );
    let write = graph
        .add_stage(
            "write",
            Op::MemoryWrite(MemoryWrite { state: StateId(1) }),
            vec![next],
            vec![],
        )
        .unwrap();
    let (late, out) = unary(
        &mut graph,
        "late",
        Op::Activation(Activation::Relu),
        h,
        &[1, 16],
    );
    graph.mark_output(out).unwrap();

    let compiled = compile_default(graph).unwrap();
    let schedule = compiled.schedule();
    assert!(position(schedule, read) < position(schedule, step));
    assert!(position(schedule, late) < position(schedule, write));

    // The value being written never lands in the buffer still being read.
    let plan = compiled.memory_plan();
    let current = plan.tensor(h).unwrap();
    let staged = plan.tensor(next).unwrap();
    assert_eq!(current.region, Region::Persistent { index: 0 });
    assert_ne!(staged.region, current.region);
    let lifetime = staged.lifetime.unwrap();
    assert_eq!(lifetime.start, position(schedule, step));
    assert_eq!(lifetime.end, position(schedule, write));
}

#[test]
fn test_constants_stay_out_of_the_arena() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", DataType::F32, vec![4]);
    let bias = graph.add_constant_tensor("bias", TensorValue::from_f32(vec![0.5; 4]));
    let (_, y) = binary(&mut graph, "add", BinaryOp::Add, x, bias, &[4]);
    graph.mark_output(y).unwrap();

    let compiled = compile_default(graph).unwrap();
    let plan = compiled.memory_plan();
    assert_eq!(plan.tensor(bias).unwrap().region, Region::Constant);
    assert_eq!(plan.tensor(x).unwrap().region, Region::Boundary);
    assert_eq!(plan.arena_size(), 0);
}

#[test]
fn test_replan_scales_batch_splittable_tensors() {
    let (graph, _) = make_relu_chain(2, &[1, 8]);
    let mut compiled = compile_default(graph).unwrap();
    assert!(compiled.graph().supports_dynamic_batch());
    assert_eq!(compiled.memory_plan().arena_size(), 64);

    let plan = compiled.replan_for_batch(4).unwrap();
    assert_eq!(plan.arena_size(), 128);
    assert_eq!(compiled.graph().memory_plan(), Some(compiled.memory_plan()));

    assert!(matches!(compiled.replan_for_batch(0), Err(Error::Model(_))));
}

#[test]
fn test_whole_batch_stage_blocks_replan() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", DataType::F32, vec![2, 3]);
    let (_, y) = unary(
        &mut graph,
        "permute",
        Op::Permute(Permute { perm: vec![1, 0] }),
        x,
        &[3, 2],
    );
    graph.mark_output(y).unwrap();

    let mut compiled = compile_default(graph).unwrap();
    assert!(!compiled.graph().supports_dynamic_batch());
    assert!(matches!(compiled.replan_for_batch(8), Err(Error::Model(_))));
}
