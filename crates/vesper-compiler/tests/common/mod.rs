//! Common test utilities for compiler integration tests.
//!
//! Graph builders shared by the pipeline, layout, memory and emission tests.

#![allow(dead_code)]

use vesper_core::ops::{Activation, BinaryOp};
use vesper_core::{DataType, Graph, Op, StageId, TensorDesc, TensorId};

// Re-export types commonly used in tests
pub use vesper_compiler::{compile, CompileOptions, CompiledGraph, CompilerPipeline};
pub use vesper_core::{Error, FoldRegistry, Region};

/// Install a test subscriber once; output shows up under `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Add an intermediate f32 tensor.
pub fn activation(graph: &mut Graph, name: &str, shape: &[usize]) -> TensorId {
    graph.add_tensor(TensorDesc::new(name, DataType::F32, shape.to_vec()))
}

/// Add `op(input) -> new tensor` and return both.
pub fn unary(
    graph: &mut Graph,
    name: &str,
    op: Op,
    input: TensorId,
    shape: &[usize],
) -> (StageId, TensorId) {
    let output = activation(graph, &format!("{name}_out"), shape);
    let stage = graph
        .add_stage(name, op, vec![input], vec![output])
        .expect("valid stage");
    (stage, output)
}

/// Add `op(a, b) -> new tensor` and return both.
pub fn binary(
    graph: &mut Graph,
    name: &str,
    op: BinaryOp,
    a: TensorId,
    b: TensorId,
    shape: &[usize],
) -> (StageId, TensorId) {
    let output = activation(graph, &format!("{name}_out"), shape);
    let stage = graph
        .add_stage(name, Op::Binary(op), vec![a, b], vec![output])
        .expect("valid stage");
    (stage, output)
}

/// Create a chain of `len` relu stages over an input of `shape`.
///
/// Graph structure:
/// - Input: x
/// - Operations: relu_0(x) -> relu_0_out, ..., relu_{len-1}(..) -> out
/// - Output: the last tensor
pub fn make_relu_chain(len: usize, shape: &[usize]) -> (Graph, Vec<StageId>) {
    let mut graph = Graph::new();
    let mut current = graph.add_input("x", DataType::F32, shape.to_vec());
    let mut stages = Vec::with_capacity(len);
    for i in 0..len {
        let (stage, output) = unary(
            &mut graph,
            &format!("relu_{i}"),
            Op::Activation(Activation::Relu),
            current,
            shape,
        );
        stages.push(stage);
        current = output;
    }
    graph.mark_output(current).expect("tensor exists");
    (graph, stages)
}

/// Diamond `x -> {left, right} -> add -> y`, built consumer-first so the
/// schedule cannot follow insertion order.
pub fn make_diamond(shape: &[usize]) -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_input("x", DataType::F32, shape.to_vec());
    let left = activation(&mut graph, "left", shape);
    let right = activation(&mut graph, "right", shape);
    let y = activation(&mut graph, "y", shape);

    graph
        .add_stage("add", Op::Binary(BinaryOp::Add), vec![left, right], vec![y])
        .expect("valid stage");
    graph
        .add_stage("sigmoid", Op::Activation(Activation::Sigmoid), vec![x], vec![right])
        .expect("valid stage");
    graph
        .add_stage("relu", Op::Activation(Activation::Relu), vec![x], vec![left])
        .expect("valid stage");
    graph.mark_output(y).expect("tensor exists");
    graph
}

/// Position of `stage` in `schedule`.
pub fn position(schedule: &[StageId], stage: StageId) -> usize {
    schedule
        .iter()
        .position(|&s| s == stage)
        .expect("stage is scheduled")
}

/// Compile with default options and an empty registry.
pub fn compile_default(graph: Graph) -> Result<CompiledGraph, Error> {
    compile(graph, &FoldRegistry::new(), CompileOptions::default())
}
