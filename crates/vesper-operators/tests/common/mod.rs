//! Common test utilities for evaluator tests.
//!
//! Graphs are compiled with the shared registry and the folded value of the
//! output is read back.

#![allow(dead_code)]

use vesper_core::{DataType, Graph, Op, TensorContent, TensorDesc, TensorId, TensorValue};

// Re-export types commonly used in tests
pub use vesper_compiler::{compile, CompileOptions};
pub use vesper_operators::fold_registry;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Add `op(inputs) -> out` where `out` has the given dtype and shape.
pub fn add_stage(
    graph: &mut Graph,
    name: &str,
    op: Op,
    inputs: Vec<TensorId>,
    dtype: DataType,
    shape: &[usize],
) -> TensorId {
    let output = graph.add_tensor(TensorDesc::new(format!("{name}_out"), dtype, shape.to_vec()));
    graph
        .add_stage(name, op, inputs, vec![output])
        .expect("valid stage");
    output
}

/// Mark `output`, compile with folding, and return its folded value.
///
/// Panics if anything is left for runtime.
pub fn fold_to_constant(mut graph: Graph, output: TensorId) -> TensorValue {
    init_tracing();
    graph.mark_output(output).expect("tensor exists");
    let compiled =
        compile(graph, fold_registry(), CompileOptions::default()).expect("compiles");
    assert!(
        compiled.schedule().is_empty(),
        "stages left for runtime: {:?}",
        compiled.schedule()
    );
    // Folding replaces the output by a new constant tensor.
    let folded = compiled.graph().outputs()[0];
    match &compiled.graph().tensor(folded).expect("output kept").content {
        TensorContent::Constant(value) => value.clone(),
        other => panic!("output was not folded: {other:?}"),
    }
}
