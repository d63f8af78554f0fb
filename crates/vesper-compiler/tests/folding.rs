//! Constant folding with the built-in evaluators.

mod common;

use common::*;
use vesper_core::ops::{BinaryOp, Reshape};
use vesper_core::{DataType, Graph, Op, TensorContent, TensorValue};
use vesper_operators::fold_registry;

#[test]
fn test_constant_product_is_folded() {
    init_tracing();
    let mut graph = Graph::new();
    let a = graph.add_constant_tensor("a", TensorValue::from_f32(vec![2.0]));
    let b = graph.add_constant_tensor("b", TensorValue::from_f32(vec![3.0]));
    let (_, y) = binary(&mut graph, "mul", BinaryOp::Mul, a, b, &[1]);
    graph.mark_output(y).unwrap();

    let compiled = compile(graph, fold_registry(), CompileOptions::default()).unwrap();
    let graph = compiled.graph();
    assert_eq!(graph.stage_count(), 0);
    assert!(compiled.schedule().is_empty());

    // Folding replaces the output by a new constant tensor.
    let folded = graph.outputs()[0];
    assert_ne!(folded, y);
    match &graph.tensor(folded).unwrap().content {
        TensorContent::Constant(value) => assert_eq!(value.as_f32(), Some(&[6.0][..])),
        other => panic!("expected a folded constant, got {other:?}"),
    }
    // The operands lost their only consumer.
    assert!(graph.tensor(a).is_err());
    assert!(graph.tensor(b).is_err());
}

#[test]
fn test_folding_runs_to_a_fixed_point_in_one_pass() {
    let mut graph = Graph::new();
    let x = graph.add_input("x", DataType::F32, vec![2, 3]);
    let a = graph.add_constant_tensor("a", TensorValue::from_f32(vec![1.0, 2.0, 3.0]));
    let b = graph.add_constant_tensor("b", TensorValue::from_f32(vec![4.0, 5.0, 6.0]));
    let (_, sum) = binary(&mut graph, "sum", BinaryOp::Add, a, b, &[3]);
    let (_, reshaped) = unary(
        &mut graph,
        "row",
        Op::Reshape(Reshape { shape: vec![1, 3] }),
        sum,
        &[1, 3],
    );
    let (mul, y) = binary(&mut graph, "scale", BinaryOp::Mul, x, reshaped, &[2, 3]);
    graph.mark_output(y).unwrap();

    let compiled = compile(graph, fold_registry(), CompileOptions::default()).unwrap();
    assert_eq!(compiled.schedule(), &[mul]);

    let graph = compiled.graph();
    let row = graph.stage(mul).unwrap().inputs()[1];
    let folded = graph.tensor(row).unwrap();
    assert_eq!(folded.shape, vec![1, 3]);
    match &folded.content {
        TensorContent::Constant(value) => {
            assert_eq!(value.as_f32(), Some(&[5.0, 7.0, 9.0][..]))
        }
        other => panic!("expected a folded constant, got {other:?}"),
    }
    assert_eq!(compiled.memory_plan().tensor(row).unwrap().region, Region::Constant);
}

#[test]
fn test_failing_evaluator_leaves_stage_for_runtime() {
    let mut graph = Graph::new();
    let a = graph.add_constant_tensor("a", TensorValue::from_i64(vec![4]));
    let b = graph.add_constant_tensor("b", TensorValue::from_i64(vec![0]));
    let y = graph.add_tensor(vesper_core::TensorDesc::new("y", DataType::I64, vec![1]));
    let div = graph
        .add_stage("div", Op::Binary(BinaryOp::Div), vec![a, b], vec![y])
        .unwrap();
    graph.mark_output(y).unwrap();

    let compiled = compile(graph, fold_registry(), CompileOptions::default()).unwrap();
    assert_eq!(compiled.schedule(), &[div]);
}

#[test]
fn test_disabled_folding_keeps_stages() {
    let mut graph = Graph::new();
    let a = graph.add_constant_tensor("a", TensorValue::from_f32(vec![2.0]));
    let b = graph.add_constant_tensor("b", TensorValue::from_f32(vec![3.0]));
    let (mul, y) = binary(&mut graph, "mul", BinaryOp::Mul, a, b, &[1]);
    graph.mark_output(y).unwrap();

    let options = CompileOptions {
        fold_constants: false,
        ..CompileOptions::default()
    };
    let compiled = compile(graph, fold_registry(), options).unwrap();
    assert_eq!(compiled.schedule(), &[mul]);
}
