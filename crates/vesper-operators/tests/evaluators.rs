//! Chains of foldable stages compiled with the shared registry.

mod common;

use common::*;
use vesper_core::ops::{
    Activation, BinaryOp, Concat, Fill, Gather, InPlace, Power, Range, Reshape, Slice, Split,
    Tile,
};
use vesper_core::{DataType, Graph, Op, TensorContent, TensorData, TensorDesc, TensorValue};

fn i64_scalar(graph: &mut Graph, name: &str, value: i64) -> vesper_core::TensorId {
    graph.add_constant_tensor(name, TensorValue::scalar(TensorData::I64(vec![value]), DataType::I64))
}

#[test]
fn test_range_reshape_gather_concat() {
    let mut graph = Graph::new();
    let start = i64_scalar(&mut graph, "start", 0);
    let limit = i64_scalar(&mut graph, "limit", 6);
    let delta = i64_scalar(&mut graph, "delta", 1);
    let indices = graph.add_constant_tensor("indices", TensorValue::from_i64(vec![2, 0]));

    let range = add_stage(
        &mut graph,
        "range",
        Op::Range(Range),
        vec![start, limit, delta],
        DataType::I64,
        &[6],
    );
    let matrix = add_stage(
        &mut graph,
        "reshape",
        Op::Reshape(Reshape { shape: vec![2, 3] }),
        vec![range],
        DataType::I64,
        &[2, 3],
    );
    let picked = add_stage(
        &mut graph,
        "gather",
        Op::Gather(Gather { axis: 1 }),
        vec![matrix, indices],
        DataType::I64,
        &[2, 2],
    );
    let stacked = add_stage(
        &mut graph,
        "concat",
        Op::Concat(Concat { axis: 0 }),
        vec![picked, picked],
        DataType::I64,
        &[4, 2],
    );

    let value = fold_to_constant(graph, stacked);
    assert_eq!(value.shape, vec![4, 2]);
    assert_eq!(value.as_i64(), Some(&[2, 0, 5, 3, 2, 0, 5, 3][..]));
}

#[test]
fn test_fill_broadcast_multiply() {
    let mut graph = Graph::new();
    let dims = graph.add_constant_tensor("dims", TensorValue::from_i64(vec![2, 2]));
    let one_and_half = graph.add_constant_tensor("v", TensorValue::from_f32(vec![1.5]));
    let two = graph.add_constant_tensor("two", TensorValue::from_f32(vec![2.0]));

    let filled = add_stage(
        &mut graph,
        "fill",
        Op::Fill(Fill),
        vec![dims, one_and_half],
        DataType::F32,
        &[2, 2],
    );
    let doubled = add_stage(
        &mut graph,
        "mul",
        Op::Binary(BinaryOp::Mul),
        vec![filled, two],
        DataType::F32,
        &[2, 2],
    );

    let value = fold_to_constant(graph, doubled);
    assert_eq!(value.as_f32(), Some(&[3.0; 4][..]));
}

#[test]
fn test_power_then_relu() {
    let mut graph = Graph::new();
    let x = graph.add_constant_tensor("x", TensorValue::from_f32(vec![1.0, 3.0]));
    let shifted = add_stage(
        &mut graph,
        "power",
        Op::Power(Power {
            scale: 1.0,
            shift: -2.0,
            power: 1.0,
        }),
        vec![x],
        DataType::F32,
        &[2],
    );
    let rectified = add_stage(
        &mut graph,
        "relu",
        Op::Activation(Activation::Relu),
        vec![shifted],
        DataType::F32,
        &[2],
    );

    let value = fold_to_constant(graph, rectified);
    assert_eq!(value.as_f32(), Some(&[0.0, 1.0][..]));
}

#[test]
fn test_unsqueeze_slice_tile() {
    let mut graph = Graph::new();
    let x = graph.add_constant_tensor("x", TensorValue::from_f32(vec![1.0, 2.0, 3.0, 4.0]));
    let row = add_stage(
        &mut graph,
        "unsqueeze",
        Op::InPlace(InPlace::Unsqueeze { axes: vec![0] }),
        vec![x],
        DataType::F32,
        &[1, 4],
    );
    let middle = add_stage(
        &mut graph,
        "slice",
        Op::Slice(Slice {
            starts: vec![1],
            ends: vec![3],
            axes: vec![1],
        }),
        vec![row],
        DataType::F32,
        &[1, 2],
    );
    let tiled = add_stage(
        &mut graph,
        "tile",
        Op::Tile(Tile { axis: 0, tiles: 3 }),
        vec![middle],
        DataType::F32,
        &[3, 2],
    );

    let value = fold_to_constant(graph, tiled);
    assert_eq!(value.as_f32(), Some(&[2.0, 3.0, 2.0, 3.0, 2.0, 3.0][..]));
}

#[test]
fn test_split_folds_every_output() {
    init_tracing();
    let mut graph = Graph::new();
    let x = graph.add_constant_tensor("x", TensorValue::from_i64(vec![1, 2, 3, 4, 5]));
    let head = graph.add_tensor(TensorDesc::new("head", DataType::I64, vec![2]));
    let tail = graph.add_tensor(TensorDesc::new("tail", DataType::I64, vec![3]));
    graph
        .add_stage(
            "split",
            Op::Split(Split {
                axis: 0,
                sizes: vec![2, 3],
            }),
            vec![x],
            vec![head, tail],
        )
        .unwrap();
    graph.mark_output(head).unwrap();
    graph.mark_output(tail).unwrap();

    let compiled = compile(graph, fold_registry(), CompileOptions::default()).unwrap();
    assert!(compiled.schedule().is_empty());
    let value = |id| match &compiled.graph().tensor(id).unwrap().content {
        TensorContent::Constant(value) => value.as_i64().map(<[i64]>::to_vec),
        _ => None,
    };
    let outputs = compiled.graph().outputs();
    assert_eq!(value(outputs[0]), Some(vec![1, 2]));
    assert_eq!(value(outputs[1]), Some(vec![3, 4, 5]));
}

#[test]
fn test_declared_shape_disagreement_is_internal() {
    let mut graph = Graph::new();
    let a = graph.add_constant_tensor("a", TensorValue::from_f32(vec![1.0, 2.0]));
    let b = graph.add_constant_tensor("b", TensorValue::from_f32(vec![1.0, 2.0]));
    let y = add_stage(
        &mut graph,
        "add",
        Op::Binary(BinaryOp::Add),
        vec![a, b],
        DataType::F32,
        &[3],
    );
    graph.mark_output(y).unwrap();

    let err = compile(graph, fold_registry(), CompileOptions::default()).unwrap_err();
    assert!(err.is_internal());
}
