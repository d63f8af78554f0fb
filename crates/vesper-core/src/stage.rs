//! The contract every operator variant implements for the lowering passes.

use std::fmt;

use crate::ir::{Graph, Port, StageId, StageNode, TempBuffer, TensorDesc, TensorId};
use crate::layout::{BatchSupport, MemoryOrder, StrideRequirement};
use crate::ops::OpKind;
use crate::serialize::{BlobSerializer, DataSink};
use crate::types::TensorValue;
use crate::{Error, Result};

/// Allowed number of edges on one side of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Exact(usize),
    /// Inclusive range.
    Range(usize, usize),
    AtLeast(usize),
}

impl Count {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Count::Exact(expected) => n == expected,
            Count::Range(min, max) => (min..=max).contains(&n),
            Count::AtLeast(min) => n >= min,
        }
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Exact(n) => write!(f, "{n}"),
            Count::Range(min, max) => write!(f, "{min}..={max}"),
            Count::AtLeast(min) => write!(f, "at least {min}"),
        }
    }
}

/// Declared edge counts of an operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub inputs: Count,
    pub outputs: Count,
}

impl Arity {
    pub const fn exact(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs: Count::Exact(inputs),
            outputs: Count::Exact(outputs),
        }
    }

    pub fn accepts(&self, inputs: usize, outputs: usize) -> bool {
        self.inputs.accepts(inputs) && self.outputs.accepts(outputs)
    }
}

/// A memory order a stage wants on one of its ports.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub port: Port,
    pub order: MemoryOrder,
}

/// Read-only view of one stage and its neighborhood, handed to the
/// [`StageOp`] hooks.
pub struct StageCtx<'a> {
    pub graph: &'a Graph,
    pub stage: StageId,
    pub node: &'a StageNode,
    pub pass: &'a str,
}

impl<'a> StageCtx<'a> {
    pub fn new(graph: &'a Graph, stage: StageId, pass: &'a str) -> Result<Self> {
        let node = graph.stage(stage)?;
        Ok(Self {
            graph,
            stage,
            node,
            pass,
        })
    }

    pub fn kind(&self) -> OpKind {
        self.node.kind()
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs().len()
    }

    pub fn output_count(&self) -> usize {
        self.node.outputs().len()
    }

    pub fn input_id(&self, index: usize) -> Result<TensorId> {
        self.node.inputs().get(index).copied().ok_or_else(|| {
            self.internal(format!(
                "input {index} requested but the stage has {}",
                self.input_count()
            ))
        })
    }

    pub fn output_id(&self, index: usize) -> Result<TensorId> {
        self.node.outputs().get(index).copied().ok_or_else(|| {
            self.internal(format!(
                "output {index} requested but the stage has {}",
                self.output_count()
            ))
        })
    }

    pub fn input(&self, index: usize) -> Result<&'a TensorDesc> {
        self.graph.tensor(self.input_id(index)?)
    }

    pub fn output(&self, index: usize) -> Result<&'a TensorDesc> {
        self.graph.tensor(self.output_id(index)?)
    }

    pub fn input_scale(&self, index: usize) -> Result<f32> {
        Ok(self.input(index)?.scale)
    }

    pub fn input_order(&self, index: usize) -> Result<Option<&'a MemoryOrder>> {
        Ok(self.input(index)?.order.as_ref())
    }

    /// Compile-time value of an input, if it has one.
    pub fn input_value(&self, index: usize) -> Result<Option<TensorValue>> {
        self.input(index)?.constant_value()
    }

    /// Whether an input carries immutable content.
    pub fn input_is_constant(&self, index: usize) -> Result<bool> {
        Ok(self.input(index)?.is_constant())
    }

    /// An internal error attributed to this stage and pass.
    pub fn internal(&self, message: impl Into<String>) -> Error {
        Error::internal(self.stage, self.kind(), self.pass, message)
    }

    /// A model error attributed to this stage and pass.
    pub fn model(&self, message: impl Into<String>) -> Error {
        Error::model(self.stage, self.kind(), self.pass, message)
    }
}

/// The per-operator pass contract.
///
/// Every hook has a conservative default; variants override what their
/// semantics require. Hooks run only after the stage's arity was checked.
pub trait StageOp {
    /// Allowed edge counts.
    fn arity(&self) -> Arity;

    /// Output scales given the current input scales.
    ///
    /// Defaults to 1.0 on every output, meaning the op's range is not affine
    /// in its input scale and a requantize step is needed downstream.
    fn propagate_scale(&self, ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
        Ok(vec![1.0; ctx.output_count()])
    }

    /// Orders this stage wants on its ports given current neighbor orders.
    ///
    /// Requests on outputs declare what the stage produces; requests on
    /// inputs declare what it needs to read. Defaults to preserving the
    /// order of input 0 on every output.
    fn propagate_order(&self, ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
        preserve_input_order(ctx)
    }

    /// Stride requirements; unlisted ports accept any stride.
    fn required_strides(&self, _ctx: &StageCtx<'_>) -> Result<Vec<(Port, StrideRequirement)>> {
        Ok(Vec::new())
    }

    /// Batch classification; unlisted ports need the whole batch.
    fn batch_support(&self, _ctx: &StageCtx<'_>) -> Result<Vec<(Port, BatchSupport)>> {
        Ok(Vec::new())
    }

    /// Called once layouts are locked; returns the scratch buffers needed.
    fn finalize_layout(&self, _ctx: &StageCtx<'_>) -> Result<Vec<TempBuffer>> {
        Ok(Vec::new())
    }

    /// Validate attribute combinations against the finalized layout.
    fn final_check(&self, _ctx: &StageCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Emit operator parameters in backend order.
    fn serialize_params(&self, _ctx: &StageCtx<'_>, _out: &mut BlobSerializer) -> Result<()> {
        Ok(())
    }

    /// Emit the bound tensors in backend order. Defaults to inputs, outputs,
    /// then scratch buffers.
    fn serialize_data(&self, ctx: &StageCtx<'_>, sink: &mut DataSink) -> Result<()> {
        bind_all(ctx, sink);
        Ok(())
    }
}

// ── Helpers shared by the operator implementations ──

/// Every output takes input 0's order, or the identity order of its own rank
/// when the ranks differ. No request while input 0's order is unknown.
pub fn preserve_input_order(ctx: &StageCtx<'_>) -> Result<Vec<OrderRequest>> {
    if ctx.input_count() == 0 {
        return Ok(Vec::new());
    }
    let Some(order) = ctx.input_order(0)? else {
        return Ok(Vec::new());
    };

    let mut requests = Vec::with_capacity(ctx.output_count());
    for i in 0..ctx.output_count() {
        let rank = ctx.output(i)?.rank();
        let order = if order.rank() == rank {
            order.clone()
        } else {
            MemoryOrder::identity(rank)
        };
        requests.push(OrderRequest {
            port: Port::Output(i),
            order,
        });
    }
    Ok(requests)
}

/// Ask inputs `from..` to share input 0's order when their ranks match.
pub fn match_input_orders(ctx: &StageCtx<'_>, from: usize) -> Result<Vec<OrderRequest>> {
    let Some(order) = ctx.input_order(0)? else {
        return Ok(Vec::new());
    };
    let mut requests = Vec::new();
    for i in from..ctx.input_count() {
        if ctx.input(i)?.rank() == order.rank() {
            requests.push(OrderRequest {
                port: Port::Input(i),
                order: order.clone(),
            });
        }
    }
    Ok(requests)
}

/// Scale of input 0 on every output.
pub fn preserve_input_scale(ctx: &StageCtx<'_>) -> Result<Vec<f32>> {
    let scale = ctx.input_scale(0)?;
    Ok(vec![scale; ctx.output_count()])
}

/// The same requirement on every port.
pub fn all_ports<T: Copy>(ctx: &StageCtx<'_>, value: T) -> Vec<(Port, T)> {
    (0..ctx.input_count())
        .map(Port::Input)
        .chain((0..ctx.output_count()).map(Port::Output))
        .map(|port| (port, value))
        .collect()
}

/// Bind inputs, outputs, then scratch buffers.
pub fn bind_all(ctx: &StageCtx<'_>, sink: &mut DataSink) {
    for &input in ctx.node.inputs() {
        sink.tensor(input);
    }
    for &output in ctx.node.outputs() {
        sink.tensor(output);
    }
    for index in 0..ctx.node.temps().len() {
        sink.temp(index);
    }
}
