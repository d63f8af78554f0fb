//! Intermediate representation for the lowering pipeline.
//!
//! The IR is an arena of stages (operator instances) and tensor descriptors
//! addressed by stable integer ids:
//! - **Stages** (`StageNode`) live in a `StableGraph`, so a `StageId` stays
//!   valid after other stages are removed.
//! - **Tensors** (`TensorDesc`) live in an index-addressed side table.
//! - **Edges** (`Edge`) bind one stage port to one tensor and are indexed by
//!   the producer/consumer lookup tables.
//!
//! Every structural edit validates completely before it mutates anything, so
//! a failed edit leaves the graph exactly as it was.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;

use crate::edit::{GraphEdit, PendingEdits};
use crate::layout::{BatchSupport, MemoryOrder, StrideRequirement};
use crate::ops::{Op, OpKind, Passthrough};
use crate::pass::Phase;
use crate::plan::MemoryPlan;
use crate::stage::StageOp;
use crate::types::{DataType, TensorValue};
use crate::{Error, Result};

/// Stage identifiers (backed by petgraph's stable `NodeIndex`).
pub type StageId = NodeIndex;

/// Unique identifier for a tensor descriptor.
///
/// An index into the graph's tensor table. Ids are never reused, so an id of
/// a removed tensor simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl TensorId {
    /// Create a new tensor ID.
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Identifier of a stateful feedback buffer shared by a `MemoryRead` and a
/// `MemoryWrite` stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

// ─────────────────────────────── TensorDesc ──────────────────────────────

/// What compile-time data a tensor carries.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorContent {
    /// No compile-time data; the value is produced at runtime.
    Runtime,

    /// Raw little-endian weight bytes, parsed on demand.
    Initializer(Vec<u8>),

    /// Fully evaluated compile-time value.
    Constant(TensorValue),
}

/// Payload of one graph edge: shape, element type, layout and content.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub content: TensorContent,

    /// Physical axis order. `None` until a stage or the finalize pass picks one.
    pub order: Option<MemoryOrder>,

    /// The order was fixed outside the compiler (e.g. a boundary tensor with
    /// a layout dictated by the caller) and may not be changed.
    pub order_fixed: bool,

    pub strides: StrideRequirement,

    /// Multiplicative quantization scale.
    pub scale: f32,

    pub batch_splittable: bool,

    /// Feedback state held by this tensor. Maintained by the graph: set on
    /// the output of a `MemoryRead`.
    pub persistent: Option<StateId>,

    /// Layout is locked; propagation may no longer touch it.
    pub finalized: bool,
}

impl TensorDesc {
    /// Create a runtime tensor with no layout decided yet.
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            content: TensorContent::Runtime,
            order: None,
            order_fixed: false,
            strides: StrideRequirement::Any,
            scale: 1.0,
            batch_splittable: false,
            persistent: None,
            finalized: false,
        }
    }

    /// Pin the memory order of this tensor.
    pub fn with_order(mut self, order: MemoryOrder) -> Self {
        self.order = Some(order);
        self.order_fixed = true;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Whether the tensor carries immutable compile-time content.
    pub fn is_constant(&self) -> bool {
        !matches!(self.content, TensorContent::Runtime)
    }

    /// The compile-time value of this tensor, parsing initializer bytes if
    /// needed. `None` for runtime tensors.
    pub fn constant_value(&self) -> Result<Option<TensorValue>> {
        match &self.content {
            TensorContent::Runtime => Ok(None),
            TensorContent::Constant(value) => Ok(Some(value.clone())),
            TensorContent::Initializer(bytes) => {
                TensorValue::from_bytes(bytes, self.dtype, &self.shape).map(Some)
            }
        }
    }
}

// ───────────────────────────────── Edges ─────────────────────────────────

/// Positional argument slot on the stage side of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Input(usize),
    Output(usize),
}

impl Port {
    pub fn index(self) -> usize {
        match self {
            Port::Input(i) | Port::Output(i) => i,
        }
    }
}

/// A single-slot binding between a stage and a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub stage: StageId,
    pub tensor: TensorId,
    pub port: Port,
}

/// Scratch storage scoped to one execution of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TempBuffer {
    pub name: String,
    pub bytes: usize,
}

// ─────────────────────────────── StageNode ───────────────────────────────

/// One operator instance in the graph.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub name: String,
    op: Op,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    temps: Vec<TempBuffer>,
    input_batch: Vec<BatchSupport>,
    output_batch: Vec<BatchSupport>,
    finalized: bool,
    seq: u64,
}

impl StageNode {
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Mutable access to the operator payload. Fails once the stage is
    /// finalized.
    pub fn op_mut(&mut self) -> Result<&mut Op> {
        if self.finalized {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' is finalized; its attributes are immutable",
                self.name
            )));
        }
        Ok(&mut self.op)
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn temps(&self) -> &[TempBuffer] {
        &self.temps
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Insertion sequence number, used to break scheduling ties.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Batch classification of one port. Unclassified ports report `Whole`.
    pub fn batch_support(&self, port: Port) -> BatchSupport {
        let table = match port {
            Port::Input(_) => &self.input_batch,
            Port::Output(_) => &self.output_batch,
        };
        table.get(port.index()).copied().unwrap_or_default()
    }

    /// Record the batch classification of every port.
    pub fn set_batch_support(
        &mut self,
        inputs: Vec<BatchSupport>,
        outputs: Vec<BatchSupport>,
    ) -> Result<()> {
        if self.finalized {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' is finalized; batch support is locked",
                self.name
            )));
        }
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' has {} inputs and {} outputs, got batch support for {} and {}",
                self.name,
                self.inputs.len(),
                self.outputs.len(),
                inputs.len(),
                outputs.len()
            )));
        }
        self.input_batch = inputs;
        self.output_batch = outputs;
        Ok(())
    }

    /// Lock the stage, recording its scratch buffers.
    pub fn finalize(&mut self, temps: Vec<TempBuffer>) {
        self.temps = temps;
        self.finalized = true;
    }

    /// Check edge counts against the operator's declared arity.
    ///
    /// A mismatch is a front-end bug and reported as an internal error.
    pub fn check_arity(&self, id: StageId, pass: &str) -> Result<()> {
        let arity = self.op.arity();
        if arity.accepts(self.inputs.len(), self.outputs.len()) {
            return Ok(());
        }
        Err(Error::internal(
            id,
            self.kind(),
            pass,
            format!(
                "expected {} inputs and {} outputs, found {} and {}",
                arity.inputs,
                arity.outputs,
                self.inputs.len(),
                self.outputs.len()
            ),
        ))
    }
}

// ───────────────────────────────── Graph ─────────────────────────────────

/// The model: exclusive owner of every stage and tensor descriptor.
#[derive(Debug)]
pub struct Graph {
    stages: StableGraph<StageNode, ()>,
    tensors: Vec<Option<TensorDesc>>,
    producers: HashMap<TensorId, Edge>,
    consumers: HashMap<TensorId, Vec<Edge>>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,

    /// Live stages in insertion order, replaced by the schedule.
    order: Vec<StageId>,
    scheduled: bool,
    next_seq: u64,
    phase: Phase,
    memory_plan: Option<MemoryPlan>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            stages: StableGraph::new(),
            tensors: Vec::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            order: Vec::new(),
            scheduled: false,
            next_seq: 0,
            phase: Phase::Raw,
            memory_plan: None,
        }
    }

    // ── Phase ──

    /// The latest compile phase this graph has completed.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    // ── Tensor access ──

    pub fn tensor(&self, id: TensorId) -> Result<&TensorDesc> {
        self.tensors
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::InvalidGraph(format!("Tensor {id} not found")))
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> Result<&mut TensorDesc> {
        self.tensors
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::InvalidGraph(format!("Tensor {id} not found")))
    }

    /// Iterate over live tensors in id order.
    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &TensorDesc)> {
        self.tensors
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|desc| (TensorId::new(i), desc)))
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.iter().filter(|slot| slot.is_some()).count()
    }

    /// The producer edge of a tensor, if any.
    pub fn producer(&self, id: TensorId) -> Option<&Edge> {
        self.producers.get(&id)
    }

    /// The consumer edges of a tensor.
    pub fn consumers(&self, id: TensorId) -> &[Edge] {
        self.consumers.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn is_graph_output(&self, id: TensorId) -> bool {
        self.outputs.contains(&id)
    }

    /// Graph inputs and outputs.
    pub fn is_boundary(&self, id: TensorId) -> bool {
        self.inputs.contains(&id) || self.outputs.contains(&id)
    }

    // ── Stage access ──

    pub fn stage(&self, id: StageId) -> Result<&StageNode> {
        self.stages
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Stage #{} not found", id.index())))
    }

    pub fn stage_mut(&mut self, id: StageId) -> Result<&mut StageNode> {
        self.stages
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Stage #{} not found", id.index())))
    }

    pub fn contains_stage(&self, id: StageId) -> bool {
        self.stages.contains_node(id)
    }

    /// Live stages in insertion order, or in schedule order once scheduled.
    pub fn stages(&self) -> &[StageId] {
        &self.order
    }

    pub fn stage_count(&self) -> usize {
        self.stages.node_count()
    }

    /// Find a stage by name.
    pub fn find_stage(&self, name: &str) -> Option<StageId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.stages[id].name == name)
    }

    /// Every edge, grouped by stage in iteration order (inputs first).
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for &id in &self.order {
            let node = &self.stages[id];
            for (i, &tensor) in node.inputs.iter().enumerate() {
                edges.push(Edge {
                    stage: id,
                    tensor,
                    port: Port::Input(i),
                });
            }
            for (i, &tensor) in node.outputs.iter().enumerate() {
                edges.push(Edge {
                    stage: id,
                    tensor,
                    port: Port::Output(i),
                });
            }
        }
        edges
    }

    // ── Tensor creation ──

    /// Add a tensor descriptor and return its ID.
    pub fn add_tensor(&mut self, desc: TensorDesc) -> TensorId {
        let id = TensorId::new(self.tensors.len());
        self.tensors.push(Some(desc));
        id
    }

    /// Add a runtime graph input.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        dtype: DataType,
        shape: Vec<usize>,
    ) -> TensorId {
        let id = self.add_tensor(TensorDesc::new(name, dtype, shape));
        self.inputs.push(id);
        id
    }

    /// Add a tensor with known compile-time content.
    pub fn add_constant_tensor(&mut self, name: impl Into<String>, value: TensorValue) -> TensorId {
        let mut desc = TensorDesc::new(name, value.dtype, value.shape.clone());
        desc.content = TensorContent::Constant(value);
        self.add_tensor(desc)
    }

    /// Add an external weight given as raw little-endian bytes.
    pub fn add_initializer(
        &mut self,
        name: impl Into<String>,
        dtype: DataType,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    ) -> Result<TensorId> {
        let mut desc = TensorDesc::new(name, dtype, shape);
        if bytes.len() != desc.size_in_bytes() {
            return Err(Error::InvalidGraph(format!(
                "Initializer '{}' has {} bytes, expected {}",
                desc.name,
                bytes.len(),
                desc.size_in_bytes()
            )));
        }
        desc.content = TensorContent::Initializer(bytes);
        Ok(self.add_tensor(desc))
    }

    /// Mark a tensor as a graph output.
    pub fn mark_output(&mut self, id: TensorId) -> Result<()> {
        self.tensor(id)?;
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    /// Remove a tensor nothing refers to.
    pub fn remove_tensor(&mut self, id: TensorId) -> Result<()> {
        let desc = self.tensor(id)?;
        if self.producers.contains_key(&id) || !self.consumers(id).is_empty() {
            return Err(Error::InvalidGraph(format!(
                "Tensor '{}' is still bound to a stage",
                desc.name
            )));
        }
        if self.is_boundary(id) {
            return Err(Error::InvalidGraph(format!(
                "Tensor '{}' is a graph boundary tensor",
                desc.name
            )));
        }
        self.tensors[id.index()] = None;
        Ok(())
    }

    // ── Stage edits ──

    /// Add a stage reading `inputs` and writing `outputs`.
    ///
    /// Edge counts are not checked here; arity is a pass precondition.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<StageId> {
        self.validate_stage_edges(&inputs, &outputs)?;
        Ok(self.insert_stage(name.into(), op, inputs, outputs))
    }

    /// Remove a stage together with its output tensors.
    ///
    /// Fails if any output is still consumed or is a graph output; use
    /// [`Graph::fold_stage`] to replace a stage atomically.
    pub fn remove_stage(&mut self, id: StageId) -> Result<()> {
        let node = self.stage(id)?;
        if node.finalized {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' is finalized and cannot be removed",
                node.name
            )));
        }
        for &output in &node.outputs {
            if let Some(edge) = self.consumers(output).first() {
                return Err(Error::InvalidGraph(format!(
                    "Output {output} of stage '{}' is still consumed by stage #{}",
                    node.name,
                    edge.stage.index()
                )));
            }
            if self.is_graph_output(output) {
                return Err(Error::InvalidGraph(format!(
                    "Output {output} of stage '{}' is a graph output",
                    node.name
                )));
            }
        }
        self.detach_stage(id);
        Ok(())
    }

    /// Rewire every consumer of `old` (and the graph outputs) to `new`.
    pub fn replace_tensor(&mut self, old: TensorId, new: TensorId) -> Result<()> {
        if old == new {
            return Err(Error::InvalidGraph(format!(
                "Cannot replace tensor {old} with itself"
            )));
        }
        let old_desc = self.tensor(old)?;
        let new_desc = self.tensor(new)?;
        if old_desc.dtype != new_desc.dtype || old_desc.shape != new_desc.shape {
            return Err(Error::InvalidGraph(format!(
                "Cannot replace '{}' ({:?} {:?}) with '{}' ({:?} {:?})",
                old_desc.name,
                old_desc.dtype,
                old_desc.shape,
                new_desc.name,
                new_desc.dtype,
                new_desc.shape
            )));
        }
        let new_producer = self.producer(new).map(|edge| edge.stage);
        for edge in self.consumers(old) {
            if self.stages[edge.stage].finalized {
                return Err(Error::InvalidGraph(format!(
                    "Consumer stage #{} of {old} is finalized",
                    edge.stage.index()
                )));
            }
            if Some(edge.stage) == new_producer {
                return Err(Error::InvalidGraph(format!(
                    "Stage #{} would read its own output {new}",
                    edge.stage.index()
                )));
            }
        }

        self.move_consumers(old, new);
        Ok(())
    }

    /// Point one input port of a stage at a different tensor.
    pub fn rewire_input(&mut self, stage: StageId, port: usize, tensor: TensorId) -> Result<()> {
        self.tensor(tensor)?;
        let node = self.stage(stage)?;
        if node.finalized {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' is finalized and cannot be rewired",
                node.name
            )));
        }
        if port >= node.inputs.len() {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' has no input port {port}",
                node.name
            )));
        }
        if node.outputs.contains(&tensor) {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' would read its own output {tensor}",
                node.name
            )));
        }
        self.set_input(stage, port, tensor);
        Ok(())
    }

    /// Clone a stage onto the same inputs with fresh output tensors.
    pub fn duplicate_stage(&mut self, id: StageId) -> Result<StageId> {
        let node = self.stage(id)?;
        let name = format!("{}.dup", node.name);
        let op = node.op.clone();
        let inputs = node.inputs.clone();

        let mut outputs_desc = Vec::with_capacity(node.outputs.len());
        for &output in &node.outputs {
            let desc = self.tensor(output)?;
            outputs_desc.push(
                TensorDesc::new(format!("{}.dup", desc.name), desc.dtype, desc.shape.clone())
                    .with_scale(desc.scale),
            );
        }

        let outputs = outputs_desc
            .into_iter()
            .map(|desc| self.add_tensor(desc))
            .collect();
        Ok(self.insert_stage(name, op, inputs, outputs))
    }

    /// Replace a stage by constant tensors holding its precomputed outputs.
    ///
    /// Every consumer of output `i` is rewired to a new constant tensor
    /// carrying `values[i]`; then the stage and its old outputs are removed.
    /// Returns the new constant tensors.
    pub fn fold_stage(&mut self, id: StageId, values: Vec<TensorValue>) -> Result<Vec<TensorId>> {
        let node = self.stage(id)?;
        if node.finalized {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' is finalized and cannot be folded",
                node.name
            )));
        }
        if values.len() != node.outputs.len() {
            return Err(Error::InvalidGraph(format!(
                "Stage '{}' has {} outputs but {} folded values were given",
                node.name,
                node.outputs.len(),
                values.len()
            )));
        }

        let mut replaced = Vec::with_capacity(values.len());
        for (value, &output) in values.iter().zip(&node.outputs) {
            let desc = self.tensor(output)?;
            if value.dtype != desc.dtype || value.shape != desc.shape {
                return Err(Error::InvalidGraph(format!(
                    "Folded value {:?} {:?} does not match '{}' ({:?} {:?})",
                    value.dtype, value.shape, desc.name, desc.dtype, desc.shape
                )));
            }
            for edge in self.consumers(output) {
                if self.stages[edge.stage].finalized {
                    return Err(Error::InvalidGraph(format!(
                        "Consumer stage #{} of {output} is finalized",
                        edge.stage.index()
                    )));
                }
            }
            replaced.push((output, desc.name.clone(), desc.scale));
        }

        let mut constants = Vec::with_capacity(replaced.len());
        for (value, (old, name, scale)) in values.into_iter().zip(replaced) {
            let mut desc = TensorDesc::new(name, value.dtype, value.shape.clone()).with_scale(scale);
            desc.content = TensorContent::Constant(value);
            let new = self.add_tensor(desc);
            self.move_consumers(old, new);
            constants.push(new);
        }
        self.detach_stage(id);
        Ok(constants)
    }

    /// Apply a batch of edits collected during a pass, all or nothing.
    ///
    /// Returns the stages inserted.
    pub fn apply(&mut self, edits: PendingEdits) -> Result<Vec<StageId>> {
        let mut claimed = HashSet::new();
        for edit in edits.iter() {
            match edit {
                GraphEdit::InsertConversion {
                    tensor,
                    order,
                    consumers,
                } => {
                    let desc = self.tensor(*tensor)?;
                    if order.rank() != desc.rank() {
                        return Err(Error::InvalidGraph(format!(
                            "Order {order} does not fit rank-{} tensor '{}'",
                            desc.rank(),
                            desc.name
                        )));
                    }
                    for &(stage, port) in consumers {
                        let node = self.stage(stage)?;
                        if node.finalized {
                            return Err(Error::InvalidGraph(format!(
                                "Stage '{}' is finalized and cannot be rewired",
                                node.name
                            )));
                        }
                        if node.inputs.get(port) != Some(tensor) {
                            return Err(Error::InvalidGraph(format!(
                                "Stage '{}' does not read {tensor} on input {port}",
                                node.name
                            )));
                        }
                        if !claimed.insert((stage, Port::Input(port))) {
                            return Err(Error::InvalidGraph(format!(
                                "Input {port} of stage '{}' is rewired twice",
                                node.name
                            )));
                        }
                    }
                }
                GraphEdit::ConvertOutput {
                    stage,
                    port,
                    tensor,
                    order,
                } => {
                    let desc = self.tensor(*tensor)?;
                    if order.rank() != desc.rank() {
                        return Err(Error::InvalidGraph(format!(
                            "Order {order} does not fit rank-{} tensor '{}'",
                            desc.rank(),
                            desc.name
                        )));
                    }
                    let node = self.stage(*stage)?;
                    if node.finalized {
                        return Err(Error::InvalidGraph(format!(
                            "Stage '{}' is finalized and cannot be rewired",
                            node.name
                        )));
                    }
                    if node.outputs.get(*port) != Some(tensor) {
                        return Err(Error::InvalidGraph(format!(
                            "Stage '{}' does not write {tensor} on output {port}",
                            node.name
                        )));
                    }
                    if !claimed.insert((*stage, Port::Output(*port))) {
                        return Err(Error::InvalidGraph(format!(
                            "Output {port} of stage '{}' is rewired twice",
                            node.name
                        )));
                    }
                }
            }
        }

        let mut inserted = Vec::new();
        for edit in edits.into_edits() {
            match edit {
                GraphEdit::InsertConversion {
                    tensor,
                    order,
                    consumers,
                } => {
                    let Some(Some(source)) = self.tensors.get(tensor.index()) else {
                        continue;
                    };
                    let mut converted = TensorDesc::new(
                        format!("{}@{}", source.name, order),
                        source.dtype,
                        source.shape.clone(),
                    )
                    .with_scale(source.scale);
                    converted.order = Some(order.clone());
                    let stage_name = format!("convert {} to {}", source.name, order);

                    let output = self.add_tensor(converted);
                    let stage = self.insert_stage(
                        stage_name,
                        Op::Copy(Passthrough),
                        vec![tensor],
                        vec![output],
                    );
                    for (consumer, port) in consumers {
                        self.set_input(consumer, port, output);
                    }
                    inserted.push(stage);
                }
                GraphEdit::ConvertOutput {
                    stage,
                    port,
                    tensor,
                    order,
                } => {
                    let Some(Some(target)) = self.tensors.get(tensor.index()) else {
                        continue;
                    };
                    let mut staged = TensorDesc::new(
                        format!("{}@{}", target.name, order),
                        target.dtype,
                        target.shape.clone(),
                    )
                    .with_scale(target.scale);
                    staged.order = Some(order.clone());
                    let stage_name = format!("convert {} from {}", target.name, order);

                    let staged = self.add_tensor(staged);
                    self.set_output(stage, port, staged);
                    let copy = self.insert_stage(
                        stage_name,
                        Op::Copy(Passthrough),
                        vec![staged],
                        vec![tensor],
                    );
                    inserted.push(copy);
                }
            }
        }
        Ok(inserted)
    }

    // ── Schedule and memory plan ──

    /// Replace the iteration order with a schedule covering every live stage.
    pub fn set_schedule(&mut self, schedule: Vec<StageId>) -> Result<()> {
        let mut seen = HashSet::new();
        for &id in &schedule {
            self.stage(id)?;
            if !seen.insert(id) {
                return Err(Error::InvalidGraph(format!(
                    "Stage #{} is scheduled twice",
                    id.index()
                )));
            }
        }
        if seen.len() != self.stage_count() {
            return Err(Error::InvalidGraph(format!(
                "Schedule covers {} of {} stages",
                seen.len(),
                self.stage_count()
            )));
        }
        self.order = schedule;
        self.scheduled = true;
        Ok(())
    }

    /// The execution order, once scheduled.
    pub fn schedule(&self) -> Option<&[StageId]> {
        self.scheduled.then_some(self.order.as_slice())
    }

    pub fn set_memory_plan(&mut self, plan: MemoryPlan) {
        self.memory_plan = Some(plan);
    }

    pub fn memory_plan(&self) -> Option<&MemoryPlan> {
        self.memory_plan.as_ref()
    }

    // ── Queries ──

    /// Whether every runtime edge of every stage may be split along the batch.
    pub fn supports_dynamic_batch(&self) -> bool {
        self.order.iter().all(|&id| {
            let node = &self.stages[id];
            let inputs = node
                .inputs
                .iter()
                .enumerate()
                .map(|(i, &t)| (Port::Input(i), t));
            let outputs = node
                .outputs
                .iter()
                .enumerate()
                .map(|(i, &t)| (Port::Output(i), t));
            inputs.chain(outputs).all(|(port, tensor)| {
                let constant = self.tensor(tensor).map(|d| d.is_constant()).unwrap_or(false);
                constant || node.batch_support(port) == BatchSupport::Split
            })
        })
    }

    /// Check edge referential integrity and single-writer.
    pub fn verify_integrity(&self) -> Result<()> {
        let live: HashSet<StageId> = self.stages.node_indices().collect();
        let ordered: HashSet<StageId> = self.order.iter().copied().collect();
        if live != ordered || ordered.len() != self.order.len() {
            return Err(Error::InvalidGraph(
                "Stage order does not match the live stages".to_string(),
            ));
        }

        for &id in &self.order {
            let node = &self.stages[id];
            for (i, &tensor) in node.inputs.iter().enumerate() {
                self.tensor(tensor)?;
                let expected = Edge {
                    stage: id,
                    tensor,
                    port: Port::Input(i),
                };
                if !self.consumers(tensor).contains(&expected) {
                    return Err(Error::InvalidGraph(format!(
                        "Input {i} of stage '{}' is missing from the consumers of {tensor}",
                        node.name
                    )));
                }
            }
            for (i, &tensor) in node.outputs.iter().enumerate() {
                self.tensor(tensor)?;
                let expected = Edge {
                    stage: id,
                    tensor,
                    port: Port::Output(i),
                };
                if self.producers.get(&tensor) != Some(&expected) {
                    return Err(Error::InvalidGraph(format!(
                        "Output {i} of stage '{}' is not the producer of {tensor}",
                        node.name
                    )));
                }
            }
        }

        for (tensor, edge) in &self.producers {
            let bound = self
                .stages
                .node_weight(edge.stage)
                .and_then(|node| node.outputs.get(edge.port.index()));
            if edge.tensor != *tensor || bound != Some(tensor) {
                return Err(Error::InvalidGraph(format!(
                    "Dangling producer edge for {tensor}"
                )));
            }
        }
        for (tensor, edges) in &self.consumers {
            for edge in edges {
                let bound = self
                    .stages
                    .node_weight(edge.stage)
                    .and_then(|node| node.inputs.get(edge.port.index()));
                if edge.tensor != *tensor || bound != Some(tensor) {
                    return Err(Error::InvalidGraph(format!(
                        "Dangling consumer edge for {tensor}"
                    )));
                }
            }
        }

        for &tensor in self.inputs.iter().chain(&self.outputs) {
            self.tensor(tensor)?;
        }
        Ok(())
    }

    // ── Internal edit helpers (no validation) ──

    fn validate_stage_edges(&self, inputs: &[TensorId], outputs: &[TensorId]) -> Result<()> {
        for &input in inputs {
            self.tensor(input)?;
        }
        for (i, &output) in outputs.iter().enumerate() {
            let desc = self.tensor(output)?;
            if outputs[..i].contains(&output) {
                return Err(Error::InvalidGraph(format!(
                    "Tensor '{}' is bound to two outputs",
                    desc.name
                )));
            }
            if let Some(edge) = self.producers.get(&output) {
                return Err(Error::InvalidGraph(format!(
                    "Tensor '{}' is already produced by stage #{}",
                    desc.name,
                    edge.stage.index()
                )));
            }
            if desc.is_constant() || self.inputs.contains(&output) {
                return Err(Error::InvalidGraph(format!(
                    "Tensor '{}' is a constant or graph input and cannot be written",
                    desc.name
                )));
            }
            if inputs.contains(&output) {
                return Err(Error::InvalidGraph(format!(
                    "Stage would read its own output '{}'",
                    desc.name
                )));
            }
        }
        Ok(())
    }

    fn insert_stage(
        &mut self,
        name: String,
        op: Op,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> StageId {
        let seq = self.next_seq;
        self.next_seq += 1;

        let id = self.stages.add_node(StageNode {
            name,
            op,
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            temps: Vec::new(),
            input_batch: Vec::new(),
            output_batch: Vec::new(),
            finalized: false,
            seq,
        });

        for (i, &tensor) in inputs.iter().enumerate() {
            self.consumers.entry(tensor).or_default().push(Edge {
                stage: id,
                tensor,
                port: Port::Input(i),
            });
        }
        for (i, &tensor) in outputs.iter().enumerate() {
            self.producers.insert(
                tensor,
                Edge {
                    stage: id,
                    tensor,
                    port: Port::Output(i),
                },
            );
        }
        for &tensor in inputs.iter().chain(&outputs) {
            self.refresh_persistence(tensor);
        }

        self.order.push(id);
        self.scheduled = false;
        id
    }

    fn detach_stage(&mut self, id: StageId) {
        let Some(node) = self.stages.remove_node(id) else {
            return;
        };
        for (i, &tensor) in node.inputs.iter().enumerate() {
            if let Some(edges) = self.consumers.get_mut(&tensor) {
                edges.retain(|edge| !(edge.stage == id && edge.port == Port::Input(i)));
            }
            self.refresh_persistence(tensor);
        }
        for &tensor in &node.outputs {
            self.producers.remove(&tensor);
            self.consumers.remove(&tensor);
            if let Some(slot) = self.tensors.get_mut(tensor.index()) {
                *slot = None;
            }
        }
        self.order.retain(|&stage| stage != id);
    }

    fn set_input(&mut self, stage: StageId, port: usize, tensor: TensorId) {
        let Some(slot) = self
            .stages
            .node_weight_mut(stage)
            .and_then(|node| node.inputs.get_mut(port))
        else {
            return;
        };
        let old = std::mem::replace(slot, tensor);

        if let Some(edges) = self.consumers.get_mut(&old) {
            edges.retain(|edge| !(edge.stage == stage && edge.port == Port::Input(port)));
        }
        self.consumers.entry(tensor).or_default().push(Edge {
            stage,
            tensor,
            port: Port::Input(port),
        });
        self.refresh_persistence(old);
        self.refresh_persistence(tensor);
    }

    /// Point output `port` of `stage` at `tensor`; the old tensor is left
    /// without a producer.
    fn set_output(&mut self, stage: StageId, port: usize, tensor: TensorId) {
        let Some(slot) = self
            .stages
            .node_weight_mut(stage)
            .and_then(|node| node.outputs.get_mut(port))
        else {
            return;
        };
        let old = std::mem::replace(slot, tensor);

        self.producers.remove(&old);
        self.producers.insert(
            tensor,
            Edge {
                stage,
                tensor,
                port: Port::Output(port),
            },
        );
        self.refresh_persistence(old);
        self.refresh_persistence(tensor);
    }

    fn move_consumers(&mut self, old: TensorId, new: TensorId) {
        let edges = self.consumers.remove(&old).unwrap_or_default();
        for edge in edges {
            if let Some(slot) = self
                .stages
                .node_weight_mut(edge.stage)
                .and_then(|node| node.inputs.get_mut(edge.port.index()))
            {
                *slot = new;
            }
            self.consumers.entry(new).or_default().push(Edge {
                tensor: new,
                ..edge
            });
        }
        for output in self.outputs.iter_mut() {
            if *output == old {
                *output = new;
            }
        }
        self.refresh_persistence(old);
        self.refresh_persistence(new);
    }

    fn refresh_persistence(&mut self, tensor: TensorId) {
        let state = self
            .producers
            .get(&tensor)
            .and_then(|edge| self.stages.node_weight(edge.stage))
            .and_then(|node| match &node.op {
                Op::MemoryRead(read) => Some(read.state),
                _ => None,
            });
        if let Some(Some(desc)) = self.tensors.get_mut(tensor.index()) {
            desc.persistent = state;
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
