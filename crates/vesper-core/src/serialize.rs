//! Sinks that stages write their backend parameters and bindings into.

use bytemuck::Pod;

use crate::ir::{StageId, TensorId};
use crate::layout::{MemoryOrder, StrideRequirement};
use crate::ops::OpKind;
use crate::plan::Region;
use crate::Result;

/// Ordered little-endian parameter blob for one stage.
#[derive(Debug, Clone, Default)]
pub struct BlobSerializer {
    bytes: Vec<u8>,
}

impl BlobSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one POD value.
    pub fn append<T: Pod>(&mut self, value: T) -> &mut Self {
        self.bytes.extend_from_slice(bytemuck::bytes_of(&value));
        self
    }

    /// Append a slice of POD values.
    pub fn append_slice<T: Pod>(&mut self, values: &[T]) -> &mut Self {
        self.bytes.extend_from_slice(bytemuck::cast_slice(values));
        self
    }

    /// Booleans travel as 32-bit integers.
    pub fn append_bool(&mut self, value: bool) -> &mut Self {
        self.append(value as i32)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A buffer bound to a stage: a graph tensor or one of its scratch buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Tensor(TensorId),
    Temp(usize),
}

/// Ordered list of buffers a stage binds.
#[derive(Debug, Clone, Default)]
pub struct DataSink {
    bindings: Vec<Binding>,
}

impl DataSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor(&mut self, id: TensorId) -> &mut Self {
        self.bindings.push(Binding::Tensor(id));
        self
    }

    pub fn temp(&mut self, index: usize) -> &mut Self {
        self.bindings.push(Binding::Temp(index));
        self
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn into_bindings(self) -> Vec<Binding> {
        self.bindings
    }
}

/// A resolved buffer reference handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRef {
    pub binding: Binding,

    /// Finalized order; `None` for scratch buffers.
    pub order: Option<MemoryOrder>,
    pub strides: StrideRequirement,
    pub scale: f32,
    pub region: Region,
}

/// One stage as emitted to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub stage: StageId,
    pub kind: OpKind,
    pub params: Vec<u8>,
    pub data: Vec<DataRef>,
}

/// Backend-specific consumer of the finalized graph.
pub trait BackendSerializer {
    fn emit_stage(&mut self, record: StageRecord) -> Result<()>;
}

impl BackendSerializer for Vec<StageRecord> {
    fn emit_stage(&mut self, record: StageRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_layout() {
        let mut blob = BlobSerializer::new();
        blob.append(7u32).append(0.5f32).append_bool(true);
        blob.append_slice(&[1u32, 2]);

        let bytes = blob.into_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
    }

    #[test]
    fn test_data_sink_keeps_order() {
        let mut sink = DataSink::new();
        sink.tensor(TensorId::new(3)).temp(0).tensor(TensorId::new(1));
        assert_eq!(
            sink.bindings(),
            &[
                Binding::Tensor(TensorId::new(3)),
                Binding::Temp(0),
                Binding::Tensor(TensorId::new(1))
            ]
        );
    }
}
