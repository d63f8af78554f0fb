//! Structural edits collected during a pass and applied when it ends.
//!
//! Passes never mutate the graph topology mid-sweep; they queue edits here
//! and hand the batch to [`Graph::apply`](crate::ir::Graph::apply).

use crate::ir::{StageId, TensorId};
use crate::layout::MemoryOrder;

/// A single queued structural edit.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEdit {
    /// Insert a layout-conversion stage reading `tensor` and producing a copy
    /// in `order`, then rewire the listed `(stage, input port)` pairs to it.
    InsertConversion {
        tensor: TensorId,
        order: MemoryOrder,
        consumers: Vec<(StageId, usize)>,
    },

    /// Move output `port` of `stage` off `tensor` onto a fresh tensor in
    /// `order`, then insert a conversion from it into `tensor`, which keeps
    /// its fixed order.
    ConvertOutput {
        stage: StageId,
        port: usize,
        tensor: TensorId,
        order: MemoryOrder,
    },
}

/// Edits queued by one pass.
#[derive(Debug, Clone, Default)]
pub struct PendingEdits {
    edits: Vec<GraphEdit>,
}

impl PendingEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a conversion of `tensor` to `order` for one consumer port.
    ///
    /// Requests for the same tensor and order share one conversion stage.
    pub fn request_conversion(
        &mut self,
        tensor: TensorId,
        order: MemoryOrder,
        consumer: StageId,
        port: usize,
    ) {
        for edit in &mut self.edits {
            let GraphEdit::InsertConversion {
                tensor: queued,
                order: queued_order,
                consumers,
            } = edit
            else {
                continue;
            };
            if *queued == tensor && *queued_order == order {
                if !consumers.contains(&(consumer, port)) {
                    consumers.push((consumer, port));
                }
                return;
            }
        }
        self.edits.push(GraphEdit::InsertConversion {
            tensor,
            order,
            consumers: vec![(consumer, port)],
        });
    }

    /// Queue a producer-side conversion for an output whose order is fixed.
    ///
    /// One request per producer port; a repeated request is ignored.
    pub fn request_output_conversion(
        &mut self,
        stage: StageId,
        port: usize,
        tensor: TensorId,
        order: MemoryOrder,
    ) {
        let queued = self.edits.iter().any(|edit| {
            matches!(
                edit,
                GraphEdit::ConvertOutput { stage: s, port: p, .. } if *s == stage && *p == port
            )
        });
        if !queued {
            self.edits.push(GraphEdit::ConvertOutput {
                stage,
                port,
                tensor,
                order,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphEdit> {
        self.edits.iter()
    }

    pub fn into_edits(self) -> Vec<GraphEdit> {
        self.edits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::graph::NodeIndex;

    #[test]
    fn test_conversions_dedupe_by_tensor_and_order() {
        let mut edits = PendingEdits::new();
        let t = TensorId::new(0);
        edits.request_conversion(t, MemoryOrder::nhwc(), NodeIndex::new(1), 0);
        edits.request_conversion(t, MemoryOrder::nhwc(), NodeIndex::new(2), 1);
        edits.request_conversion(t, MemoryOrder::nhwc(), NodeIndex::new(2), 1);
        edits.request_conversion(t, MemoryOrder::nchw(), NodeIndex::new(3), 0);

        assert_eq!(edits.len(), 2);
        let edits = edits.into_edits();
        let GraphEdit::InsertConversion { consumers, .. } = &edits[0] else {
            panic!("expected a consumer conversion, got {:?}", edits[0]);
        };
        assert_eq!(
            consumers,
            &vec![(NodeIndex::new(1), 0), (NodeIndex::new(2), 1)]
        );
    }

    #[test]
    fn test_output_conversions_dedupe_by_port() {
        let mut edits = PendingEdits::new();
        let t = TensorId::new(3);
        edits.request_output_conversion(NodeIndex::new(0), 0, t, MemoryOrder::nchw());
        edits.request_output_conversion(NodeIndex::new(0), 0, t, MemoryOrder::nchw());
        edits.request_conversion(t, MemoryOrder::nhwc(), NodeIndex::new(1), 0);
        assert_eq!(edits.len(), 2);
    }
}
