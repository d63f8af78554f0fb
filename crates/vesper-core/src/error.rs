//! Error types shared by every vesper crate.
//!
//! Errors fall into two classes. Internal errors report a bug in the front
//! end or in a pass (wrong edge counts, passes run out of order, a broken
//! structural invariant) and abort compilation immediately. Model errors
//! report something wrong with the network itself (an unsupported parameter,
//! a missing constant weight, a layout that cannot be satisfied) and are
//! surfaced to the user as a structured [`Diagnostic`].

use std::fmt;

use crate::ir::{StageId, TensorId};
use crate::ops::OpKind;

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A structured compile diagnostic.
///
/// Names the offending stage and operator kind (when known) together with
/// the pass that detected the problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Stage that triggered the error, if the error is stage-specific.
    pub stage: Option<StageId>,

    /// Operator kind of that stage.
    pub kind: Option<OpKind>,

    /// Name of the pass that reported the error.
    pub pass: String,

    /// Human-readable description.
    pub message: String,
}

impl Diagnostic {
    /// Create a diagnostic that is not tied to a particular stage.
    pub fn new(pass: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: None,
            kind: None,
            pass: pass.into(),
            message: message.into(),
        }
    }

    /// Create a diagnostic naming a stage and its operator kind.
    pub fn for_stage(
        stage: StageId,
        kind: OpKind,
        pass: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: Some(stage),
            kind: Some(kind),
            pass: pass.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.pass)?;
        if let Some(stage) = self.stage {
            write!(f, " stage #{}", stage.index())?;
        }
        if let Some(kind) = self.kind {
            write!(f, " ({kind})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Core error type for vesper operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Programmer error: the front end or a pass broke a precondition.
    #[error("Internal error {0}")]
    Internal(Diagnostic),

    /// User-facing error in the network being compiled.
    #[error("Model error {0}")]
    Model(Diagnostic),

    /// Two stages require incompatible memory orders and no conversion fits.
    #[error(
        "Layout conflict on tensor {tensor}: {requested} requested by stage #{} conflicts with {existing_order} fixed by {}",
        .requester.index(),
        order_owner(.existing)
    )]
    LayoutConflict {
        tensor: TensorId,
        existing: Option<StageId>,
        existing_order: String,
        requester: StageId,
        requested: String,
    },

    /// The stage dependency graph contains a cycle.
    #[error("Dependency cycle between stages {stages:?}")]
    Cycle { stages: Vec<usize> },

    /// A structural edit was rejected; the graph is unchanged.
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Constant folding error: {0}")]
    Fold(String),
}

fn order_owner(existing: &Option<StageId>) -> String {
    match existing {
        Some(stage) => format!("stage #{}", stage.index()),
        None => "the graph boundary".to_string(),
    }
}

impl Error {
    /// Build an internal error for a stage.
    pub fn internal(stage: StageId, kind: OpKind, pass: &str, message: impl Into<String>) -> Self {
        Error::Internal(Diagnostic::for_stage(stage, kind, pass, message))
    }

    /// Build a model error for a stage.
    pub fn model(stage: StageId, kind: OpKind, pass: &str, message: impl Into<String>) -> Self {
        Error::Model(Diagnostic::for_stage(stage, kind, pass, message))
    }

    /// Whether this error is a fatal programmer error rather than a model error.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_) | Error::InvalidGraph(_))
    }

    /// The structured diagnostic, for errors that carry one.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Error::Internal(d) | Error::Model(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::graph::NodeIndex;

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::for_stage(NodeIndex::new(3), OpKind::Mvn, "final_check", "bad eps");
        assert_eq!(diag.to_string(), "[final_check] stage #3 (Mvn): bad eps");
    }

    #[test]
    fn test_error_classes() {
        let internal = Error::internal(NodeIndex::new(0), OpKind::Add, "scale", "arity");
        let model = Error::model(NodeIndex::new(0), OpKind::Add, "scale", "unsupported");

        assert!(internal.is_internal());
        assert!(!model.is_internal());
        assert_eq!(model.diagnostic().unwrap().message, "unsupported");
    }

    #[test]
    fn test_layout_conflict_names_boundary() {
        let err = Error::LayoutConflict {
            tensor: TensorId::new(4),
            existing: None,
            existing_order: "NCHW".to_string(),
            requester: NodeIndex::new(1),
            requested: "NHWC".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("stage #1"));
        assert!(text.contains("graph boundary"));
    }
}
