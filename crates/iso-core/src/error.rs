use std::fmt;

use crate::value::{ValueId, ValueKind};

/// Every failure the engine can surface. Each variant carries enough context
/// to name the offending value, predicate or branch in its message.
///
/// `Truncated` and merge conflicts are not errors: they are reported on
/// result types (`truncated` flags, `MergeOutcome::Conflict`).
#[derive(Debug, Clone, PartialEq)]
pub enum IsoError {
    /// Lookup miss.
    NotFound(ValueId),
    /// An edge names an endpoint that does not exist or is not a node.
    ReferentialIntegrity {
        edge: ValueId,
        endpoint: ValueId,
        reason: String,
    },
    /// Delete of a node blocked by incident edges (no cascade requested).
    DependentEdges { node: ValueId, edges: Vec<ValueId> },
    /// A filter predicate is self-contradictory or references an axis it
    /// cannot apply to.
    MalformedPredicate { location: String, reason: String },
    /// Attempt to change the kind of an existing value.
    KindChanged {
        id: ValueId,
        existing: ValueKind,
        attempted: ValueKind,
    },
    /// Structurally invalid value (edge without endpoints, empty id, ...).
    InvalidValue { id: ValueId, reason: String },
    /// An attribute could not be classified onto its declared axis.
    FacetDerivation {
        id: ValueId,
        attribute: String,
        reason: String,
    },
    BranchNotFound(String),
    BranchExists(String),
    /// Merge requested on a branch that has no parent.
    NoParentBranch(String),
    SnapshotNotFound { branch: String, index: u64 },
    InvalidArgument(String),
    /// Cooperative cancellation observed at a checkpoint.
    Cancelled,
}

impl fmt::Display for IsoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsoError::NotFound(id) => write!(f, "value not found: {id}"),
            IsoError::ReferentialIntegrity {
                edge,
                endpoint,
                reason,
            } => write!(
                f,
                "referential integrity violation: edge {edge} references {endpoint} ({reason})"
            ),
            IsoError::DependentEdges { node, edges } => {
                let listed: Vec<&str> = edges.iter().map(|e| e.as_str()).collect();
                write!(
                    f,
                    "cannot delete node {node}: {} dependent edge(s) [{}]",
                    edges.len(),
                    listed.join(", ")
                )
            }
            IsoError::MalformedPredicate { location, reason } => {
                write!(f, "malformed predicate at {location}: {reason}")
            }
            IsoError::KindChanged {
                id,
                existing,
                attempted,
            } => write!(
                f,
                "value {id} is a {existing}; cannot rewrite it as a {attempted}"
            ),
            IsoError::InvalidValue { id, reason } => write!(f, "invalid value {id}: {reason}"),
            IsoError::FacetDerivation {
                id,
                attribute,
                reason,
            } => write!(
                f,
                "facet derivation failed for {id}.{attribute}: {reason}"
            ),
            IsoError::BranchNotFound(name) => write!(f, "branch not found: {name}"),
            IsoError::BranchExists(name) => write!(f, "branch already exists: {name}"),
            IsoError::NoParentBranch(name) => {
                write!(f, "branch {name} has no parent to merge into")
            }
            IsoError::SnapshotNotFound { branch, index } => {
                write!(f, "snapshot #{index} is not in the history of branch {branch}")
            }
            IsoError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            IsoError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for IsoError {}

pub type Result<T> = std::result::Result<T, IsoError>;

impl IsoError {
    pub(crate) fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        IsoError::MalformedPredicate {
            location: location.into(),
            reason: reason.into(),
        }
    }
}
