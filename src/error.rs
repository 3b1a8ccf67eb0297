use thiserror::Error;

use crate::tree::NodeId;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, MapTreeError>;

/// Failure reported by a [`NodeRepository`](crate::engine::NodeRepository) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// The backend could not be reached.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request (validation, authorization, ...).
    #[error("rejected by repository: {0}")]
    Rejected(String),
}

/// Engine error types.
#[derive(Debug, Error)]
pub enum MapTreeError {
    /// A remote create/remove/edit/move call failed.
    #[error("remote {op} of {id} failed: {source}")]
    RemoteRejected {
        op: &'static str,
        id: NodeId,
        #[source]
        source: RepositoryError,
    },

    /// A decoded record references a parent that is not in the input.
    #[error("record {id} references unknown parent {parent}")]
    DecodeAmbiguous { id: NodeId, parent: NodeId },

    /// The operation would break a tree invariant (cycle, child under a leaf, duplicate id).
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// No node with this id exists in the tree.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A remote confirmation arrived for a node that changed or vanished meanwhile.
    #[error("mutation of {0} was superseded before the repository answered")]
    Stale(NodeId),

    /// The engine was closed while a remote call was in flight.
    #[error("engine closed")]
    Closed,

    /// I/O errors reading input or config files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON input.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid value provided by the user.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl MapTreeError {
    pub(crate) fn remote(op: &'static str, id: &NodeId, source: RepositoryError) -> Self {
        MapTreeError::RemoteRejected {
            op,
            id: id.clone(),
            source,
        }
    }
}
