//! Error types for CRDT operations

use crate::types::NodeId;
use thiserror::Error;

/// CRDT operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrdtError {
    /// An operation payload failed type-specific validation. The operation
    /// is rejected before it touches instance state.
    #[error("Malformed operation: {reason}")]
    MalformedOperation {
        /// Why validation rejected the payload
        reason: String,
    },

    /// An incoming operation carries a local sequence already covered for
    /// that node. Treated as a duplicate and dropped by callers; surfacing
    /// it as an error never halts a sync round.
    #[error("Clock regression for node {node}: sequence {sequence} already applied")]
    ClockRegression {
        /// Originating node
        node: NodeId,
        /// The stale sequence number
        sequence: u64,
    },

    /// A policy-level conflict the resolver could not settle. Reported to
    /// collaborators; the algebraic merge has already proceeded.
    #[error("Unresolvable conflict: {description}")]
    UnresolvableConflict {
        /// Human-readable conflict description
        description: String,
    },

    /// Network error during synchronization; retried with backoff.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Corrupt bytes on load or a wire frame that cannot be decoded.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Instance or peer not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence collaborator error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// An operation or state blob addressed to an instance of a different type
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type tag of the target instance
        expected: String,
        /// Type tag carried by the payload
        actual: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CrdtError {
    /// Create a malformed-operation error
    pub fn malformed<T: std::fmt::Display>(reason: T) -> Self {
        Self::MalformedOperation {
            reason: reason.to_string(),
        }
    }

    /// Whether this error should be swallowed as a duplicate rather than
    /// propagated through a sync round.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::ClockRegression { .. })
    }

    /// Whether the failed operation is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for CrdtError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailure(err.to_string())
    }
}

impl From<bincode::Error> for CrdtError {
    fn from(err: bincode::Error) -> Self {
        Self::SerializationFailure(err.to_string())
    }
}

impl From<anyhow::Error> for CrdtError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<CrdtError> for weft_core::WeftError {
    fn from(err: CrdtError) -> Self {
        match err {
            CrdtError::TransportFailure(msg) => weft_core::WeftError::Network(msg),
            CrdtError::SerializationFailure(msg) => weft_core::WeftError::Serialization(msg),
            CrdtError::Storage(msg) => weft_core::WeftError::Storage(msg),
            CrdtError::NotFound(msg) => weft_core::WeftError::NotFound(msg),
            CrdtError::Timeout(msg) => weft_core::WeftError::Timeout(msg),
            other => weft_core::WeftError::Internal(other.to_string()),
        }
    }
}

/// Result type for CRDT operations
pub type Result<T> = std::result::Result<T, CrdtError>;
