//! Error types for the synchronization engine.
//!
//! [`SyncError`] covers the engine itself (startup validation, backing store,
//! notification bus). Failures raised by consumer handlers are [`EvalError`]s
//! (see [`crate::handler`]) and never escape a propagation pass.
//!
//! [`EvalError`]: crate::handler::EvalError

use std::io;
use thiserror::Error;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The reaction map references an unknown type or relation.
    ///
    /// Raised only while building the engine; the process must not start.
    #[error("Invalid reaction map for '{obj_type}': {message}")]
    InvalidReactionMap {
        /// The type whose rules failed validation.
        obj_type: String,
        /// What was wrong.
        message: String,
    },

    /// Backing store operation failed.
    #[error("Store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed (e.g., "list", "read", "write").
        operation: String,
        /// Error message.
        message: String,
        /// True if the connection itself was lost.
        connection_lost: bool,
    },

    /// Notification bus operation failed.
    #[error("Bus operation failed: {operation}: {message}")]
    Bus {
        /// The operation that failed (e.g., "subscribe", "recv", "ack").
        operation: String,
        /// Error message.
        message: String,
        /// True if the connection itself was lost.
        connection_lost: bool,
    },

    /// An RPC did not complete in time.
    #[error("Timed out after {after_ms}ms: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// Total time waited in milliseconds.
        after_ms: u64,
    },

    /// Object does not exist in the backing store.
    #[error("Object not found: {obj_type}:{id}")]
    NotFound {
        /// The object type.
        obj_type: String,
        /// The object id.
        id: String,
    },

    /// A bus message could not be decoded.
    #[error("Failed to decode notification: {message}")]
    Decode {
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// IO error (configuration files).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl SyncError {
    /// Creates a reaction map validation error.
    pub fn invalid_reaction_map(obj_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReactionMap {
            obj_type: obj_type.into(),
            message: message.into(),
        }
    }

    /// Creates a store error that leaves the connection usable.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            connection_lost: false,
        }
    }

    /// Creates a store error for a lost connection.
    pub fn store_disconnected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            connection_lost: true,
        }
    }

    /// Creates a bus error that leaves the connection usable.
    pub fn bus(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bus {
            operation: operation.into(),
            message: message.into(),
            connection_lost: false,
        }
    }

    /// Creates a bus error for a lost connection.
    pub fn bus_disconnected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bus {
            operation: operation.into(),
            message: message.into(),
            connection_lost: true,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms,
        }
    }

    /// Creates a not found error.
    pub fn not_found(obj_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            obj_type: obj_type.into(),
            id: id.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for IO-class failures that a later resync or redelivery
    /// is expected to repair.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Store { .. } | SyncError::Bus { .. } | SyncError::Timeout { .. }
        )
    }

    /// Returns true for startup failures the process cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidReactionMap { .. } | SyncError::InvalidConfig { .. }
        )
    }

    /// Returns true if the store or bus connection must be re-established.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            SyncError::Store {
                connection_lost: true,
                ..
            } | SyncError::Bus {
                connection_lost: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::not_found("routing_instance", "ri-1");
        assert_eq!(err.to_string(), "Object not found: routing_instance:ri-1");
    }

    #[test]
    fn test_store_error() {
        let err = SyncError::store("read", "Connection refused");
        assert_eq!(
            err.to_string(),
            "Store operation failed: read: Connection refused"
        );
        assert!(err.is_transient());
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn test_classification() {
        assert!(SyncError::invalid_reaction_map("red", "unknown type 'blue'").is_fatal());
        assert!(!SyncError::invalid_reaction_map("red", "x").is_transient());
        assert!(SyncError::timeout("read", 500).is_transient());
        assert!(SyncError::bus_disconnected("recv", "eof").is_connection_loss());
        assert!(!SyncError::decode("bad json").is_transient());
        assert!(!SyncError::internal("bug").is_fatal());
    }
}
