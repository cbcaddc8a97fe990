//! Error types for the schema transformer

use thiserror::Error;
use vnc_sync_common::{EvalError, SyncError};

/// Schema transformer errors
#[derive(Error, Debug)]
pub enum SchemaTransformerError {
    /// Engine, store or bus failure
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Daemon configuration error
    #[error("Invalid configuration for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// No route target number left to assign
    #[error("Route target pool {start}..{end} exhausted")]
    PoolExhausted { start: u32, end: u32 },

    /// Route target name not of the form target:<asn>:<n>
    #[error("Invalid route target name '{name}'")]
    InvalidRouteTarget { name: String },

    /// Policy rule with an unknown action
    #[error("Policy '{policy}' rule {index}: unknown action '{action}'")]
    InvalidPolicyAction {
        policy: String,
        index: usize,
        action: String,
    },

    /// Policy rules field that does not parse
    #[error("Policy '{policy}': malformed rules: {message}")]
    MalformedRules { policy: String, message: String },

    /// UVE sink rejected a publish
    #[error("UVE publish for '{key}' failed: {message}")]
    Uve { key: String, message: String },
}

impl SchemaTransformerError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        SchemaTransformerError::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a UVE publish error.
    pub fn uve(key: impl Into<String>, message: impl Into<String>) -> Self {
        SchemaTransformerError::Uve {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<SchemaTransformerError> for EvalError {
    fn from(err: SchemaTransformerError) -> Self {
        match err {
            SchemaTransformerError::Uve { .. } => EvalError::downstream("uve", err.to_string()),
            SchemaTransformerError::Sync(ref e) if e.is_transient() => {
                EvalError::transient(err.to_string())
            }
            other => EvalError::invalid(other.to_string()),
        }
    }
}

/// Result type for schema transformer operations
pub type Result<T> = std::result::Result<T, SchemaTransformerError>;
