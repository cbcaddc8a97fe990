//! Consumer-supplied evaluation hooks.
//!
//! Each registered type has one [`ObjectHandler`]. The tracker calls
//! `on_evaluate` at most once per object per propagation pass and
//! `on_delete` when an object leaves the cache. Handlers report expected
//! failures through [`EvalError`]; they are logged and counted but never
//! abort the pass.

use crate::cache::{CachedObject, ObjectCache};
use crate::store::ConfigStore;
use crate::types::PropertyBag;
use async_trait::async_trait;
use thiserror::Error;

/// Read-only view handed to handlers during evaluation.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    /// The consumer's object cache.
    pub cache: &'a ObjectCache,
    /// The backing config store.
    pub store: &'a dyn ConfigStore,
}

impl<'a> EvalContext<'a> {
    /// Creates a new context.
    pub fn new(cache: &'a ObjectCache, store: &'a dyn ConfigStore) -> Self {
        Self { cache, store }
    }
}

/// Failure raised by a handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    /// The object's config is semantically invalid.
    #[error("Invalid config: {message}")]
    Invalid { message: String },

    /// An RPC needed by the handler failed; the next resync retries it.
    #[error("Transient failure: {message}")]
    Transient { message: String },

    /// A downstream sink (telemetry, device push) rejected the update.
    #[error("Downstream {sink} failed: {message}")]
    Downstream { sink: String, message: String },
}

impl EvalError {
    /// Creates an invalid config error.
    pub fn invalid(message: impl Into<String>) -> Self {
        EvalError::Invalid {
            message: message.into(),
        }
    }

    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        EvalError::Transient {
            message: message.into(),
        }
    }

    /// Creates a downstream sink error.
    pub fn downstream(sink: impl Into<String>, message: impl Into<String>) -> Self {
        EvalError::Downstream {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Converts this error to an [`EvalOutcome`].
    pub fn to_outcome(&self) -> EvalOutcome {
        match self {
            EvalError::Invalid { .. } => EvalOutcome::InvalidConfig,
            EvalError::Transient { .. } => EvalOutcome::TransientFailure,
            EvalError::Downstream { .. } => EvalOutcome::DownstreamFailure,
        }
    }
}

/// Result type for handler calls.
pub type EvalResult<T> = Result<T, EvalError>;

/// Outcome of one evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalOutcome {
    /// Derived state changed and was written back.
    Updated,
    /// Handler ran; derived state unchanged.
    Unchanged,
    /// Object belongs to another instance's partition.
    SkippedNotOwned,
    /// Handler reported invalid config.
    InvalidConfig,
    /// Handler hit a transient failure.
    TransientFailure,
    /// A downstream sink failed.
    DownstreamFailure,
}

impl EvalOutcome {
    /// Returns true if the handler completed without error.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            EvalOutcome::Updated | EvalOutcome::Unchanged | EvalOutcome::SkippedNotOwned
        )
    }
}

/// Per-type evaluation hooks.
#[async_trait]
pub trait ObjectHandler: Send + Sync {
    /// Recomputes derived state for `obj`.
    ///
    /// Returns `Some(derived)` to replace the object's derived state, `None`
    /// to leave it as is. Must be idempotent: the same cache content must
    /// yield the same derived state.
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>>;

    /// Takes over derived state reloaded from the store during resync.
    ///
    /// Runs for every object whose derived state was restored, after the
    /// whole listing is cached and before anything is evaluated. Handlers
    /// that hand out resources claim them back here.
    fn on_restore(&self, _obj: &CachedObject) {}

    /// Cleans up after `snapshot` was removed from the cache.
    async fn on_delete(&self, _snapshot: &CachedObject, _cx: EvalContext<'_>) -> EvalResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_error_outcome() {
        assert_eq!(
            EvalError::invalid("bad rt").to_outcome(),
            EvalOutcome::InvalidConfig
        );
        assert_eq!(
            EvalError::transient("timeout").to_outcome(),
            EvalOutcome::TransientFailure
        );
        let err = EvalError::downstream("uve", "collector down");
        assert_eq!(err.to_string(), "Downstream uve failed: collector down");
        assert_eq!(err.to_outcome(), EvalOutcome::DownstreamFailure);
    }

    #[test]
    fn test_outcome_success() {
        assert!(EvalOutcome::Updated.is_success());
        assert!(EvalOutcome::SkippedNotOwned.is_success());
        assert!(!EvalOutcome::InvalidConfig.is_success());
        assert!(!EvalOutcome::TransientFailure.is_success());
    }
}
