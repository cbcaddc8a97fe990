//! User-visible entity (UVE) publishing
//!
//! Every evaluated resource reports its derived state as a UVE. The sink is
//! pluggable; the daemon default writes each UVE to the log.

use crate::error::{Result, SchemaTransformerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use vnc_sync_common::PropertyBag;

/// One UVE update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Uve {
    /// UVE table, e.g. `ObjectVNTable`.
    pub table: String,
    /// Object id.
    pub key: String,
    /// Generation time.
    pub timestamp: DateTime<Utc>,
    /// Reported attributes.
    pub attributes: PropertyBag,
}

impl Uve {
    /// Creates a UVE stamped with the current time.
    pub fn new(table: impl Into<String>, key: impl Into<String>, attributes: PropertyBag) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            timestamp: Utc::now(),
            attributes,
        }
    }
}

/// Destination of UVE updates.
#[async_trait]
pub trait UvePublisher: Send + Sync {
    /// Publishes one update.
    async fn publish(&self, uve: Uve) -> Result<()>;
}

/// Logs every UVE through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUvePublisher;

#[async_trait]
impl UvePublisher for TracingUvePublisher {
    async fn publish(&self, uve: Uve) -> Result<()> {
        let attributes = serde_json::to_string(&uve.attributes)
            .map_err(|e| SchemaTransformerError::uve(&uve.key, e.to_string()))?;
        info!(
            table = %uve.table,
            key = %uve.key,
            timestamp = %uve.timestamp.to_rfc3339(),
            %attributes,
            "UVE"
        );
        Ok(())
    }
}

/// Keeps published UVEs in memory; can be told to reject publishes.
#[derive(Debug, Default)]
pub struct CollectingUvePublisher {
    uves: Mutex<Vec<Uve>>,
    failing: Mutex<bool>,
}

impl CollectingUvePublisher {
    /// Creates an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes later publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Returns every UVE published so far.
    pub fn published(&self) -> Vec<Uve> {
        self.uves.lock().clone()
    }

    /// Returns the latest UVE for `(table, key)`.
    pub fn latest(&self, table: &str, key: &str) -> Option<Uve> {
        self.uves
            .lock()
            .iter()
            .rev()
            .find(|u| u.table == table && u.key == key)
            .cloned()
    }
}

#[async_trait]
impl UvePublisher for CollectingUvePublisher {
    async fn publish(&self, uve: Uve) -> Result<()> {
        if *self.failing.lock() {
            return Err(SchemaTransformerError::uve(uve.key, "collector unavailable"));
        }
        self.uves.lock().push(uve);
        Ok(())
    }
}
