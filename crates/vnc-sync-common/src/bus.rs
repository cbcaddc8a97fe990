//! Change-notification bus interface.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::time::Duration;

/// One message taken from the bus, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque tag used to ack or requeue this delivery.
    pub tag: u64,
    /// Encoded change event.
    pub payload: String,
}

impl Delivery {
    /// Creates a delivery.
    pub fn new(tag: u64, payload: impl Into<String>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// At-least-once notification queue.
///
/// A delivery that is neither acked nor requeued stays in flight and is
/// redelivered after the next `subscribe`.
#[async_trait]
pub trait NotificationBus: Send {
    /// Establishes the connection.
    async fn connect(&mut self) -> SyncResult<()>;

    /// Declares and binds `queue`. Messages published after this call are
    /// retained until consumed.
    async fn subscribe(&mut self, queue: &str) -> SyncResult<()>;

    /// Waits up to `timeout` for the next delivery.
    async fn recv(&mut self, timeout: Duration) -> SyncResult<Option<Delivery>>;

    /// Acknowledges a delivery; it will not be seen again.
    async fn ack(&mut self, tag: u64) -> SyncResult<()>;

    /// Returns a delivery to the head of the queue.
    async fn requeue(&mut self, tag: u64) -> SyncResult<()>;

    /// Releases the connection.
    async fn close(&mut self) -> SyncResult<()> {
        Ok(())
    }
}
