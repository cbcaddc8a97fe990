//! Change-notification consumer state machine.
//!
//! Drives the bus subscription, applies each change event to the cache and
//! runs one propagation pass per event:
//!
//! ```text
//! Disconnected -> Connecting -> Syncing -> Streaming
//!       ^             |            |           |
//!       +-------------+------------+-----------+   (store/bus failure)
//! ```
//!
//! The bus is subscribed before the resync listing starts, so changes made
//! while the listing runs are queued and applied afterwards. One delivery is
//! processed at a time and acknowledged only once its pass completed.

use crate::bus::{Delivery, NotificationBus};
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::event::{ChangeEvent, Operation};
use crate::resync::{ResyncCoordinator, ResyncReport};
use crate::schema::{RefValue, References};
use crate::store::ConfigStore;
use crate::tracker::{PassReport, PropagationPass};
use crate::types::{ObjectKey, PropertyBag, SELF_RELATION};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection state of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// No connection.
    Disconnected,
    /// Connecting to store and bus, subscribing.
    Connecting,
    /// Running a full resync.
    Syncing,
    /// Processing notifications.
    Streaming,
}

impl ConsumerState {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Syncing)
                | (Connecting, Disconnected)
                | (Syncing, Streaming)
                | (Syncing, Disconnected)
                | (Streaming, Syncing)
                | (Streaming, Disconnected)
        )
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "DISCONNECTED",
            ConsumerState::Connecting => "CONNECTING",
            ConsumerState::Syncing => "SYNCING",
            ConsumerState::Streaming => "STREAMING",
        };
        f.write_str(name)
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed and acknowledged.
    Acked,
    /// Event for an unregistered type; acknowledged without processing.
    Ignored,
    /// Processing failed; returned to the queue.
    Requeued,
    /// Payload could not be decoded; left unacknowledged.
    Undecodable,
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Queue to subscribe to.
    pub queue_name: String,
    /// Wait per `recv` call before checking for shutdown again.
    pub recv_timeout: Duration,
    /// Pause before reconnecting after a failure.
    pub reconnect_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            queue_name: "vnc_config.object-update".to_string(),
            recv_timeout: Duration::from_millis(1000),
            reconnect_backoff: Duration::from_millis(2000),
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries received.
    pub received: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries requeued after a processing failure.
    pub requeued: u64,
    /// Deliveries left unacknowledged because they did not decode.
    pub undecodable: u64,
    /// Events for unregistered types.
    pub ignored: u64,
    /// Completed resyncs.
    pub resyncs: u64,
    /// Connection attempts after the first.
    pub reconnects: u64,
}

/// The notification consumer of one service instance.
pub struct ChangeNotificationConsumer {
    state: ConsumerState,
    engine: SyncEngine,
    store: Arc<dyn ConfigStore>,
    bus: Box<dyn NotificationBus>,
    resync: ResyncCoordinator,
    options: ConsumerOptions,
    stats: ConsumerStats,
    connected_once: bool,
    last_resync: Option<ResyncReport>,
}

impl ChangeNotificationConsumer {
    /// Creates a disconnected consumer.
    pub fn new(
        engine: SyncEngine,
        store: Arc<dyn ConfigStore>,
        bus: Box<dyn NotificationBus>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            state: ConsumerState::Disconnected,
            engine,
            store,
            bus,
            resync: ResyncCoordinator::new(),
            options,
            stats: ConsumerStats::default(),
            connected_once: false,
            last_resync: None,
        }
    }

    /// Sets the resync coordinator.
    pub fn with_resync(mut self, resync: ResyncCoordinator) -> Self {
        self.resync = resync;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Returns the engine.
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Returns the engine mutably.
    pub fn engine_mut(&mut self) -> &mut SyncEngine {
        &mut self.engine
    }

    /// Returns the delivery counters.
    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    /// Returns the report of the last completed resync.
    pub fn last_resync(&self) -> Option<&ResyncReport> {
        self.last_resync.as_ref()
    }

    fn transition(&mut self, next: ConsumerState) -> SyncResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::internal(format!(
                "illegal consumer transition {} -> {}",
                self.state, next
            )));
        }
        debug!(from = %self.state, to = %next, "Consumer state change");
        self.state = next;
        Ok(())
    }

    /// Connects store and bus and subscribes to the queue.
    ///
    /// On failure the consumer is back in `Disconnected`.
    #[instrument(skip(self), fields(queue = %self.options.queue_name))]
    pub async fn connect(&mut self) -> SyncResult<()> {
        self.transition(ConsumerState::Connecting)?;
        if self.connected_once {
            self.stats.reconnects += 1;
        }
        self.connected_once = true;

        let result = async {
            self.store.connect().await?;
            self.bus.connect().await?;
            self.bus.subscribe(&self.options.queue_name).await
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Connect failed");
            self.transition(ConsumerState::Disconnected)?;
            return Err(e);
        }
        info!("Connected and subscribed");
        Ok(())
    }

    /// Runs a full resync and enters `Streaming`.
    ///
    /// Allowed from `Connecting` and from `Streaming` (on-demand resync).
    /// On failure the consumer is back in `Disconnected`.
    pub async fn sync(&mut self) -> SyncResult<ResyncReport> {
        self.transition(ConsumerState::Syncing)?;
        let result = self
            .resync
            .full_resync(&mut self.engine, self.store.as_ref())
            .await;

        match result {
            Ok(report) => {
                self.stats.resyncs += 1;
                self.last_resync = Some(report.clone());
                self.transition(ConsumerState::Streaming)?;
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Resync failed");
                self.transition(ConsumerState::Disconnected)?;
                Err(e)
            }
        }
    }

    /// Applies one change event and runs its propagation pass.
    ///
    /// Returns an error only for store failures outside the pass (reading a
    /// bodiless UPDATE). Handler failures are reported in the [`PassReport`].
    #[instrument(skip_all, fields(oper = ?event.operation, obj_type = %event.obj_type, id = %event.id))]
    pub async fn process_event(&mut self, event: ChangeEvent) -> SyncResult<PassReport> {
        if !self.engine.registry().contains(&event.obj_type) {
            debug!("Ignoring event for unregistered type");
            self.stats.ignored += 1;
            return Ok(PassReport::default());
        }

        let ChangeEvent {
            operation,
            obj_type,
            id,
            raw,
        } = event;

        let raw = match (operation, raw) {
            (Operation::Delete, _) => return Ok(self.apply_delete(&obj_type, &id).await),
            (_, Some(raw)) => raw,
            (_, None) => match self.read_body(&obj_type, &id).await {
                Ok(raw) => raw,
                Err(SyncError::NotFound { .. }) => {
                    debug!("Object vanished upstream, handling as delete");
                    return Ok(self.apply_delete(&obj_type, &id).await);
                }
                Err(e) => return Err(e),
            },
        };

        self.apply_upsert(&obj_type, &id, &raw).await
    }

    async fn read_body(&self, obj_type: &str, id: &str) -> SyncResult<PropertyBag> {
        let store = self.store.as_ref();
        self.engine
            .options()
            .retry
            .run("read", || store.read(obj_type, id))
            .await
    }

    async fn apply_delete(&mut self, obj_type: &str, id: &str) -> PassReport {
        let mut pass = PropagationPass::new();
        let store = self.store.as_ref();
        let removed = self
            .engine
            .tracker(store)
            .remove_and_propagate(&mut pass, obj_type, id)
            .await;
        if removed.is_none() {
            debug!(obj_type, id, "Delete for uncached object");
        }
        pass.finish()
    }

    async fn apply_upsert(
        &mut self,
        obj_type: &str,
        id: &str,
        raw: &PropertyBag,
    ) -> SyncResult<PassReport> {
        let key = ObjectKey::new(obj_type, id);
        let previous = self
            .engine
            .cache()
            .get(obj_type, id)
            .map(|o| o.references.clone())
            .unwrap_or_default();

        let changed = self.engine.cache_mut().update(obj_type, id, raw)?;
        let current = self
            .engine
            .cache()
            .get(obj_type, id)
            .map(|o| o.references.clone())
            .unwrap_or_default();

        // Referents the object no longer points at are not awaited anymore.
        let referents: HashSet<ObjectKey> = match self.engine.cache().schema(obj_type) {
            Some(schema) => current
                .iter()
                .filter_map(|(field, value)| Some((schema.ref_field(field)?, value)))
                .flat_map(|(field, value)| {
                    value
                        .ids()
                        .iter()
                        .map(move |id| ObjectKey::new(field.target.clone(), id.clone()))
                })
                .collect(),
            None => HashSet::new(),
        };
        let dropped: References = previous
            .iter()
            .filter_map(|(field, value)| {
                let ids = value.dropped_since(current.get(field));
                (!ids.is_empty()).then(|| (field.clone(), RefValue::List(ids)))
            })
            .collect();

        // Changed relations with their own rules, walked through both the
        // new and the dropped referents.
        let keyed: Vec<(String, References)> = changed
            .iter()
            .filter(|r| self.engine.reactions().has_relation(obj_type, r))
            .map(|r| {
                let mut ids: Vec<String> = current
                    .get(r)
                    .map(|v| v.ids().to_vec())
                    .unwrap_or_default();
                if let Some(lost) = dropped.get(r) {
                    ids.extend(lost.ids().iter().cloned());
                }
                let refs = References::from([(r.clone(), RefValue::List(ids))]);
                (r.clone(), refs)
            })
            .collect();

        let mut pass = PropagationPass::new();
        let store = self.store.as_ref();
        let mut tracker = self.engine.tracker(store);

        tracker.evaluate(&mut pass, obj_type, id, SELF_RELATION).await;
        if !dropped.is_empty() {
            tracker
                .propagate(&mut pass, &key, &dropped, SELF_RELATION)
                .await;
        }
        for (relation, refs) in &keyed {
            tracker.propagate(&mut pass, &key, refs, relation).await;
        }

        tracker
            .pending_mut()
            .retain_referents(&key, |referent| referents.contains(referent));

        let waiters = tracker.pending_mut().satisfy(&key);
        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "Evaluating referrers waiting on this object");
            tracker.evaluate_all(&mut pass, waiters).await;
        }

        Ok(pass.finish())
    }

    /// Decodes, processes and settles one delivery.
    ///
    /// Returns an error only if settling the delivery on the bus failed.
    pub async fn handle_delivery(&mut self, delivery: Delivery) -> SyncResult<DeliveryOutcome> {
        self.stats.received += 1;
        let tag = delivery.tag;

        let event = match ChangeEvent::decode(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(tag, error = %e, "Undecodable notification left unacknowledged");
                self.stats.undecodable += 1;
                return Ok(DeliveryOutcome::Undecodable);
            }
        };

        let ignored = !self.engine.registry().contains(&event.obj_type);
        match self.process_event(event).await {
            Ok(report) => {
                self.bus.ack(tag).await?;
                self.stats.acked += 1;
                if ignored {
                    return Ok(DeliveryOutcome::Ignored);
                }
                debug!(
                    tag,
                    evaluated = report.evaluated,
                    updated = report.updated,
                    failed = report.failed(),
                    "Notification processed"
                );
                Ok(DeliveryOutcome::Acked)
            }
            Err(e) => {
                warn!(tag, error = %e, "Notification processing failed, requeueing");
                self.bus.requeue(tag).await?;
                self.stats.requeued += 1;
                if e.is_connection_loss() && self.state == ConsumerState::Streaming {
                    self.transition(ConsumerState::Disconnected)?;
                }
                Ok(DeliveryOutcome::Requeued)
            }
        }
    }

    /// Receives and handles at most one delivery.
    ///
    /// Returns `None` if the receive timed out.
    pub async fn poll_once(&mut self) -> SyncResult<Option<DeliveryOutcome>> {
        match self.bus.recv(self.options.recv_timeout).await? {
            Some(delivery) => self.handle_delivery(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between deliveries only: a pass in flight
    /// completes before the bus is closed.
    pub async fn run(&mut self, shutdown: CancellationToken) -> SyncResult<()> {
        info!(queue = %self.options.queue_name, "Consumer starting");

        while !shutdown.is_cancelled() {
            match self.state {
                ConsumerState::Disconnected => {
                    if self.connect().await.is_err() && !self.backoff(&shutdown).await {
                        break;
                    }
                }
                ConsumerState::Connecting => {
                    if self.sync().await.is_err() && !self.backoff(&shutdown).await {
                        break;
                    }
                }
                ConsumerState::Syncing => {
                    return Err(SyncError::internal("consumer left in SYNCING state"));
                }
                ConsumerState::Streaming => {
                    let received = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        received = self.bus.recv(self.options.recv_timeout) => received,
                    };

                    let result = match received {
                        Ok(Some(delivery)) => self.handle_delivery(delivery).await.map(|_| ()),
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "Bus failure, reconnecting");
                        if self.state == ConsumerState::Streaming {
                            self.transition(ConsumerState::Disconnected)?;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "Failed to close bus connection");
        }
        info!(
            received = self.stats.received,
            acked = self.stats.acked,
            requeued = self.stats.requeued,
            "Consumer stopped"
        );
        Ok(())
    }

    /// Sleeps for the reconnect backoff. Returns false if shut down meanwhile.
    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.options.reconnect_backoff) => true,
        }
    }
}
