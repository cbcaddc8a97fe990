//! Consumer harness over the in-memory backends

use crate::recording::RecordingHandler;
use std::sync::Arc;
use std::time::Duration;
use vnc_sync_common::{
    ChangeEvent, ChangeNotificationConsumer, ConsumerOptions, MemoryBus, MemoryStore,
    ObjectHandler, PassReport, ResyncReport, RetryPolicy, SyncEngine, SyncEngineBuilder,
    SyncResult, TrackerOptions,
};

/// Harness tuning; defaults keep timeouts short
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Queue the consumer subscribes to
    pub queue_name: String,
    /// Store RPC retry policy
    pub retry: RetryPolicy,
    /// Read referents missing from the cache from the store
    pub resolve_missing_from_store: bool,
    /// Wait per receive call
    pub recv_timeout: Duration,
    /// Pause before reconnecting
    pub reconnect_backoff: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            queue_name: "vnc_config.test".to_string(),
            retry: RetryPolicy::new(Duration::from_millis(50), 3, Duration::from_millis(5)),
            resolve_missing_from_store: true,
            recv_timeout: Duration::from_millis(20),
            reconnect_backoff: Duration::from_millis(10),
        }
    }
}

impl HarnessOptions {
    /// Consumer options derived from these settings
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            queue_name: self.queue_name.clone(),
            recv_timeout: self.recv_timeout,
            reconnect_backoff: self.reconnect_backoff,
        }
    }
}

/// Engine, store, bus and recorder wired into one consumer
pub struct Harness {
    /// Backing store shared with the consumer
    pub store: Arc<MemoryStore>,
    /// Handle on the consumer's bus
    pub bus: MemoryBus,
    /// Handler registered for every type
    pub recorder: Arc<RecordingHandler>,
    /// The consumer under test
    pub consumer: ChangeNotificationConsumer,
    queue: String,
}

impl Harness {
    /// Build a harness with default options and fresh backends
    pub fn new<F>(graph: F) -> SyncResult<Self>
    where
        F: FnOnce(Arc<dyn ObjectHandler>) -> SyncEngineBuilder,
    {
        Self::with_options(graph, HarnessOptions::default())
    }

    /// Build a harness with fresh backends
    pub fn with_options<F>(graph: F, options: HarnessOptions) -> SyncResult<Self>
    where
        F: FnOnce(Arc<dyn ObjectHandler>) -> SyncEngineBuilder,
    {
        Self::with_backends(graph, options, Arc::new(MemoryStore::new()), MemoryBus::new())
    }

    /// Build a harness over existing backends, e.g. to restart a consumer
    /// against the store and queues of a previous one
    pub fn with_backends<F>(
        graph: F,
        options: HarnessOptions,
        store: Arc<MemoryStore>,
        bus: MemoryBus,
    ) -> SyncResult<Self>
    where
        F: FnOnce(Arc<dyn ObjectHandler>) -> SyncEngineBuilder,
    {
        let recorder = Arc::new(RecordingHandler::new());
        let engine = graph(recorder.clone())
            .with_options(TrackerOptions {
                resolve_missing_from_store: options.resolve_missing_from_store,
                retry: options.retry,
            })
            .build()?;

        let consumer = ChangeNotificationConsumer::new(
            engine,
            store.clone(),
            Box::new(bus.clone()),
            options.consumer_options(),
        );

        Ok(Self {
            store,
            bus,
            recorder,
            consumer,
            queue: options.queue_name,
        })
    }

    /// Connect, subscribe and run the initial resync
    pub async fn start(&mut self) -> SyncResult<ResyncReport> {
        self.consumer.connect().await?;
        self.consumer.sync().await
    }

    /// Run an on-demand resync
    pub async fn resync(&mut self) -> SyncResult<ResyncReport> {
        self.consumer.sync().await
    }

    /// Apply one event directly, bypassing the bus
    pub async fn apply(&mut self, event: ChangeEvent) -> SyncResult<PassReport> {
        self.consumer.process_event(event).await
    }

    /// Publish an event to the consumer's queue
    pub fn publish(&self, event: &ChangeEvent) -> SyncResult<bool> {
        self.bus.publish_event(&self.queue, event)
    }

    /// The consumer's queue name
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The consumer's engine
    pub fn engine(&self) -> &SyncEngine {
        self.consumer.engine()
    }
}
