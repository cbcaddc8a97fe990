//! Reaction-driven config synchronization engine.
//!
//! This crate keeps a local cache of configuration objects in step with a
//! backing store and re-evaluates objects whose inputs changed:
//!
//! - [`ObjectCache`]: Typed cache of config objects and their references
//! - [`ReactionMap`]: Validated table of which types react to which changes
//! - [`DependencyTracker`]: Walks the reference graph and invokes handlers
//! - [`ResyncCoordinator`]: Full reload of the cache from the store
//! - [`ChangeNotificationConsumer`]: Drives the engine from a change queue
//!
//! # Architecture
//!
//! 1. Config changes are written to the store and announced on the bus
//! 2. The consumer subscribes to the bus, then lists the store (resync)
//! 3. Every change updates the cache and starts one propagation pass
//! 4. The pass follows the reaction map across references and evaluates
//!    each affected object at most once
//! 5. Handlers return derived state which is written back when it changed
//!
//! # Example
//!
//! ```ignore
//! use vnc_sync_common::{
//!     ChangeNotificationConsumer, ConsumerOptions, MemoryBus, MemoryStore, Reactions,
//!     SyncEngine, TypeSchema,
//! };
//!
//! let engine = SyncEngine::builder()
//!     .register_type(
//!         TypeSchema::new("virtual_network").with_refs("network_policy_refs", "network_policy"),
//!         Reactions::new().on_relation("network_policy_refs", ["network_policy"]),
//!         Arc::new(VirtualNetworkHandler::default()),
//!     )
//!     // ... more types
//!     .build()?;
//!
//! let mut consumer = ChangeNotificationConsumer::new(
//!     engine,
//!     Arc::new(MemoryStore::new()),
//!     Box::new(MemoryBus::new()),
//!     ConsumerOptions::default(),
//! );
//! consumer.run(shutdown).await;
//! ```

mod bus;
mod cache;
mod config;
mod consumer;
mod engine;
mod error;
mod event;
mod handler;
mod memory;
mod pending;
mod reaction;
#[cfg(feature = "redis")]
mod redis_backend;
mod resync;
mod retry;
mod schema;
mod store;
mod tracker;
mod types;

pub use bus::{Delivery, NotificationBus};
pub use cache::{CachedObject, ObjectCache, ObjectSummary};
pub use config::{BusConfig, DatabaseConfig, EngineConfig, LoggingConfig, SyncConfig};
pub use consumer::{
    ChangeNotificationConsumer, ConsumerOptions, ConsumerState, ConsumerStats, DeliveryOutcome,
};
pub use engine::{
    AllPartitions, PartitionOwner, SyncEngine, SyncEngineBuilder, TrackerOptions,
    TypeRegistration, TypeRegistry, DEFAULT_PRIORITY,
};
pub use error::{SyncError, SyncResult};
pub use event::{ChangeEvent, Operation};
pub use handler::{EvalContext, EvalError, EvalOutcome, EvalResult, ObjectHandler};
pub use memory::{ListHook, MemoryBus, MemoryStore};
pub use pending::PendingRefs;
pub use reaction::{ReactionMap, Reactions};
#[cfg(feature = "redis")]
pub use redis_backend::{RedisBus, RedisConfig, RedisDb, RedisStore, DERIVED_SUFFIX};
pub use resync::{ResyncCoordinator, ResyncReport};
pub use retry::RetryPolicy;
pub use schema::{RefArity, RefField, RefValue, References, TypeSchema};
pub use store::ConfigStore;
pub use tracker::{DependencyTracker, PassReport, PropagationPass};
pub use types::{ObjectId, ObjectKey, ObjectType, PropertyBag, SELF_RELATION};
