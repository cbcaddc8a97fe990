//! Type registration and the engine that owns cache and reaction map.
//!
//! The hosting service registers each type it mirrors at startup, then
//! builds a [`SyncEngine`]. Building validates the reaction map; any error
//! there is fatal and the process must not start.
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use vnc_sync_common::{
//!     CachedObject, EvalContext, EvalResult, ObjectHandler, PropertyBag, Reactions,
//!     SyncEngine, TypeSchema,
//! };
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl ObjectHandler for Noop {
//!     async fn on_evaluate(
//!         &self,
//!         _obj: &CachedObject,
//!         _cx: EvalContext<'_>,
//!     ) -> EvalResult<Option<PropertyBag>> {
//!         Ok(None)
//!     }
//! }
//!
//! let engine = SyncEngine::builder()
//!     .register_type(
//!         TypeSchema::new("routing_instance").with_refs("route_target_refs", "route_target"),
//!         Reactions::new().on_self(["route_target"]),
//!         Arc::new(Noop),
//!     )
//!     .register_type(TypeSchema::new("route_target"), Reactions::new(), Arc::new(Noop))
//!     .build()
//!     .unwrap();
//! assert_eq!(engine.registry().len(), 2);
//! ```

use crate::cache::ObjectCache;
use crate::error::{SyncError, SyncResult};
use crate::handler::ObjectHandler;
use crate::pending::PendingRefs;
use crate::reaction::{ReactionMap, Reactions};
use crate::retry::RetryPolicy;
use crate::schema::TypeSchema;
use crate::store::ConfigStore;
use crate::tracker::{DependencyTracker, PassReport, PropagationPass};
use crate::types::{ObjectType, SELF_RELATION};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// Priority given by [`SyncEngineBuilder::register_type`].
pub const DEFAULT_PRIORITY: i32 = 10;

/// Decides which objects this instance evaluates.
///
/// With several instances of one consumer running, each owns a disjoint
/// partition. Ownership is negotiated outside the engine.
pub trait PartitionOwner: Send + Sync {
    /// Returns true if this instance evaluates `(obj_type, id)`.
    fn owns(&self, obj_type: &str, id: &str) -> bool;
}

/// Owns every object. Used when a single instance runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPartitions;

impl PartitionOwner for AllPartitions {
    fn owns(&self, _obj_type: &str, _id: &str) -> bool {
        true
    }
}

/// Tuning knobs for propagation passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    /// Read referents missing from the cache from the store.
    pub resolve_missing_from_store: bool,
    /// Retry policy for store reads and derived-state writes.
    pub retry: RetryPolicy,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            resolve_missing_from_store: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// One registered type.
pub struct TypeRegistration {
    /// Reference schema.
    pub schema: TypeSchema,
    /// Reaction rules with this type as source.
    pub reactions: Reactions,
    /// Evaluation hooks.
    pub handler: Arc<dyn ObjectHandler>,
    /// Resync order, lower first.
    pub priority: i32,
}

impl TypeRegistration {
    /// Returns the type name.
    pub fn name(&self) -> &str {
        self.schema.name()
    }
}

impl std::fmt::Debug for TypeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistration")
            .field("name", &self.schema.name())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Registered types in resync order: priority, then registration order.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<TypeRegistration>,
    index: HashMap<ObjectType, usize>,
}

impl TypeRegistry {
    fn new(mut types: Vec<TypeRegistration>) -> Self {
        // Stable sort keeps registration order among equal priorities.
        types.sort_by_key(|t| t.priority);
        let index = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name().to_string(), i))
            .collect();
        Self { types, index }
    }

    /// Returns the registration of a type.
    pub fn get(&self, obj_type: &str) -> Option<&TypeRegistration> {
        self.index.get(obj_type).map(|&i| &self.types[i])
    }

    /// Returns true if the type is registered.
    pub fn contains(&self, obj_type: &str) -> bool {
        self.index.contains_key(obj_type)
    }

    /// Iterates registrations in resync order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeRegistration> {
        self.types.iter()
    }

    /// Returns type names in resync order.
    pub fn names(&self) -> Vec<ObjectType> {
        self.types.iter().map(|t| t.name().to_string()).collect()
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Collects registrations and builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    registrations: Vec<TypeRegistration>,
    options: TrackerOptions,
    partition: Arc<dyn PartitionOwner>,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            options: TrackerOptions::default(),
            partition: Arc::new(AllPartitions),
        }
    }
}

impl SyncEngineBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type with [`DEFAULT_PRIORITY`].
    pub fn register_type(
        self,
        schema: TypeSchema,
        reactions: Reactions,
        handler: Arc<dyn ObjectHandler>,
    ) -> Self {
        self.register_type_with_priority(schema, reactions, handler, DEFAULT_PRIORITY)
    }

    /// Registers a type with an explicit resync priority (lower first).
    pub fn register_type_with_priority(
        mut self,
        schema: TypeSchema,
        reactions: Reactions,
        handler: Arc<dyn ObjectHandler>,
        priority: i32,
    ) -> Self {
        self.registrations.push(TypeRegistration {
            schema,
            reactions,
            handler,
            priority,
        });
        self
    }

    /// Sets propagation options.
    pub fn with_options(mut self, options: TrackerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the partition owner.
    pub fn with_partition(mut self, partition: Arc<dyn PartitionOwner>) -> Self {
        self.partition = partition;
        self
    }

    /// Validates the registrations and builds the engine.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let mut seen = HashSet::new();
        for reg in &self.registrations {
            if !seen.insert(reg.name()) {
                return Err(SyncError::invalid_reaction_map(
                    reg.name(),
                    "type registered more than once",
                ));
            }
        }

        let reactions = ReactionMap::build(
            self.registrations.iter().map(|r| &r.schema),
            self.registrations.iter().map(|r| (r.name(), &r.reactions)),
        )?;

        let mut cache = ObjectCache::new();
        for reg in &self.registrations {
            cache.register_schema(reg.schema.clone());
        }

        let registry = TypeRegistry::new(self.registrations);
        info!(
            types = registry.len(),
            order = ?registry.names(),
            "Sync engine built"
        );

        Ok(SyncEngine {
            registry,
            reactions,
            cache,
            pending: PendingRefs::new(),
            options: self.options,
            partition: self.partition,
        })
    }
}

/// The synchronization engine of one consumer instance.
///
/// Owns the object cache, the reaction map and the pending reference
/// index. All mutation goes through `&mut self`, so one engine serves one
/// synchronization loop.
pub struct SyncEngine {
    registry: TypeRegistry,
    reactions: ReactionMap,
    cache: ObjectCache,
    pending: PendingRefs,
    options: TrackerOptions,
    partition: Arc<dyn PartitionOwner>,
}

impl SyncEngine {
    /// Starts a builder.
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Returns the registered types.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Returns the reaction map.
    pub fn reactions(&self) -> &ReactionMap {
        &self.reactions
    }

    /// Returns the object cache.
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Returns the object cache mutably.
    pub fn cache_mut(&mut self) -> &mut ObjectCache {
        &mut self.cache
    }

    /// Returns the pending reference index.
    pub fn pending(&self) -> &PendingRefs {
        &self.pending
    }

    /// Returns the pending reference index mutably.
    pub fn pending_mut(&mut self) -> &mut PendingRefs {
        &mut self.pending
    }

    /// Returns the propagation options.
    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    /// Returns a tracker borrowing this engine's state.
    pub fn tracker<'a>(&'a mut self, store: &'a dyn ConfigStore) -> DependencyTracker<'a> {
        DependencyTracker::new(
            &self.registry,
            &self.reactions,
            &mut self.cache,
            &mut self.pending,
            store,
            self.options,
            self.partition.as_ref(),
        )
    }

    /// Runs one propagation pass rooted at a cached object.
    pub async fn evaluate(
        &mut self,
        store: &dyn ConfigStore,
        obj_type: &str,
        id: &str,
    ) -> PassReport {
        let mut pass = PropagationPass::new();
        self.tracker(store)
            .evaluate(&mut pass, obj_type, id, SELF_RELATION)
            .await;
        pass.finish()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("registry", &self.registry)
            .field("objects", &self.cache.total_len())
            .field("pending", &self.pending.len())
            .field("options", &self.options)
            .finish()
    }
}
