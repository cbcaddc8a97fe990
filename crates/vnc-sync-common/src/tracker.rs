//! Dependency propagation over the reaction map and live references.
//!
//! A [`PropagationPass`] scopes one walk: the visited set guarantees at most
//! one evaluation per `(type, id)` per pass, whatever cycles the reaction
//! map or the reference graph contain. The walk keeps an explicit stack and
//! checks the visited set when a frame is popped, which yields the same
//! depth-first order as the recursive formulation.
//!
//! Only the root of a walk is looked up under the relation that triggered
//! it. Every object reached from there is evaluated under `"self"`.
//!
//! Handler failures, unresolved referents and derived-state write failures
//! are logged with `(type, id)` and counted in the [`PassReport`]; they
//! never stop the walk over sibling branches.

use crate::cache::{CachedObject, ObjectCache};
use crate::engine::{PartitionOwner, TrackerOptions, TypeRegistry};
use crate::error::SyncError;
use crate::handler::{EvalContext, EvalError, EvalOutcome};
use crate::pending::PendingRefs;
use crate::reaction::ReactionMap;
use crate::schema::References;
use crate::store::ConfigStore;
use crate::types::{ObjectKey, PropertyBag, SELF_RELATION};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Counters collected over one propagation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Objects whose handler ran.
    pub evaluated: usize,
    /// Evaluations that changed derived state.
    pub updated: usize,
    /// Evaluations that left derived state as is.
    pub unchanged: usize,
    /// Re-entries suppressed by the visited set.
    pub suppressed: usize,
    /// Objects walked through but owned by another instance.
    pub skipped_not_owned: usize,
    /// Handlers reporting invalid config.
    pub invalid: usize,
    /// Handlers reporting transient failures.
    pub transient: usize,
    /// Handlers reporting downstream sink failures.
    pub downstream: usize,
    /// Referents that could not be resolved.
    pub unresolved: usize,
    /// Derived-state writes that failed.
    pub write_failures: usize,
    /// Objects removed from the cache.
    pub deleted: usize,
}

impl PassReport {
    /// Returns the number of handler failures of any kind.
    pub fn failed(&self) -> usize {
        self.invalid + self.transient + self.downstream
    }

    /// Adds another report's counters to this one.
    pub fn merge(&mut self, other: &PassReport) {
        self.evaluated += other.evaluated;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.suppressed += other.suppressed;
        self.skipped_not_owned += other.skipped_not_owned;
        self.invalid += other.invalid;
        self.transient += other.transient;
        self.downstream += other.downstream;
        self.unresolved += other.unresolved;
        self.write_failures += other.write_failures;
        self.deleted += other.deleted;
    }

    fn record(&mut self, outcome: EvalOutcome) {
        match outcome {
            EvalOutcome::Updated => self.updated += 1,
            EvalOutcome::Unchanged => self.unchanged += 1,
            EvalOutcome::SkippedNotOwned => self.skipped_not_owned += 1,
            EvalOutcome::InvalidConfig => self.invalid += 1,
            EvalOutcome::TransientFailure => self.transient += 1,
            EvalOutcome::DownstreamFailure => self.downstream += 1,
        }
    }
}

/// State of one propagation pass.
///
/// Created empty for each change event or resync cycle and consumed by
/// [`finish`](Self::finish), so no visited set outlives its pass.
#[derive(Debug, Default)]
pub struct PropagationPass {
    visited: HashSet<ObjectKey>,
    report: PassReport,
}

impl PropagationPass {
    /// Starts a pass with an empty visited set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` was already visited in this pass.
    pub fn is_visited(&self, key: &ObjectKey) -> bool {
        self.visited.contains(key)
    }

    /// Returns the number of visited objects.
    pub fn visited_len(&self) -> usize {
        self.visited.len()
    }

    /// Returns the counters so far.
    pub fn report(&self) -> &PassReport {
        &self.report
    }

    /// Returns the counters mutably.
    pub fn report_mut(&mut self) -> &mut PassReport {
        &mut self.report
    }

    /// Ends the pass and returns its counters.
    pub fn finish(self) -> PassReport {
        self.report
    }

    fn visit(&mut self, key: ObjectKey) -> bool {
        self.visited.insert(key)
    }
}

struct Frame {
    key: ObjectKey,
    relation: String,
}

/// Walks dependents of changed objects and invokes their handlers.
///
/// Borrows the engine state for the duration of one or more passes; see
/// [`SyncEngine::tracker`](crate::SyncEngine::tracker).
pub struct DependencyTracker<'a> {
    registry: &'a TypeRegistry,
    reactions: &'a ReactionMap,
    cache: &'a mut ObjectCache,
    pending: &'a mut PendingRefs,
    store: &'a dyn ConfigStore,
    options: TrackerOptions,
    partition: &'a dyn PartitionOwner,
}

impl<'a> DependencyTracker<'a> {
    pub(crate) fn new(
        registry: &'a TypeRegistry,
        reactions: &'a ReactionMap,
        cache: &'a mut ObjectCache,
        pending: &'a mut PendingRefs,
        store: &'a dyn ConfigStore,
        options: TrackerOptions,
        partition: &'a dyn PartitionOwner,
    ) -> Self {
        Self {
            registry,
            reactions,
            cache,
            pending,
            store,
            options,
            partition,
        }
    }

    /// Enables or disables reading missing referents from the store.
    pub fn with_store_fallback(mut self, enabled: bool) -> Self {
        self.options.resolve_missing_from_store = enabled;
        self
    }

    /// Returns the cache.
    pub fn cache(&self) -> &ObjectCache {
        &*self.cache
    }

    /// Returns the cache mutably.
    pub fn cache_mut(&mut self) -> &mut ObjectCache {
        &mut *self.cache
    }

    /// Returns the pending reference index mutably.
    pub fn pending_mut(&mut self) -> &mut PendingRefs {
        &mut *self.pending
    }

    /// Seeds the derived state of a cached object that has none yet and
    /// passes the object to its handler's `on_restore`.
    ///
    /// Returns false, leaving the cache untouched, if the object is not
    /// cached, `derived` is empty or the object already has derived state.
    pub fn restore(&mut self, obj_type: &str, id: &str, derived: PropertyBag) -> bool {
        let seedable = self
            .cache
            .get(obj_type, id)
            .is_some_and(|obj| obj.derived.is_empty());
        if !seedable || derived.is_empty() || !self.cache.set_derived(obj_type, id, derived) {
            return false;
        }
        if let (Some(registration), Some(obj)) =
            (self.registry.get(obj_type), self.cache.get(obj_type, id))
        {
            registration.handler.on_restore(obj);
        }
        true
    }

    /// Evaluates a cached object and walks its dependents.
    ///
    /// The object itself is looked up under `from_relation`; everything
    /// reached from it under `"self"`. An object absent from the cache is
    /// skipped.
    #[instrument(skip_all, fields(obj_type = %obj_type, id = %id))]
    pub async fn evaluate(
        &mut self,
        pass: &mut PropagationPass,
        obj_type: &str,
        id: &str,
        from_relation: &str,
    ) {
        if !self.cache.contains(obj_type, id) {
            debug!("Object not cached, nothing to evaluate");
            return;
        }
        let root = Frame {
            key: ObjectKey::new(obj_type, id),
            relation: from_relation.to_string(),
        };
        self.walk(pass, vec![root]).await;
    }

    /// Walks dependents reached from `references` as if `referrer` changed
    /// under `relation`. `referrer` itself is not evaluated.
    ///
    /// Used for referents that were dropped from an object, which are no
    /// longer reachable through its cached references.
    pub async fn propagate(
        &mut self,
        pass: &mut PropagationPass,
        referrer: &ObjectKey,
        references: &References,
        relation: &str,
    ) {
        let children = self.children(pass, referrer, references, relation).await;
        self.walk(pass, frames(children)).await;
    }

    /// Evaluates each of `keys` that is cached, in order.
    pub async fn evaluate_all(&mut self, pass: &mut PropagationPass, keys: Vec<ObjectKey>) {
        let keys: Vec<ObjectKey> = keys
            .into_iter()
            .filter(|k| self.cache.contains(&k.obj_type, &k.id))
            .collect();
        self.walk(pass, frames(keys)).await;
    }

    /// Removes an object from the cache and walks its dependents using the
    /// references it had just before removal.
    ///
    /// The handler's `on_delete` runs with the removed snapshot. Returns the
    /// snapshot, or `None` if the object was not cached.
    #[instrument(skip_all, fields(obj_type = %obj_type, id = %id))]
    pub async fn remove_and_propagate(
        &mut self,
        pass: &mut PropagationPass,
        obj_type: &str,
        id: &str,
    ) -> Option<CachedObject> {
        let snapshot = self.remove(pass, obj_type, id).await?;
        let key = snapshot.key();
        self.propagate(pass, &key, &snapshot.references, SELF_RELATION)
            .await;
        Some(snapshot)
    }

    /// Removes an object from the cache without walking its dependents.
    ///
    /// The removed key is marked visited so the rest of the pass neither
    /// evaluates nor re-reads it. `on_delete` runs with the snapshot.
    pub async fn remove(
        &mut self,
        pass: &mut PropagationPass,
        obj_type: &str,
        id: &str,
    ) -> Option<CachedObject> {
        let snapshot = self.cache.delete(obj_type, id)?;
        let key = snapshot.key();
        self.pending.forget(&key);
        pass.visit(key);
        pass.report.deleted += 1;
        debug!(obj_type, id, "Removed from cache");

        if let Some(registration) = self.registry.get(obj_type) {
            let cx = EvalContext::new(&*self.cache, self.store);
            if let Err(e) = registration.handler.on_delete(&snapshot, cx).await {
                log_eval_error(obj_type, id, "on_delete", &e);
                pass.report.record(e.to_outcome());
            }
        }
        Some(snapshot)
    }

    async fn walk(&mut self, pass: &mut PropagationPass, mut stack: Vec<Frame>) {
        // Frames are pushed in reverse so siblings pop in declaration order.
        stack.reverse();
        while let Some(frame) = stack.pop() {
            if pass.is_visited(&frame.key) {
                pass.report.suppressed += 1;
                continue;
            }
            if !self.cache.contains(&frame.key.obj_type, &frame.key.id) {
                continue;
            }
            pass.visit(frame.key.clone());

            self.evaluate_one(pass, &frame.key).await;

            let references = match self.cache.get(&frame.key.obj_type, &frame.key.id) {
                Some(obj) => obj.references.clone(),
                None => continue,
            };
            let children = self
                .children(pass, &frame.key, &references, &frame.relation)
                .await;
            stack.extend(frames(children).into_iter().rev());
        }
    }

    /// Resolves the dependents of `referrer` for `relation`.
    ///
    /// Referents missing from the cache are read from the store when
    /// enabled; unresolved ones are recorded as pending and skipped.
    async fn children(
        &mut self,
        pass: &mut PropagationPass,
        referrer: &ObjectKey,
        references: &References,
        relation: &str,
    ) -> Vec<ObjectKey> {
        let Some(schema) = self.cache.schema(&referrer.obj_type) else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for target in self.reactions.lookup(&referrer.obj_type, relation) {
            for field in schema.fields_targeting(target) {
                if let Some(value) = references.get(&field.name) {
                    for id in value.ids() {
                        candidates.push(ObjectKey::new(target.clone(), id.clone()));
                    }
                }
            }
        }

        let mut children = Vec::with_capacity(candidates.len());
        for key in candidates {
            if pass.is_visited(&key) || self.cache.contains(&key.obj_type, &key.id) {
                children.push(key);
            } else if self.resolve_missing(pass, referrer, &key).await {
                let waiters = self.pending.satisfy(&key);
                children.push(key);
                children.extend(waiters);
            }
        }
        children
    }

    async fn resolve_missing(
        &mut self,
        pass: &mut PropagationPass,
        referrer: &ObjectKey,
        referent: &ObjectKey,
    ) -> bool {
        if !self.options.resolve_missing_from_store {
            debug!(
                obj_type = %referent.obj_type,
                id = %referent.id,
                referrer = %referrer,
                "Referent not cached, skipping"
            );
            self.pending.add(referrer.clone(), referent.clone());
            pass.report.unresolved += 1;
            return false;
        }

        let store = self.store;
        let (obj_type, id) = (referent.obj_type.as_str(), referent.id.as_str());
        let result = self
            .options
            .retry
            .run("read", || store.read(obj_type, id))
            .await;

        match result {
            Ok(raw) => match self.cache.update(obj_type, id, &raw) {
                Ok(_) => {
                    debug!(obj_type, id, referrer = %referrer, "Resolved referent from store");
                    true
                }
                Err(e) => {
                    warn!(obj_type, id, error = %e, "Failed to cache resolved referent");
                    pass.report.unresolved += 1;
                    false
                }
            },
            Err(SyncError::NotFound { .. }) => {
                debug!(obj_type, id, referrer = %referrer, "Referent not in store yet");
                self.pending.add(referrer.clone(), referent.clone());
                pass.report.unresolved += 1;
                false
            }
            Err(e) => {
                warn!(
                    obj_type,
                    id,
                    referrer = %referrer,
                    error = %e,
                    "Failed to resolve referent, skipping branch"
                );
                self.pending.add(referrer.clone(), referent.clone());
                pass.report.unresolved += 1;
                false
            }
        }
    }

    async fn evaluate_one(&mut self, pass: &mut PropagationPass, key: &ObjectKey) {
        let (obj_type, id) = (key.obj_type.as_str(), key.id.as_str());
        let Some(registration) = self.registry.get(obj_type) else {
            return;
        };
        if !self.partition.owns(obj_type, id) {
            debug!(obj_type, id, "Not owned by this instance, walking through");
            pass.report.record(EvalOutcome::SkippedNotOwned);
            return;
        }
        let Some(obj) = self.cache.get(obj_type, id) else {
            return;
        };

        pass.report.evaluated += 1;
        let cx = EvalContext::new(&*self.cache, self.store);
        let result = registration.handler.on_evaluate(obj, cx).await;

        let outcome = match result {
            Ok(Some(derived)) => {
                let previous = obj.derived.clone();
                if self.cache.set_derived(obj_type, id, derived.clone()) {
                    if !self.write_derived(pass, obj_type, id, &derived).await {
                        // Keep the cache in step with the store so the next
                        // evaluation retries the write.
                        self.cache.set_derived(obj_type, id, previous);
                    }
                    EvalOutcome::Updated
                } else {
                    EvalOutcome::Unchanged
                }
            }
            Ok(None) => EvalOutcome::Unchanged,
            Err(e) => {
                log_eval_error(obj_type, id, "on_evaluate", &e);
                e.to_outcome()
            }
        };
        pass.report.record(outcome);
    }

    async fn write_derived(
        &mut self,
        pass: &mut PropagationPass,
        obj_type: &str,
        id: &str,
        derived: &PropertyBag,
    ) -> bool {
        let store = self.store;
        let result = self
            .options
            .retry
            .run("write", || store.write(obj_type, id, derived))
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(obj_type, id, error = %e, "Failed to write derived state");
                pass.report.write_failures += 1;
                false
            }
        }
    }
}

fn frames(keys: Vec<ObjectKey>) -> Vec<Frame> {
    keys.into_iter()
        .map(|key| Frame {
            key,
            relation: SELF_RELATION.to_string(),
        })
        .collect()
}

fn log_eval_error(obj_type: &str, id: &str, hook: &str, error: &EvalError) {
    match error {
        EvalError::Invalid { .. } => {
            warn!(obj_type, id, hook, error = %error, "Invalid config");
        }
        EvalError::Transient { .. } => {
            warn!(obj_type, id, hook, error = %error, "Transient failure, left for resync");
        }
        EvalError::Downstream { .. } => {
            warn!(obj_type, id, hook, error = %error, "Downstream sink failed");
        }
    }
}
