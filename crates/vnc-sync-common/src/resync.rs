//! Full reload of the cache from the backing store.
//!
//! A resync lists every registered type, garbage-collects cache entries the
//! store no longer has, replaces the rest with the fresh bodies, restores
//! derived state written by an earlier run and then evaluates every object
//! in a single propagation pass. It is how the
//! consumer heals after missed notifications.

use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::store::ConfigStore;
use crate::tracker::{PassReport, PropagationPass};
use crate::types::{ObjectId, ObjectKey, ObjectType, PropertyBag, SELF_RELATION};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Summary of one resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Objects listed by the store.
    pub listed: usize,
    /// Stale cache entries removed.
    pub removed: usize,
    /// Objects whose derived state was reloaded from the store.
    pub restored: usize,
    /// Counters of the evaluation pass.
    pub pass: PassReport,
    /// Wall time spent.
    pub duration: Duration,
}

impl ResyncReport {
    /// Returns the number of handler calls made.
    pub fn evaluated(&self) -> usize {
        self.pass.evaluated
    }

    /// Returns the number of handler failures.
    pub fn failed(&self) -> usize {
        self.pass.failed()
    }
}

/// Drives full resyncs of a [`SyncEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResyncCoordinator {
    /// Yield to the runtime when this much time passed since the last
    /// yield during evaluation. `None` never yields.
    yield_interval: Option<Duration>,
}

impl ResyncCoordinator {
    /// Creates a coordinator that never yields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cooperative yield interval. Zero disables yielding.
    pub fn with_yield_interval(mut self, interval: Duration) -> Self {
        self.yield_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Rebuilds the cache from `store` and re-evaluates everything.
    ///
    /// Listing happens before any cache mutation, so a store failure leaves
    /// the cache as it was. The evaluation pass never reads from the store;
    /// a reference the listing does not satisfy is recorded as pending.
    #[instrument(skip_all)]
    pub async fn full_resync(
        &self,
        engine: &mut SyncEngine,
        store: &dyn ConfigStore,
    ) -> SyncResult<ResyncReport> {
        let started = Instant::now();
        let types = engine.registry().names();

        let mut listings: Vec<(ObjectType, Vec<(ObjectId, PropertyBag)>)> =
            Vec::with_capacity(types.len());
        let mut stored_derived: Vec<(ObjectType, Vec<(ObjectId, PropertyBag)>)> =
            Vec::with_capacity(types.len());
        for obj_type in &types {
            let objects = store.list(obj_type).await.map_err(|e| {
                warn!(obj_type = %obj_type, error = %e, "Resync listing failed");
                e
            })?;
            let derived = store.list_derived(obj_type).await.map_err(|e| {
                warn!(obj_type = %obj_type, error = %e, "Resync derived listing failed");
                e
            })?;
            listings.push((obj_type.clone(), objects));
            stored_derived.push((obj_type.clone(), derived));
        }

        let mut report = ResyncReport {
            listed: listings.iter().map(|(_, objects)| objects.len()).sum(),
            ..Default::default()
        };

        let mut pass = PropagationPass::new();
        engine.pending_mut().clear();
        {
            let mut tracker = engine.tracker(store).with_store_fallback(false);

            // Garbage-collect before anything is evaluated.
            for (obj_type, objects) in &listings {
                let fresh: HashSet<&str> = objects.iter().map(|(id, _)| id.as_str()).collect();
                let stale: Vec<ObjectId> = tracker
                    .cache()
                    .ids(obj_type)
                    .into_iter()
                    .filter(|id| !fresh.contains(id.as_str()))
                    .collect();
                for id in stale {
                    info!(obj_type = %obj_type, id = %id, "Removing stale object");
                    if tracker.remove(&mut pass, obj_type, &id).await.is_some() {
                        report.removed += 1;
                    }
                }
            }

            let mut order: Vec<ObjectKey> = Vec::with_capacity(report.listed);
            for (obj_type, objects) in listings {
                for (id, raw) in objects {
                    tracker.cache_mut().replace(&obj_type, &id, raw)?;
                    order.push(ObjectKey::new(obj_type.clone(), id));
                }
            }

            // Entries that lost their derived state (fresh process) take
            // back what the previous run wrote, before any handler runs.
            for (obj_type, derived) in stored_derived {
                for (id, bag) in derived {
                    if tracker.restore(&obj_type, &id, bag) {
                        report.restored += 1;
                    }
                }
            }

            let mut last_yield = Instant::now();
            for key in order {
                tracker
                    .evaluate(&mut pass, &key.obj_type, &key.id, SELF_RELATION)
                    .await;
                if let Some(interval) = self.yield_interval {
                    if last_yield.elapsed() >= interval {
                        tokio::task::yield_now().await;
                        last_yield = Instant::now();
                    }
                }
            }
        }

        report.pass = pass.finish();
        report.duration = started.elapsed();
        info!(
            listed = report.listed,
            removed = report.removed,
            restored = report.restored,
            evaluated = report.pass.evaluated,
            failed = report.failed(),
            unresolved = report.pass.unresolved,
            elapsed_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Resync complete"
        );
        Ok(report)
    }
}
