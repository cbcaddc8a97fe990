//! Routing instance handling and route target auto-assignment

use super::{parse_route_target, publish_uve, ROUTE_TARGET};
use crate::error::{Result, SchemaTransformerError};
use crate::uve::UvePublisher;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vnc_sync_common::{
    CachedObject, EvalContext, EvalError, EvalResult, ObjectHandler, ObjectId, PropertyBag,
};

#[derive(Debug, Default)]
struct PoolState {
    by_owner: HashMap<ObjectId, u32>,
    owners: BTreeMap<u32, ObjectId>,
}

/// Pool of auto-assigned route target numbers in `start..end`.
///
/// Each routing instance owns at most one number; asking again for the
/// same owner returns the same number.
#[derive(Debug)]
pub struct RouteTargetAllocator {
    start: u32,
    end: u32,
    state: Mutex<PoolState>,
}

impl RouteTargetAllocator {
    /// Creates an empty pool.
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns the number owned by `owner`, assigning the lowest free one
    /// if it has none.
    pub fn allocate(&self, owner: &str) -> Result<u32> {
        let mut state = self.state.lock();
        if let Some(&n) = state.by_owner.get(owner) {
            return Ok(n);
        }

        // Find an unused value
        let free = (self.start..self.end).find(|n| !state.owners.contains_key(n));
        let Some(n) = free else {
            return Err(SchemaTransformerError::PoolExhausted {
                start: self.start,
                end: self.end,
            });
        };
        state.by_owner.insert(owner.to_string(), n);
        state.owners.insert(n, owner.to_string());
        Ok(n)
    }

    /// Claims `n` for `owner`.
    ///
    /// Returns false if `n` is outside the pool or owned by someone else.
    /// A number previously owned by `owner` is released.
    pub fn reserve(&self, owner: &str, n: u32) -> bool {
        if !(self.start..self.end).contains(&n) {
            return false;
        }
        let mut state = self.state.lock();
        match state.owners.get(&n) {
            Some(current) if current != owner => return false,
            Some(_) => return true,
            None => {}
        }
        if let Some(old) = state.by_owner.insert(owner.to_string(), n) {
            state.owners.remove(&old);
        }
        state.owners.insert(n, owner.to_string());
        true
    }

    /// Returns the number owned by `owner` to the pool.
    pub fn release(&self, owner: &str) -> Option<u32> {
        let mut state = self.state.lock();
        let n = state.by_owner.remove(owner)?;
        state.owners.remove(&n);
        Some(n)
    }

    /// Returns the number owned by `owner`.
    pub fn owned_by(&self, owner: &str) -> Option<u32> {
        self.state.lock().by_owner.get(owner).copied()
    }

    /// Returns the number of assigned values.
    pub fn in_use(&self) -> usize {
        self.state.lock().owners.len()
    }
}

/// Derives the route target list of routing instances.
pub struct RoutingInstanceHandler {
    autonomous_system: u32,
    allocator: Arc<RouteTargetAllocator>,
    uve: Arc<dyn UvePublisher>,
}

impl RoutingInstanceHandler {
    pub fn new(
        autonomous_system: u32,
        allocator: Arc<RouteTargetAllocator>,
        uve: Arc<dyn UvePublisher>,
    ) -> Self {
        Self {
            autonomous_system,
            allocator,
            uve,
        }
    }

    /// Number of the auto route target recorded in `derived`, if it was
    /// assigned under this autonomous system.
    fn recorded(&self, derived: &PropertyBag) -> Option<u32> {
        derived
            .get("route_target")
            .and_then(Value::as_str)
            .and_then(|name| parse_route_target(name).ok())
            .filter(|(asn, _)| *asn == self.autonomous_system)
            .map(|(_, n)| n)
    }

    /// Keeps the number recorded in the previous derived state if it is
    /// still available, else allocates one.
    fn assign(&self, obj: &CachedObject) -> Result<u32> {
        if let Some(n) = self.recorded(&obj.derived) {
            if self.allocator.reserve(&obj.id, n) {
                return Ok(n);
            }
            debug!(id = %obj.id, n, "Previous route target taken, reallocating");
        }
        self.allocator.allocate(&obj.id)
    }

    fn route_target_name(&self, n: u32) -> String {
        format!("target:{}:{}", self.autonomous_system, n)
    }
}

#[async_trait]
impl ObjectHandler for RoutingInstanceHandler {
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>> {
        let assigned = self.route_target_name(self.assign(obj).map_err(EvalError::from)?);

        // Referenced route targets by name, the auto-assigned one included.
        let mut targets: Vec<String> = obj
            .ref_ids("route_target_refs")
            .iter()
            .filter_map(|id| cx.cache.get(ROUTE_TARGET, id))
            .map(|rt| {
                rt.property("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| rt.id.clone())
            })
            .collect();
        targets.push(assigned.clone());
        targets.sort();
        targets.dedup();

        let derived = json!({
            "route_target": assigned,
            "route_target_list": targets,
            "virtual_network": obj.ref_ids("parent_uuid").first(),
        });
        let derived = derived.as_object().cloned().unwrap_or_default();

        publish_uve(self.uve.as_ref(), obj, &derived).await?;
        Ok(Some(derived))
    }

    fn on_restore(&self, obj: &CachedObject) {
        let Some(n) = self.recorded(&obj.derived) else {
            return;
        };
        if self.allocator.reserve(&obj.id, n) {
            debug!(id = %obj.id, n, "Reclaimed route target");
        } else {
            warn!(id = %obj.id, n, "Recorded route target unavailable");
        }
    }

    async fn on_delete(&self, snapshot: &CachedObject, _cx: EvalContext<'_>) -> EvalResult<()> {
        if let Some(n) = self.allocator.release(&snapshot.id) {
            info!(id = %snapshot.id, n, "Released route target");
        }
        Ok(())
    }
}
