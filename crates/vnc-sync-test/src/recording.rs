//! Handler that records every call
//!
//! Derived state is a pure function of the object and the cache it was
//! evaluated against, so repeated passes over unchanged data are expected
//! to produce identical writes.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;
use vnc_sync_common::{
    CachedObject, EvalContext, EvalError, EvalResult, ObjectCache, ObjectHandler, ObjectKey,
    PropertyBag, References,
};

/// One `on_evaluate` call
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRecord {
    /// Evaluated object
    pub key: ObjectKey,
    /// References the object had when evaluated
    pub references: References,
    /// Referents present in the cache at that moment
    pub resolved: Vec<ObjectKey>,
}

/// Records evaluations and deletions; can be told to fail per object
#[derive(Debug, Default)]
pub struct RecordingHandler {
    evaluations: Mutex<Vec<EvalRecord>>,
    deletions: Mutex<Vec<CachedObject>>,
    failures: Mutex<HashMap<ObjectKey, EvalError>>,
}

impl RecordingHandler {
    /// Create a handler with empty logs
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every evaluation of one object fail with `error`
    pub fn fail(&self, obj_type: &str, id: &str, error: EvalError) {
        self.failures
            .lock()
            .insert(ObjectKey::new(obj_type, id), error);
    }

    /// Stop failing evaluations of one object
    pub fn heal(&self, obj_type: &str, id: &str) {
        self.failures.lock().remove(&ObjectKey::new(obj_type, id));
    }

    /// All evaluations in call order
    pub fn evaluations(&self) -> Vec<EvalRecord> {
        self.evaluations.lock().clone()
    }

    /// Evaluated keys in call order
    pub fn evaluated_keys(&self) -> Vec<ObjectKey> {
        self.evaluations.lock().iter().map(|r| r.key.clone()).collect()
    }

    /// Number of evaluations of one object
    pub fn count(&self, obj_type: &str, id: &str) -> usize {
        let key = ObjectKey::new(obj_type, id);
        self.evaluations
            .lock()
            .iter()
            .filter(|r| r.key == key)
            .count()
    }

    /// Number of evaluations of all objects
    pub fn total(&self) -> usize {
        self.evaluations.lock().len()
    }

    /// Most recent evaluation of one object
    pub fn last(&self, obj_type: &str, id: &str) -> Option<EvalRecord> {
        let key = ObjectKey::new(obj_type, id);
        self.evaluations
            .lock()
            .iter()
            .rev()
            .find(|r| r.key == key)
            .cloned()
    }

    /// Snapshots handed to `on_delete`, in call order
    pub fn deletions(&self) -> Vec<CachedObject> {
        self.deletions.lock().clone()
    }

    /// Forget all recorded calls (failures stay configured)
    pub fn clear(&self) {
        self.evaluations.lock().clear();
        self.deletions.lock().clear();
    }
}

/// Referents of `obj` present in `cache`, sorted
pub fn resolved_referents(obj: &CachedObject, cache: &ObjectCache) -> Vec<ObjectKey> {
    let Some(schema) = cache.schema(&obj.obj_type) else {
        return Vec::new();
    };
    let mut resolved: Vec<ObjectKey> = obj
        .references
        .iter()
        .filter_map(|(field, value)| Some((schema.ref_field(field)?, value)))
        .flat_map(|(field, value)| {
            value
                .ids()
                .iter()
                .map(|id| ObjectKey::new(field.target.clone(), id.clone()))
        })
        .filter(|key| cache.contains(&key.obj_type, &key.id))
        .collect();
    resolved.sort();
    resolved.dedup();
    resolved
}

/// Derived state computed by [`RecordingHandler`]
pub fn derive(obj: &CachedObject, resolved: &[ObjectKey]) -> PropertyBag {
    let references = serde_json::to_value(&obj.references).unwrap_or(Value::Null);
    let resolved: Vec<String> = resolved.iter().map(ObjectKey::to_string).collect();
    let mut derived = PropertyBag::new();
    derived.insert("references".to_string(), references);
    derived.insert("resolved".to_string(), json!(resolved));
    if let Some(name) = obj.property("display_name") {
        derived.insert("name".to_string(), name.clone());
    }
    derived
}

#[async_trait]
impl ObjectHandler for RecordingHandler {
    async fn on_evaluate(
        &self,
        obj: &CachedObject,
        cx: EvalContext<'_>,
    ) -> EvalResult<Option<PropertyBag>> {
        let resolved = resolved_referents(obj, cx.cache);
        let derived = derive(obj, &resolved);
        self.evaluations.lock().push(EvalRecord {
            key: obj.key(),
            references: obj.references.clone(),
            resolved,
        });

        if let Some(error) = self.failures.lock().get(&obj.key()) {
            debug!(obj_type = %obj.obj_type, id = %obj.id, error = %error, "Injected failure");
            return Err(error.clone());
        }
        Ok(Some(derived))
    }

    async fn on_delete(&self, snapshot: &CachedObject, _cx: EvalContext<'_>) -> EvalResult<()> {
        self.deletions.lock().push(snapshot.clone());
        Ok(())
    }
}
