//! Typed, keyed in-memory mirror of config objects.
//!
//! `ObjectCache` holds one map per registered type. It never creates entries
//! implicitly: `get()` returns `Option`, and only `locate(.., create = true)`,
//! `update()` and `replace()` insert.
//!
//! The cache is owned by the synchronization loop and mutated from there
//! only, so it carries no internal locking.

use crate::error::{SyncError, SyncResult};
use crate::schema::{References, TypeSchema};
use crate::types::{ObjectId, ObjectKey, ObjectType, PropertyBag};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// One cached config object.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    /// Object id, unique within its type.
    pub id: ObjectId,
    /// Object type.
    pub obj_type: ObjectType,
    /// Last known raw body.
    pub raw: PropertyBag,
    /// Reference fields resolved from `raw` through the type schema.
    pub references: References,
    /// Consumer-computed derived state.
    pub derived: PropertyBag,
}

impl CachedObject {
    fn new(schema: &TypeSchema, id: ObjectId, raw: PropertyBag) -> Self {
        let references = schema.extract_refs(&raw);
        Self {
            id,
            obj_type: schema.name().to_string(),
            raw,
            references,
            derived: PropertyBag::new(),
        }
    }

    /// Returns the `(type, id)` key of this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.obj_type.clone(), self.id.clone())
    }

    /// Returns the ids referenced through `field`, empty if absent.
    pub fn ref_ids(&self, field: &str) -> &[ObjectId] {
        self.references
            .get(field)
            .map(|r| r.ids())
            .unwrap_or_default()
    }

    /// Returns a raw property by name.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }
}

/// Serializable view of a cached object for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    /// Object type.
    #[serde(rename = "type")]
    pub obj_type: ObjectType,
    /// Object id.
    pub id: ObjectId,
    /// Resolved references.
    pub references: References,
    /// Derived state.
    pub derived: PropertyBag,
}

/// Per-consumer object cache.
#[derive(Debug, Default)]
pub struct ObjectCache {
    schemas: HashMap<ObjectType, TypeSchema>,
    objects: HashMap<ObjectType, BTreeMap<ObjectId, CachedObject>>,
}

impl ObjectCache {
    /// Creates an empty cache with no registered types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the schema of a type. Re-registering replaces the schema.
    pub fn register_schema(&mut self, schema: TypeSchema) {
        let name = schema.name().to_string();
        self.objects.entry(name.clone()).or_default();
        self.schemas.insert(name, schema);
    }

    /// Returns the schema of a registered type.
    pub fn schema(&self, obj_type: &str) -> Option<&TypeSchema> {
        self.schemas.get(obj_type)
    }

    /// Returns true if the type has a registered schema.
    pub fn is_registered(&self, obj_type: &str) -> bool {
        self.schemas.contains_key(obj_type)
    }

    /// Finds an object, optionally creating it from `raw`.
    ///
    /// An existing object is returned as is. A missing one is created only
    /// when `create` is set; the body defaults to empty.
    pub fn locate(
        &mut self,
        obj_type: &str,
        id: &str,
        create: bool,
        raw: Option<PropertyBag>,
    ) -> Option<&mut CachedObject> {
        let schema = self.schemas.get(obj_type)?;
        let objects = self.objects.entry(obj_type.to_string()).or_default();
        if !objects.contains_key(id) {
            if !create {
                return None;
            }
            debug!(obj_type, id, "Creating cache entry");
            let obj = CachedObject::new(schema, id.to_string(), raw.unwrap_or_default());
            objects.insert(id.to_string(), obj);
        }
        objects.get_mut(id)
    }

    /// Merges `raw` into the cached object, creating it if absent.
    ///
    /// Fields present in `raw` overwrite cached ones; a JSON `null` removes
    /// the field. Returns the names of reference fields whose resolved
    /// value changed. For a new object, every present reference field.
    pub fn update(
        &mut self,
        obj_type: &str,
        id: &str,
        raw: &PropertyBag,
    ) -> SyncResult<BTreeSet<String>> {
        self.apply(obj_type, id, |body| {
            for (name, value) in raw {
                if value.is_null() {
                    body.remove(name);
                } else {
                    body.insert(name.clone(), value.clone());
                }
            }
        })
    }

    /// Replaces the cached body with `raw` wholesale, creating if absent.
    ///
    /// Used by resync, where the store listing is authoritative. Returns
    /// changed reference fields like [`update`](Self::update).
    pub fn replace(
        &mut self,
        obj_type: &str,
        id: &str,
        raw: PropertyBag,
    ) -> SyncResult<BTreeSet<String>> {
        self.apply(obj_type, id, move |body| *body = raw)
    }

    fn apply<F>(&mut self, obj_type: &str, id: &str, mutate: F) -> SyncResult<BTreeSet<String>>
    where
        F: FnOnce(&mut PropertyBag),
    {
        let schema = self
            .schemas
            .get(obj_type)
            .ok_or_else(|| SyncError::internal(format!("type '{obj_type}' is not registered")))?;
        let objects = self.objects.entry(obj_type.to_string()).or_default();

        let previous = match objects.get_mut(id) {
            Some(obj) => std::mem::take(&mut obj.references),
            None => {
                debug!(obj_type, id, "Creating cache entry");
                let obj = CachedObject::new(schema, id.to_string(), PropertyBag::new());
                objects.insert(id.to_string(), obj);
                References::new()
            }
        };
        let obj = objects
            .get_mut(id)
            .ok_or_else(|| SyncError::internal(format!("cache entry {obj_type}:{id} vanished")))?;

        mutate(&mut obj.raw);
        obj.references = schema.extract_refs(&obj.raw);

        let changed = schema
            .ref_fields()
            .iter()
            .filter(|f| obj.references.get(&f.name) != previous.get(&f.name))
            .map(|f| f.name.clone())
            .collect();
        Ok(changed)
    }

    /// Removes an object and returns its last known snapshot.
    pub fn delete(&mut self, obj_type: &str, id: &str) -> Option<CachedObject> {
        self.objects.get_mut(obj_type)?.remove(id)
    }

    /// Returns the cached object, if any. Never creates entries.
    pub fn get(&self, obj_type: &str, id: &str) -> Option<&CachedObject> {
        self.objects.get(obj_type)?.get(id)
    }

    /// Returns true if the object is cached.
    pub fn contains(&self, obj_type: &str, id: &str) -> bool {
        self.get(obj_type, id).is_some()
    }

    /// Iterates all cached objects of a type in id order.
    pub fn list<'a>(&'a self, obj_type: &str) -> impl Iterator<Item = &'a CachedObject> + 'a {
        self.objects
            .get(obj_type)
            .into_iter()
            .flat_map(|objects| objects.values())
    }

    /// Returns the cached ids of a type in id order.
    pub fn ids(&self, obj_type: &str) -> Vec<ObjectId> {
        self.list(obj_type).map(|o| o.id.clone()).collect()
    }

    /// Returns the number of cached objects of a type.
    pub fn len(&self, obj_type: &str) -> usize {
        self.objects.get(obj_type).map(BTreeMap::len).unwrap_or(0)
    }

    /// Returns the number of cached objects across all types.
    pub fn total_len(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Stores derived state for an object.
    ///
    /// Returns true if the value changed. Missing objects are left alone.
    pub fn set_derived(&mut self, obj_type: &str, id: &str, derived: PropertyBag) -> bool {
        match self.objects.get_mut(obj_type).and_then(|m| m.get_mut(id)) {
            Some(obj) if obj.derived != derived => {
                obj.derived = derived;
                true
            }
            _ => false,
        }
    }

    /// Returns a serializable summary of one object.
    pub fn introspect(&self, obj_type: &str, id: &str) -> Option<ObjectSummary> {
        self.get(obj_type, id).map(|obj| ObjectSummary {
            obj_type: obj.obj_type.clone(),
            id: obj.id.clone(),
            references: obj.references.clone(),
            derived: obj.derived.clone(),
        })
    }

    /// Returns one line per cached object, sorted by type then id.
    pub fn dump(&self) -> Vec<String> {
        let mut types: Vec<&ObjectType> = self.objects.keys().collect();
        types.sort();

        let mut lines = Vec::new();
        for obj_type in types {
            for obj in self.list(obj_type) {
                let refs: Vec<String> = obj
                    .references
                    .iter()
                    .map(|(field, value)| format!("{field}={}", value.ids().join(",")))
                    .collect();
                lines.push(format!(
                    "{}:{} refs[{}] derived={}",
                    obj.obj_type,
                    obj.id,
                    refs.join(" "),
                    Value::Object(obj.derived.clone())
                ));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RefValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bag(value: Value) -> PropertyBag {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn cache() -> ObjectCache {
        let mut cache = ObjectCache::new();
        cache.register_schema(
            TypeSchema::new("routing_instance")
                .with_refs("route_target_refs", "route_target")
                .with_ref("parent_uuid", "virtual_network"),
        );
        cache.register_schema(TypeSchema::new("route_target"));
        cache
    }

    #[test]
    fn test_get_never_creates() {
        let mut cache = cache();
        assert!(cache.get("routing_instance", "ri-1").is_none());
        assert!(cache.locate("routing_instance", "ri-1", false, None).is_none());
        assert!(cache.is_empty());

        let obj = cache
            .locate(
                "routing_instance",
                "ri-1",
                true,
                Some(bag(json!({"parent_uuid": "vn-1"}))),
            )
            .unwrap();
        assert_eq!(obj.ref_ids("parent_uuid"), &["vn-1".to_string()]);
        assert_eq!(cache.len("routing_instance"), 1);
    }

    #[test]
    fn test_locate_unregistered_type() {
        let mut cache = cache();
        assert!(cache.locate("bgp_router", "r1", true, None).is_none());
        assert!(cache.update("bgp_router", "r1", &PropertyBag::new()).is_err());
    }

    #[test]
    fn test_update_creates_and_reports_changed_relations() {
        let mut cache = cache();
        let changed = cache
            .update(
                "routing_instance",
                "ri-1",
                &bag(json!({"route_target_refs": [{"uuid": "rt-1"}], "display_name": "ri"})),
            )
            .unwrap();
        assert_eq!(changed, BTreeSet::from(["route_target_refs".to_string()]));

        // Unrelated field change reports no relation change.
        let changed = cache
            .update("routing_instance", "ri-1", &bag(json!({"display_name": "ri-renamed"})))
            .unwrap();
        assert!(changed.is_empty());

        let obj = cache.get("routing_instance", "ri-1").unwrap();
        assert_eq!(obj.property("display_name"), Some(&json!("ri-renamed")));
        assert_eq!(obj.ref_ids("route_target_refs"), &["rt-1".to_string()]);
    }

    #[test]
    fn test_update_merges_and_null_removes() {
        let mut cache = cache();
        cache
            .update(
                "routing_instance",
                "ri-1",
                &bag(json!({"parent_uuid": "vn-1", "route_target_refs": ["rt-1"]})),
            )
            .unwrap();

        let changed = cache
            .update("routing_instance", "ri-1", &bag(json!({"route_target_refs": null})))
            .unwrap();
        assert_eq!(changed, BTreeSet::from(["route_target_refs".to_string()]));

        let obj = cache.get("routing_instance", "ri-1").unwrap();
        assert!(obj.ref_ids("route_target_refs").is_empty());
        assert_eq!(
            obj.references.get("parent_uuid"),
            Some(&RefValue::Single("vn-1".to_string()))
        );
    }

    #[test]
    fn test_replace_drops_missing_fields() {
        let mut cache = cache();
        cache
            .update(
                "routing_instance",
                "ri-1",
                &bag(json!({"parent_uuid": "vn-1", "display_name": "x"})),
            )
            .unwrap();

        let changed = cache
            .replace("routing_instance", "ri-1", bag(json!({"display_name": "y"})))
            .unwrap();
        assert_eq!(changed, BTreeSet::from(["parent_uuid".to_string()]));
        let obj = cache.get("routing_instance", "ri-1").unwrap();
        assert!(obj.references.is_empty());
        assert!(obj.property("parent_uuid").is_none());
    }

    #[test]
    fn test_update_keeps_derived_state() {
        let mut cache = cache();
        cache.update("route_target", "rt-1", &PropertyBag::new()).unwrap();
        assert!(cache.set_derived("route_target", "rt-1", bag(json!({"n": 1}))));
        assert!(!cache.set_derived("route_target", "rt-1", bag(json!({"n": 1}))));

        cache
            .update("route_target", "rt-1", &bag(json!({"display_name": "rt"})))
            .unwrap();
        assert_eq!(cache.get("route_target", "rt-1").unwrap().derived, bag(json!({"n": 1})));
    }

    #[test]
    fn test_delete_returns_snapshot() {
        let mut cache = cache();
        cache
            .update("routing_instance", "ri-1", &bag(json!({"parent_uuid": "vn-1"})))
            .unwrap();

        let snapshot = cache.delete("routing_instance", "ri-1").unwrap();
        assert_eq!(snapshot.ref_ids("parent_uuid"), &["vn-1".to_string()]);
        assert!(!cache.contains("routing_instance", "ri-1"));
        assert!(cache.delete("routing_instance", "ri-1").is_none());
    }

    #[test]
    fn test_list_in_id_order() {
        let mut cache = cache();
        for id in ["c", "a", "b"] {
            cache.update("route_target", id, &PropertyBag::new()).unwrap();
        }
        assert_eq!(cache.ids("route_target"), vec!["a", "b", "c"]);
        assert_eq!(cache.list("unknown").count(), 0);
    }

    #[test]
    fn test_introspect_and_dump() {
        let mut cache = cache();
        cache
            .update("routing_instance", "ri-1", &bag(json!({"route_target_refs": ["rt-1"]})))
            .unwrap();
        cache.update("route_target", "rt-1", &PropertyBag::new()).unwrap();

        let summary = cache.introspect("routing_instance", "ri-1").unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "routing_instance",
                "id": "ri-1",
                "references": {"route_target_refs": ["rt-1"]},
                "derived": {}
            })
        );

        assert_eq!(
            cache.dump(),
            vec![
                "route_target:rt-1 refs[] derived={}".to_string(),
                "routing_instance:ri-1 refs[route_target_refs=rt-1] derived={}".to_string(),
            ]
        );
    }
}
