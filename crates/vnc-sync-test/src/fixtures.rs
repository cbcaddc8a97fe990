//! Test fixtures for config objects and reaction graphs
//!
//! Provides builders for object bodies and change events, plus reusable
//! engine layouts (reaction maps with their schemas) for propagation tests

use serde_json::{json, Value};
use std::sync::Arc;
use vnc_sync_common::{
    ChangeEvent, MemoryStore, ObjectHandler, ObjectKey, ObjectType, PropertyBag, Reactions,
    SyncEngineBuilder, TypeSchema,
};

/// Converts a JSON object literal into a property bag.
///
/// Anything other than an object yields an empty bag.
pub fn bag(value: Value) -> PropertyBag {
    match value {
        Value::Object(map) => map,
        _ => PropertyBag::new(),
    }
}

/// A config object as written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigObject {
    /// Object type (e.g., "routing_instance")
    pub obj_type: ObjectType,
    /// Object id
    pub id: String,
    /// Object body
    pub raw: PropertyBag,
}

impl ConfigObject {
    /// Create an object with an empty body
    pub fn new(obj_type: impl Into<ObjectType>, id: impl Into<String>) -> Self {
        Self {
            obj_type: obj_type.into(),
            id: id.into(),
            raw: PropertyBag::new(),
        }
    }

    /// Set a plain property
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw.insert(field.into(), value.into());
        self
    }

    /// Append a `{"uuid": id}` element to a list reference field
    pub fn with_ref(mut self, field: impl Into<String>, id: impl Into<String>) -> Self {
        let entry = self
            .raw
            .entry(field.into())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(json!({ "uuid": id.into() }));
        }
        self
    }

    /// Append several references to a list reference field
    pub fn with_refs<I, S>(self, field: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter().fold(self, |obj, id| obj.with_ref(field, id))
    }

    /// Set a single-valued reference field
    pub fn with_single_ref(mut self, field: impl Into<String>, id: impl Into<String>) -> Self {
        self.raw.insert(field.into(), Value::String(id.into()));
        self
    }

    /// Clear a reference field (sent as an empty list)
    pub fn without_refs(mut self, field: impl Into<String>) -> Self {
        self.raw.insert(field.into(), Value::Array(Vec::new()));
        self
    }

    /// Get the cache key
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.obj_type.clone(), self.id.clone())
    }

    /// CREATE event carrying the full body
    pub fn create(&self) -> ChangeEvent {
        ChangeEvent::create(self.obj_type.clone(), self.id.clone(), self.raw.clone())
    }

    /// UPDATE event carrying the full body
    pub fn update(&self) -> ChangeEvent {
        ChangeEvent::update(self.obj_type.clone(), self.id.clone(), self.raw.clone())
    }

    /// UPDATE event without a body
    pub fn touch(&self) -> ChangeEvent {
        ChangeEvent::touch(self.obj_type.clone(), self.id.clone())
    }

    /// DELETE event
    pub fn delete(&self) -> ChangeEvent {
        ChangeEvent::delete(self.obj_type.clone(), self.id.clone())
    }

    /// Write the object into a store
    pub fn store_in(&self, store: &MemoryStore) {
        store.put(&self.obj_type, &self.id, self.raw.clone());
    }
}

/// Reaction graph layouts
///
/// Each function registers its types with the given handler and returns the
/// builder, so a test can add options or a partition owner before building.
pub mod graphs {
    use super::*;

    /// Routing instance type
    pub const ROUTING_INSTANCE: &str = "routing_instance";
    /// Route target type
    pub const ROUTE_TARGET: &str = "route_target";
    /// Virtual network type
    pub const VIRTUAL_NETWORK: &str = "virtual_network";
    /// Network policy type
    pub const NETWORK_POLICY: &str = "network_policy";

    /// `routing_instance: self -> [route_target]`
    ///
    /// Routing instances reference route targets via `route_target_refs`;
    /// route targets carry the back refs and react to nothing.
    pub fn routing_instances(handler: Arc<dyn ObjectHandler>) -> SyncEngineBuilder {
        SyncEngineBuilder::new()
            .register_type(
                TypeSchema::new(ROUTING_INSTANCE).with_refs("route_target_refs", ROUTE_TARGET),
                Reactions::new().on_self([ROUTE_TARGET]),
                handler.clone(),
            )
            .register_type(
                TypeSchema::new(ROUTE_TARGET)
                    .with_refs("routing_instance_back_refs", ROUTING_INSTANCE),
                Reactions::new(),
                handler,
            )
    }

    /// `a: self -> [b]`, `b: self -> [a]`
    pub fn cyclic_pair(handler: Arc<dyn ObjectHandler>) -> SyncEngineBuilder {
        SyncEngineBuilder::new()
            .register_type(
                TypeSchema::new("a").with_refs("b_refs", "b"),
                Reactions::new().on_self(["b"]),
                handler.clone(),
            )
            .register_type(
                TypeSchema::new("b").with_refs("a_refs", "a"),
                Reactions::new().on_self(["a"]),
                handler,
            )
    }

    /// Each type references the next via `<next>_refs` and reacts to it
    /// under `self`; the last type points back at the first.
    pub fn ring(handler: Arc<dyn ObjectHandler>, types: &[&str]) -> SyncEngineBuilder {
        let mut builder = SyncEngineBuilder::new();
        for (i, obj_type) in types.iter().enumerate() {
            let next = types[(i + 1) % types.len()];
            builder = builder.register_type(
                TypeSchema::new(*obj_type).with_refs(format!("{next}_refs"), next),
                Reactions::new().on_self([next]),
                handler.clone(),
            );
        }
        builder
    }

    /// `c: self -> [d]` through `d_back_refs`; `d` references `c` via
    /// `c_refs` and reacts to nothing.
    pub fn back_refs(handler: Arc<dyn ObjectHandler>) -> SyncEngineBuilder {
        SyncEngineBuilder::new()
            .register_type(
                TypeSchema::new("c").with_refs("d_back_refs", "d"),
                Reactions::new().on_self(["d"]),
                handler.clone(),
            )
            .register_type(
                TypeSchema::new("d").with_refs("c_refs", "c"),
                Reactions::new(),
                handler,
            )
    }

    /// `virtual_network: network_policy_refs -> [network_policy]`
    ///
    /// Policies are re-evaluated only when a network's policy references
    /// change, not on other network updates.
    pub fn policy_attachment(handler: Arc<dyn ObjectHandler>) -> SyncEngineBuilder {
        SyncEngineBuilder::new()
            .register_type(
                TypeSchema::new(VIRTUAL_NETWORK).with_refs("network_policy_refs", NETWORK_POLICY),
                Reactions::new().on_relation("network_policy_refs", [NETWORK_POLICY]),
                handler.clone(),
            )
            .register_type(
                TypeSchema::new(NETWORK_POLICY)
                    .with_refs("virtual_network_back_refs", VIRTUAL_NETWORK),
                Reactions::new(),
                handler,
            )
    }
}

/// Common object fixtures for the routing instance graph
pub mod routing_fixtures {
    use super::graphs::{ROUTE_TARGET, ROUTING_INSTANCE};
    use super::*;

    /// Routing instance referencing the given route targets
    pub fn routing_instance<I, S>(id: &str, route_targets: I) -> ConfigObject
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConfigObject::new(ROUTING_INSTANCE, id)
            .with_field("display_name", id)
            .with_refs("route_target_refs", route_targets)
    }

    /// Route target named `target:64512:<n>`
    pub fn route_target(id: &str, n: u32) -> ConfigObject {
        ConfigObject::new(ROUTE_TARGET, id).with_field("display_name", format!("target:64512:{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_object_builder() {
        let obj = ConfigObject::new("routing_instance", "ri-1")
            .with_field("display_name", "ri")
            .with_refs("route_target_refs", ["rt-1", "rt-2"])
            .with_single_ref("parent_uuid", "vn-1");

        assert_eq!(
            Value::Object(obj.raw.clone()),
            json!({
                "display_name": "ri",
                "route_target_refs": [{"uuid": "rt-1"}, {"uuid": "rt-2"}],
                "parent_uuid": "vn-1"
            })
        );
        assert_eq!(obj.key(), ObjectKey::new("routing_instance", "ri-1"));
        assert!(obj.touch().raw.is_none());
        assert!(obj.delete().operation.is_delete());

        let cleared = obj.without_refs("route_target_refs");
        assert_eq!(cleared.raw["route_target_refs"], json!([]));
    }

    #[test]
    fn test_graphs_build() {
        struct Noop;

        #[async_trait::async_trait]
        impl ObjectHandler for Noop {
            async fn on_evaluate(
                &self,
                _obj: &vnc_sync_common::CachedObject,
                _cx: vnc_sync_common::EvalContext<'_>,
            ) -> vnc_sync_common::EvalResult<Option<PropertyBag>> {
                Ok(None)
            }
        }

        let handler: Arc<dyn ObjectHandler> = Arc::new(Noop);
        assert!(graphs::routing_instances(handler.clone()).build().is_ok());
        assert!(graphs::cyclic_pair(handler.clone()).build().is_ok());
        assert!(graphs::ring(handler.clone(), &["x", "y", "z"]).build().is_ok());
        assert!(graphs::back_refs(handler.clone()).build().is_ok());
        assert!(graphs::policy_attachment(handler).build().is_ok());
    }
}
