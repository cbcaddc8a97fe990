//! Per-type reference schema.
//!
//! Every registered type declares its reference fields up front, together
//! with the type they point at and whether they hold one id or a list.
//! Reference values are then read from the raw object body by field name,
//! with no guessing about singular or plural attribute names.

use crate::types::{ObjectId, ObjectType, PropertyBag};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Number of ids a reference field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefArity {
    /// At most one referent (e.g. `parent_uuid`).
    Single,
    /// Zero or more referents (e.g. `route_target_refs`).
    List,
}

/// A declared reference field of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefField {
    /// Field name in the raw object body.
    pub name: String,
    /// Type of the referenced objects.
    pub target: ObjectType,
    /// Single or list.
    pub arity: RefArity,
}

/// Resolved value of one reference field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RefValue {
    /// Single reference.
    Single(ObjectId),
    /// List of references, in body order without duplicates.
    List(Vec<ObjectId>),
}

impl RefValue {
    /// Returns the referenced ids.
    pub fn ids(&self) -> &[ObjectId] {
        match self {
            RefValue::Single(id) => std::slice::from_ref(id),
            RefValue::List(ids) => ids,
        }
    }

    /// Returns true if `id` is referenced.
    pub fn contains(&self, id: &str) -> bool {
        self.ids().iter().any(|i| i == id)
    }

    /// Returns the ids referenced by `self` but not by `other`.
    pub fn dropped_since(&self, other: Option<&RefValue>) -> Vec<ObjectId> {
        self.ids()
            .iter()
            .filter(|id| !other.is_some_and(|o| o.contains(id)))
            .cloned()
            .collect()
    }
}

/// Reference fields resolved from one object body, keyed by field name.
pub type References = BTreeMap<String, RefValue>;

/// Reference schema of one object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    name: ObjectType,
    refs: Vec<RefField>,
}

impl TypeSchema {
    /// Creates a schema with no reference fields.
    pub fn new(name: impl Into<ObjectType>) -> Self {
        Self {
            name: name.into(),
            refs: Vec::new(),
        }
    }

    /// Declares a single-valued reference field.
    pub fn with_ref(self, field: impl Into<String>, target: impl Into<ObjectType>) -> Self {
        self.with_field(field, target, RefArity::Single)
    }

    /// Declares a list-valued reference field.
    pub fn with_refs(self, field: impl Into<String>, target: impl Into<ObjectType>) -> Self {
        self.with_field(field, target, RefArity::List)
    }

    fn with_field(
        mut self,
        field: impl Into<String>,
        target: impl Into<ObjectType>,
        arity: RefArity,
    ) -> Self {
        self.refs.push(RefField {
            name: field.into(),
            target: target.into(),
            arity,
        });
        self
    }

    /// Returns the type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all declared reference fields.
    pub fn ref_fields(&self) -> &[RefField] {
        &self.refs
    }

    /// Returns the declared field with the given name.
    pub fn ref_field(&self, name: &str) -> Option<&RefField> {
        self.refs.iter().find(|f| f.name == name)
    }

    /// Returns the fields pointing at `target`.
    pub fn fields_targeting<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a RefField> {
        self.refs.iter().filter(move |f| f.target == target)
    }

    /// Resolves every declared reference field present in `raw`.
    ///
    /// Absent, null and empty fields are left out of the result.
    pub fn extract_refs(&self, raw: &PropertyBag) -> References {
        let mut refs = References::new();
        for field in &self.refs {
            if let Some(value) = raw.get(&field.name) {
                if let Some(resolved) = self.resolve_field(field, value) {
                    refs.insert(field.name.clone(), resolved);
                }
            }
        }
        refs
    }

    fn resolve_field(&self, field: &RefField, value: &Value) -> Option<RefValue> {
        match field.arity {
            RefArity::Single => {
                let id = match value {
                    Value::Array(items) => items.first().and_then(ref_id),
                    other => ref_id(other),
                };
                if id.is_none() && !value.is_null() {
                    debug!(
                        obj_type = %self.name,
                        field = %field.name,
                        "Ignoring malformed single reference"
                    );
                }
                id.map(RefValue::Single)
            }
            RefArity::List => {
                let mut ids: Vec<ObjectId> = Vec::new();
                let mut push = |id: ObjectId| {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                };
                match value {
                    Value::Array(items) => {
                        for item in items {
                            match ref_id(item) {
                                Some(id) => push(id),
                                None => debug!(
                                    obj_type = %self.name,
                                    field = %field.name,
                                    "Ignoring malformed list reference element"
                                ),
                            }
                        }
                    }
                    Value::Null => {}
                    other => {
                        if let Some(id) = ref_id(other) {
                            push(id);
                        }
                    }
                }
                if ids.is_empty() {
                    None
                } else {
                    Some(RefValue::List(ids))
                }
            }
        }
    }
}

/// Reads an id from a reference element.
///
/// Accepts a bare id string, `{"uuid": ".."}`, or `{"to": ..}` where `to`
/// is an fq-name string or list of name components.
fn ref_id(value: &Value) -> Option<ObjectId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => {
            if let Some(Value::String(uuid)) = map.get("uuid") {
                if !uuid.is_empty() {
                    return Some(uuid.clone());
                }
            }
            match map.get("to") {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Array(parts)) if !parts.is_empty() => {
                    let parts: Option<Vec<&str>> = parts.iter().map(Value::as_str).collect();
                    parts.map(|p| p.join(":"))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> PropertyBag {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn ri_schema() -> TypeSchema {
        TypeSchema::new("routing_instance")
            .with_refs("route_target_refs", "route_target")
            .with_ref("parent_uuid", "virtual_network")
    }

    #[test]
    fn test_extract_list_and_single() {
        let raw = bag(json!({
            "parent_uuid": "vn-1",
            "route_target_refs": [{"uuid": "rt-1"}, "rt-2", {"uuid": "rt-1"}],
            "display_name": "ri"
        }));

        let refs = ri_schema().extract_refs(&raw);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs["parent_uuid"], RefValue::Single("vn-1".to_string()));
        assert_eq!(
            refs["route_target_refs"],
            RefValue::List(vec!["rt-1".to_string(), "rt-2".to_string()])
        );
    }

    #[test]
    fn test_extract_fq_name_to() {
        let raw = bag(json!({
            "route_target_refs": [{"to": ["target:64512:1"]}, {"to": "target:64512:2"}]
        }));

        let refs = ri_schema().extract_refs(&raw);
        assert_eq!(
            refs["route_target_refs"].ids(),
            &["target:64512:1".to_string(), "target:64512:2".to_string()]
        );
    }

    #[test]
    fn test_extract_skips_empty_and_malformed() {
        let raw = bag(json!({
            "parent_uuid": null,
            "route_target_refs": [42, {"attr": {}}]
        }));

        assert!(ri_schema().extract_refs(&raw).is_empty());
    }

    #[test]
    fn test_fields_targeting() {
        let schema = TypeSchema::new("virtual_network")
            .with_refs("network_policy_refs", "network_policy")
            .with_refs("routing_instances", "routing_instance");

        let fields: Vec<_> = schema
            .fields_targeting("network_policy")
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(fields, vec!["network_policy_refs"]);
        assert!(schema.ref_field("routing_instances").is_some());
        assert!(schema.ref_field("route_table_refs").is_none());
    }

    #[test]
    fn test_dropped_since() {
        let before = RefValue::List(vec!["a".into(), "b".into(), "c".into()]);
        let after = RefValue::List(vec!["b".into()]);
        assert_eq!(before.dropped_since(Some(&after)), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(before.dropped_since(None).len(), 3);
    }
}
