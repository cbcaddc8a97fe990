//! Change events carried by the notification bus.
//!
//! Wire format is one JSON object per message:
//!
//! ```json
//! {"oper": "UPDATE", "type": "routing_instance", "uuid": "ri-1", "obj_dict": {..}}
//! ```
//!
//! `obj_dict` is optional. Without it, CREATE and UPDATE are resolved by a
//! store read.

use crate::error::{SyncError, SyncResult};
use crate::types::{ObjectId, ObjectKey, ObjectType, PropertyBag};
use serde::{Deserialize, Serialize};

/// Change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Object created.
    Create,
    /// Object changed.
    Update,
    /// Object removed.
    Delete,
}

impl Operation {
    /// Returns true for CREATE and UPDATE.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Operation::Create | Operation::Update)
    }

    /// Returns true for DELETE.
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// One decoded change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The operation.
    #[serde(rename = "oper")]
    pub operation: Operation,
    /// Type of the changed object.
    #[serde(rename = "type")]
    pub obj_type: ObjectType,
    /// Id of the changed object.
    #[serde(rename = "uuid")]
    pub id: ObjectId,
    /// Changed fields, if carried by the message.
    #[serde(rename = "obj_dict", default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<PropertyBag>,
}

impl ChangeEvent {
    /// Creates a new event.
    pub fn new(
        operation: Operation,
        obj_type: impl Into<ObjectType>,
        id: impl Into<ObjectId>,
        raw: Option<PropertyBag>,
    ) -> Self {
        Self {
            operation,
            obj_type: obj_type.into(),
            id: id.into(),
            raw,
        }
    }

    /// Creates a CREATE event carrying the full body.
    pub fn create(obj_type: impl Into<ObjectType>, id: impl Into<ObjectId>, raw: PropertyBag) -> Self {
        Self::new(Operation::Create, obj_type, id, Some(raw))
    }

    /// Creates an UPDATE event carrying the changed fields.
    pub fn update(obj_type: impl Into<ObjectType>, id: impl Into<ObjectId>, raw: PropertyBag) -> Self {
        Self::new(Operation::Update, obj_type, id, Some(raw))
    }

    /// Creates an UPDATE event without a body.
    pub fn touch(obj_type: impl Into<ObjectType>, id: impl Into<ObjectId>) -> Self {
        Self::new(Operation::Update, obj_type, id, None)
    }

    /// Creates a DELETE event.
    pub fn delete(obj_type: impl Into<ObjectType>, id: impl Into<ObjectId>) -> Self {
        Self::new(Operation::Delete, obj_type, id, None)
    }

    /// Returns the `(type, id)` key of the changed object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.obj_type.clone(), self.id.clone())
    }

    /// Decodes an event from its JSON wire form.
    pub fn decode(payload: &str) -> SyncResult<Self> {
        let event: ChangeEvent =
            serde_json::from_str(payload).map_err(|e| SyncError::decode(e.to_string()))?;
        if event.obj_type.is_empty() {
            return Err(SyncError::decode("empty object type"));
        }
        if event.id.is_empty() {
            return Err(SyncError::decode("empty object id"));
        }
        Ok(event)
    }

    /// Encodes this event to its JSON wire form.
    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::internal(format!("encode event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_update() {
        let event = ChangeEvent::decode(
            r#"{"oper": "UPDATE", "type": "routing_instance", "uuid": "ri-1",
                "obj_dict": {"route_target_refs": [{"uuid": "rt-1"}]}}"#,
        )
        .unwrap();

        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.key(), ObjectKey::new("routing_instance", "ri-1"));
        let raw = event.raw.unwrap();
        assert_eq!(raw["route_target_refs"], json!([{"uuid": "rt-1"}]));
    }

    #[test]
    fn test_decode_delete_without_body() {
        let event = ChangeEvent::decode(r#"{"oper": "DELETE", "type": "route_target", "uuid": "rt-1"}"#)
            .unwrap();
        assert!(event.operation.is_delete());
        assert!(event.raw.is_none());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for payload in [
            "not json",
            r#"{"oper": "RENAME", "type": "route_target", "uuid": "rt-1"}"#,
            r#"{"oper": "CREATE", "uuid": "rt-1"}"#,
            r#"{"oper": "CREATE", "type": "", "uuid": "rt-1"}"#,
            r#"{"oper": "CREATE", "type": "route_target", "uuid": ""}"#,
            r#"{"oper": "CREATE", "type": "route_target", "uuid": "rt-1", "obj_dict": [1]}"#,
        ] {
            let err = ChangeEvent::decode(payload).unwrap_err();
            assert!(matches!(err, SyncError::Decode { .. }), "{payload}");
        }
    }

    #[test]
    fn test_encode_omits_missing_body() {
        let payload = ChangeEvent::delete("route_target", "rt-1").encode().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&payload).unwrap(),
            json!({"oper": "DELETE", "type": "route_target", "uuid": "rt-1"})
        );
    }
}
