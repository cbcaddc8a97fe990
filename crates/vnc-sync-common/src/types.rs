//! Core identifiers shared by every engine component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a config resource kind (e.g. `routing_instance`).
pub type ObjectType = String;

/// UUID or fully-qualified-name string, unique within an [`ObjectType`].
pub type ObjectId = String;

/// Free-form property map of a config object.
///
/// Used both for the raw object body read from the backing store and for
/// the derived state computed by handlers.
pub type PropertyBag = serde_json::Map<String, serde_json::Value>;

/// Relation name under which a type's own change is looked up in the
/// reaction map.
pub const SELF_RELATION: &str = "self";

/// A `(type, id)` pair addressing one cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// The object type.
    pub obj_type: ObjectType,
    /// The object id within its type.
    pub id: ObjectId,
}

impl ObjectKey {
    /// Creates a new key.
    pub fn new(obj_type: impl Into<ObjectType>, id: impl Into<ObjectId>) -> Self {
        Self {
            obj_type: obj_type.into(),
            id: id.into(),
        }
    }

    /// Parses a key from a "type:id" string.
    ///
    /// Only the first ':' separates the type, so fq-name ids keep theirs.
    pub fn parse(s: &str) -> Option<Self> {
        let (obj_type, id) = s.split_once(':')?;
        if obj_type.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(obj_type, id))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.obj_type, self.id)
    }
}
