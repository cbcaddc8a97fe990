//! Backing config store interface.

use crate::error::SyncResult;
use crate::types::{ObjectId, PropertyBag};
use async_trait::async_trait;

/// The shared configuration store the cache mirrors.
///
/// `read` returns [`SyncError::NotFound`] for a missing object; IO failures
/// are `SyncError::Store` or `SyncError::Timeout`.
///
/// [`SyncError::NotFound`]: crate::SyncError::NotFound
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Establishes the connection.
    async fn connect(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Lists every object of a type as `(id, raw)` pairs.
    async fn list(&self, obj_type: &str) -> SyncResult<Vec<(ObjectId, PropertyBag)>>;

    /// Lists the derived state last written for every object of a type.
    async fn list_derived(&self, obj_type: &str) -> SyncResult<Vec<(ObjectId, PropertyBag)>>;

    /// Reads one object.
    async fn read(&self, obj_type: &str, id: &str) -> SyncResult<PropertyBag>;

    /// Writes the derived state of one object.
    async fn write(&self, obj_type: &str, id: &str, derived: &PropertyBag) -> SyncResult<()>;
}
