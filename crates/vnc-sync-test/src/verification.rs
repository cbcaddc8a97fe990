//! Verification helpers for sync engine tests
//!
//! Provides assertion helpers over the in-memory store and the engine cache

use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use vnc_sync_common::{MemoryStore, ObjectCache, ObjectKey, SyncEngine};

/// Verification error types
#[derive(Error, Debug, PartialEq)]
pub enum VerificationError {
    #[error("Expected derived state for '{key}' not found in store")]
    DerivedMissing { key: ObjectKey },

    #[error("Unexpected derived state for '{key}' in store")]
    DerivedUnexpected { key: ObjectKey },

    #[error("Expected field '{field}' not found in derived state of '{key}'")]
    FieldNotFound { key: ObjectKey, field: String },

    #[error("Value mismatch for {key}.{field}: expected '{expected}', got '{actual}'")]
    ValueMismatch {
        key: ObjectKey,
        field: String,
        expected: Value,
        actual: Value,
    },

    #[error("Cache holds '{key}' which the store does not list")]
    StaleObject { key: ObjectKey },

    #[error("Store lists '{key}' which the cache does not hold")]
    MissingObject { key: ObjectKey },

    #[error("'{referrer}' references '{referent}' which is stored but not cached")]
    DanglingReference {
        referrer: ObjectKey,
        referent: ObjectKey,
    },

    #[error("Derived state of '{key}' differs between cache and store")]
    DerivedDiverged { key: ObjectKey },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Derived-state verification helper
pub struct StoreVerifier<'a> {
    store: &'a MemoryStore,
}

impl<'a> StoreVerifier<'a> {
    /// Create a new store verifier
    pub fn new(store: &'a MemoryStore) -> Self {
        Self { store }
    }

    /// Verify that derived state was written for an object
    pub fn assert_derived_exists(&self, obj_type: &str, id: &str) -> VerifyResult<()> {
        match self.store.derived(obj_type, id) {
            Some(_) => Ok(()),
            None => Err(VerificationError::DerivedMissing {
                key: ObjectKey::new(obj_type, id),
            }),
        }
    }

    /// Verify that no derived state was written for an object
    pub fn assert_no_derived(&self, obj_type: &str, id: &str) -> VerifyResult<()> {
        match self.store.derived(obj_type, id) {
            None => Ok(()),
            Some(_) => Err(VerificationError::DerivedUnexpected {
                key: ObjectKey::new(obj_type, id),
            }),
        }
    }

    /// Verify that a derived field has a specific value
    pub fn assert_derived_field(
        &self,
        obj_type: &str,
        id: &str,
        field: &str,
        expected: &Value,
    ) -> VerifyResult<()> {
        let key = ObjectKey::new(obj_type, id);
        let derived = self
            .store
            .derived(obj_type, id)
            .ok_or_else(|| VerificationError::DerivedMissing { key: key.clone() })?;

        match derived.get(field) {
            None => Err(VerificationError::FieldNotFound {
                key,
                field: field.to_string(),
            }),
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(VerificationError::ValueMismatch {
                key,
                field: field.to_string(),
                expected: expected.clone(),
                actual: actual.clone(),
            }),
        }
    }
}

/// Cache-against-store verification helper
pub struct CacheVerifier<'a> {
    engine: &'a SyncEngine,
    store: &'a MemoryStore,
}

impl<'a> CacheVerifier<'a> {
    /// Create a new cache verifier
    pub fn new(engine: &'a SyncEngine, store: &'a MemoryStore) -> Self {
        Self { engine, store }
    }

    fn cache(&self) -> &ObjectCache {
        self.engine.cache()
    }

    /// Verify the cache holds exactly the stored objects of every
    /// registered type
    pub fn assert_mirrors_store(&self) -> VerifyResult<()> {
        for obj_type in self.engine.registry().names() {
            let cached: BTreeSet<String> = self.cache().ids(&obj_type).into_iter().collect();
            let stored: BTreeSet<String> = self.store.ids(&obj_type).into_iter().collect();

            if let Some(stale) = cached.difference(&stored).next() {
                return Err(VerificationError::StaleObject {
                    key: ObjectKey::new(obj_type.clone(), stale.clone()),
                });
            }
            if let Some(missing) = stored.difference(&cached).next() {
                return Err(VerificationError::MissingObject {
                    key: ObjectKey::new(obj_type.clone(), missing.clone()),
                });
            }
        }
        Ok(())
    }

    /// Verify every cached reference whose referent is stored also
    /// resolves in the cache
    pub fn assert_no_dangling_refs(&self) -> VerifyResult<()> {
        for obj_type in self.engine.registry().names() {
            let Some(schema) = self.cache().schema(&obj_type) else {
                continue;
            };
            for obj in self.cache().list(&obj_type) {
                for (field, value) in &obj.references {
                    let Some(field) = schema.ref_field(field) else {
                        continue;
                    };
                    for id in value.ids() {
                        let stored = self.store.get(&field.target, id).is_some();
                        if stored && !self.cache().contains(&field.target, id) {
                            return Err(VerificationError::DanglingReference {
                                referrer: obj.key(),
                                referent: ObjectKey::new(field.target.clone(), id.clone()),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Verify the cached derived state of every object matches what was
    /// last written to the store
    pub fn assert_derived_persisted(&self) -> VerifyResult<()> {
        for obj_type in self.engine.registry().names() {
            for obj in self.cache().list(&obj_type) {
                let stored = self.store.derived(&obj_type, &obj.id).unwrap_or_default();
                if stored != obj.derived {
                    return Err(VerificationError::DerivedDiverged { key: obj.key() });
                }
            }
        }
        Ok(())
    }
}
