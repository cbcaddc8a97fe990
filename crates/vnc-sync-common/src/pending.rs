//! Referrers waiting on referents that were not yet in the cache.
//!
//! When a walk reaches a reference whose target could not be resolved, the
//! referrer is recorded against the missing referent. Once the referent
//! arrives, `satisfy` hands back the referrers to evaluate.

use crate::types::ObjectKey;
use std::collections::{BTreeSet, HashMap};

/// Reverse index of unresolved references.
#[derive(Debug, Default)]
pub struct PendingRefs {
    /// Missing referent -> referrers waiting on it
    waiters: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
    /// Referrer -> referents it waits on
    waiting_on: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl PendingRefs {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `referrer` could not resolve `referent`.
    pub fn add(&mut self, referrer: ObjectKey, referent: ObjectKey) {
        self.waiting_on
            .entry(referrer.clone())
            .or_default()
            .insert(referent.clone());
        self.waiters.entry(referent).or_default().insert(referrer);
    }

    /// Marks `referent` as present and returns the referrers waiting on it.
    pub fn satisfy(&mut self, referent: &ObjectKey) -> Vec<ObjectKey> {
        let Some(referrers) = self.waiters.remove(referent) else {
            return Vec::new();
        };
        for referrer in &referrers {
            if let Some(targets) = self.waiting_on.get_mut(referrer) {
                targets.remove(referent);
                if targets.is_empty() {
                    self.waiting_on.remove(referrer);
                }
            }
        }
        referrers.into_iter().collect()
    }

    /// Drops every entry where `key` is the referrer or the referent.
    pub fn forget(&mut self, key: &ObjectKey) {
        if let Some(targets) = self.waiting_on.remove(key) {
            for target in targets {
                if let Some(referrers) = self.waiters.get_mut(&target) {
                    referrers.remove(key);
                    if referrers.is_empty() {
                        self.waiters.remove(&target);
                    }
                }
            }
        }
        if let Some(referrers) = self.waiters.remove(key) {
            for referrer in referrers {
                if let Some(targets) = self.waiting_on.get_mut(&referrer) {
                    targets.remove(key);
                    if targets.is_empty() {
                        self.waiting_on.remove(&referrer);
                    }
                }
            }
        }
    }

    /// Stops `referrer` waiting on the referents for which `keep` is false.
    pub fn retain_referents<F>(&mut self, referrer: &ObjectKey, mut keep: F)
    where
        F: FnMut(&ObjectKey) -> bool,
    {
        let Some(targets) = self.waiting_on.get_mut(referrer) else {
            return;
        };
        let dropped: Vec<ObjectKey> = targets.iter().filter(|t| !keep(t)).cloned().collect();
        for target in &dropped {
            targets.remove(target);
            if let Some(referrers) = self.waiters.get_mut(target) {
                referrers.remove(referrer);
                if referrers.is_empty() {
                    self.waiters.remove(target);
                }
            }
        }
        if targets.is_empty() {
            self.waiting_on.remove(referrer);
        }
    }

    /// Returns the referents `referrer` waits on.
    pub fn waiting_on(&self, referrer: &ObjectKey) -> Option<&BTreeSet<ObjectKey>> {
        self.waiting_on.get(referrer)
    }

    /// Returns true if some referrer waits on `referent`.
    pub fn is_awaited(&self, referent: &ObjectKey) -> bool {
        self.waiters.contains_key(referent)
    }

    /// Returns the number of missing referents.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Clears the index.
    pub fn clear(&mut self) {
        self.waiters.clear();
        self.waiting_on.clear();
    }
}
