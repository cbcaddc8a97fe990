//! Static reaction map.
//!
//! Declares, per source type and relation, which types must be re-evaluated
//! when an object of the source type changes. The map is validated once
//! while the engine is built and never mutated afterwards.

use crate::error::{SyncError, SyncResult};
use crate::schema::TypeSchema;
use crate::types::{ObjectType, SELF_RELATION};
use std::collections::{BTreeMap, HashMap};

/// Reaction rules of one source type, keyed by relation.
///
/// ```
/// use vnc_sync_common::Reactions;
///
/// let rules = Reactions::new()
///     .on_self(["routing_instance", "network_policy"])
///     .on_relation("network_policy_refs", ["network_policy"]);
/// assert_eq!(rules.relations().count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reactions {
    rules: BTreeMap<String, Vec<ObjectType>>,
}

impl Reactions {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Types re-evaluated whenever the object itself changes.
    pub fn on_self<I, S>(self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObjectType>,
    {
        self.on_relation(SELF_RELATION, targets)
    }

    /// Types re-evaluated when the reference field `relation` changes.
    pub fn on_relation<I, S>(mut self, relation: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObjectType>,
    {
        let entry = self.rules.entry(relation.into()).or_default();
        for target in targets {
            let target = target.into();
            if !entry.contains(&target) {
                entry.push(target);
            }
        }
        self
    }

    /// Iterates `(relation, targets)` pairs.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &[ObjectType])> {
        self.rules.iter().map(|(r, t)| (r.as_str(), t.as_slice()))
    }

    /// Returns true if no rule is declared.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Validated, immutable reaction map.
#[derive(Debug, Clone, Default)]
pub struct ReactionMap {
    map: HashMap<ObjectType, BTreeMap<String, Vec<ObjectType>>>,
}

impl ReactionMap {
    /// Builds and validates the map.
    ///
    /// Fails with [`SyncError::InvalidReactionMap`] when a rule owner or a
    /// listed type is not registered, a relation is neither `"self"` nor a
    /// declared reference field, a listed type is not reachable through
    /// any reference field of the owner, or an owner is given twice.
    pub fn build<'a, 'b, S, R>(schemas: S, reactions: R) -> SyncResult<Self>
    where
        S: IntoIterator<Item = &'a TypeSchema>,
        R: IntoIterator<Item = (&'b str, &'b Reactions)>,
    {
        let schemas: HashMap<&str, &TypeSchema> =
            schemas.into_iter().map(|s| (s.name(), s)).collect();
        let mut map: HashMap<ObjectType, BTreeMap<String, Vec<ObjectType>>> = HashMap::new();

        for (owner, rules) in reactions {
            let schema = schemas.get(owner).ok_or_else(|| {
                SyncError::invalid_reaction_map(owner, "rules declared for an unregistered type")
            })?;
            if map.contains_key(owner) {
                return Err(SyncError::invalid_reaction_map(
                    owner,
                    "rules declared more than once",
                ));
            }

            let mut validated = BTreeMap::new();
            for (relation, targets) in rules.relations() {
                if relation != SELF_RELATION && schema.ref_field(relation).is_none() {
                    return Err(SyncError::invalid_reaction_map(
                        owner,
                        format!("unknown relation '{relation}'"),
                    ));
                }
                for target in targets {
                    if !schemas.contains_key(target.as_str()) {
                        return Err(SyncError::invalid_reaction_map(
                            owner,
                            format!("relation '{relation}' lists unknown type '{target}'"),
                        ));
                    }
                    if schema.fields_targeting(target).next().is_none() {
                        return Err(SyncError::invalid_reaction_map(
                            owner,
                            format!(
                                "relation '{relation}' lists '{target}' but no reference field targets it"
                            ),
                        ));
                    }
                }
                validated.insert(relation.to_string(), targets.to_vec());
            }
            map.insert(owner.to_string(), validated);
        }

        Ok(Self { map })
    }

    /// Returns the types to re-evaluate for `(obj_type, relation)`.
    ///
    /// Unknown pairs yield an empty list.
    pub fn lookup(&self, obj_type: &str, relation: &str) -> &[ObjectType] {
        self.map
            .get(obj_type)
            .and_then(|rules| rules.get(relation))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns true if any rule is keyed on `relation` for `obj_type`.
    pub fn has_relation(&self, obj_type: &str, relation: &str) -> bool {
        self.map
            .get(obj_type)
            .is_some_and(|rules| rules.contains_key(relation))
    }

    /// Returns the number of source types with rules.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the map has no rules.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
