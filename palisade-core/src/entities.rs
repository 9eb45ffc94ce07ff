/*
 * Copyright Palisade Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      https://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! This module contains the entity store and ancestor-hierarchy queries.

use crate::ast::{Entity, EntityUID};
use miette::Diagnostic;
use std::collections::{hash_map, HashMap, HashSet};
use thiserror::Error;

/// Represents an entity hierarchy, and allows looking up `Entity` objects by
/// UID.
///
/// Important internal invariant: for any `Entities` object that exists, the
/// `ancestor` relation is transitively closed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entities {
    entities: HashMap<EntityUID, Entity>,
}

impl Entities {
    /// Create a fresh `Entities` with no entities
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
        }
    }

    /// Get the `Entity` with the given UID, if any
    pub fn entity(&self, uid: &EntityUID) -> Option<&Entity> {
        self.entities.get(uid)
    }

    /// Iterate over the `Entity`s in the `Entities`
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// How many entities are in the store
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Is the store empty
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Is `child` a member of `ancestor` in this hierarchy (or equal to it)?
    ///
    /// `child` UIDs which don't exist in the store are not a member of
    /// anything (other than themselves).
    pub fn entity_in(&self, child: &EntityUID, ancestor: &EntityUID) -> bool {
        child == ancestor
            || self
                .entity(child)
                .is_some_and(|e| e.is_descendant_of(ancestor))
    }

    /// Create an `Entities` object with the given entities.
    ///
    /// The ancestor relation of the entities must be transitively closed;
    /// depending on `tc_computation`, this is assumed, enforced, or computed
    /// here.
    pub fn from_entities(
        entities: impl IntoIterator<Item = Entity>,
        tc_computation: TCComputation,
    ) -> Result<Self, EntitiesError> {
        let mut entity_map: HashMap<EntityUID, Entity> = HashMap::new();
        for entity in entities {
            match entity_map.entry(entity.uid().clone()) {
                hash_map::Entry::Occupied(_) => {
                    return Err(EntitiesError::Duplicate(entity.uid().clone()))
                }
                hash_map::Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(entity);
                }
            }
        }
        match tc_computation {
            TCComputation::AssumeAlreadyComputed => (),
            TCComputation::EnforceAlreadyComputed => enforce_tc(&entity_map)?,
            TCComputation::ComputeNow => compute_tc(&mut entity_map),
        };
        Ok(Self {
            entities: entity_map,
        })
    }
}

impl IntoIterator for Entities {
    type Item = Entity;
    type IntoIter = std::collections::hash_map::IntoValues<EntityUID, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_values()
    }
}

/// Compute the transitive closure of the ancestor relation in place.
///
/// Implemented as a worklist fixpoint over the UID adjacency sets rather than
/// a pointer-chasing graph walk, so stores whose ancestor relation contains
/// cycles still terminate.
fn compute_tc(entities: &mut HashMap<EntityUID, Entity>) {
    let mut changed = true;
    while changed {
        changed = false;
        let uids: Vec<EntityUID> = entities.keys().cloned().collect();
        for uid in uids {
            let Some(entity) = entities.get(&uid) else {
                continue;
            };
            let mut new_ancestors: HashSet<EntityUID> = HashSet::new();
            for parent in entity.ancestors() {
                if let Some(parent_entity) = entities.get(parent) {
                    for grandparent in parent_entity.ancestors() {
                        if !entity.is_descendant_of(grandparent) {
                            new_ancestors.insert(grandparent.clone());
                        }
                    }
                }
            }
            if !new_ancestors.is_empty() {
                changed = true;
                if let Some(entity) = entities.get_mut(&uid) {
                    for ancestor in new_ancestors {
                        entity.add_ancestor(ancestor);
                    }
                }
            }
        }
    }
}

/// Check that the ancestor relation is transitively closed, without modifying
/// anything.
fn enforce_tc(entities: &HashMap<EntityUID, Entity>) -> Result<(), EntitiesError> {
    for entity in entities.values() {
        for parent in entity.ancestors() {
            if let Some(parent_entity) = entities.get(parent) {
                for grandparent in parent_entity.ancestors() {
                    if !entity.is_descendant_of(grandparent) {
                        return Err(EntitiesError::TransitiveClosureViolation {
                            child: entity.uid().clone(),
                            parent: parent.clone(),
                            grandparent: grandparent.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Errors raised when constructing an `Entities`
#[derive(Debug, Clone, PartialEq, Eq, Diagnostic, Error)]
pub enum EntitiesError {
    /// The same entity UID appeared twice in the input
    #[error("duplicate entity entry `{0}`")]
    Duplicate(EntityUID),
    /// The ancestor relation was not transitively closed
    #[error("entity `{child}` has parent `{parent}` but is missing `{parent}`'s ancestor `{grandparent}`")]
    #[diagnostic(help("construct the store with `TCComputation::ComputeNow`"))]
    TransitiveClosureViolation {
        /// entity whose ancestor set is incomplete
        child: EntityUID,
        /// one of `child`'s declared parents
        parent: EntityUID,
        /// ancestor of `parent` missing from `child`'s ancestor set
        grandparent: EntityUID,
    },
}

/// Describes the option for how the TC (transitive closure) of the entity
/// hierarchy is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TCComputation {
    /// Assume that the TC has already been computed and that the input is a
    /// closed hierarchy. Bypasses the check entirely.
    AssumeAlreadyComputed,
    /// Enforce that the TC must have already been computed. If the given
    /// entities are not transitively closed, return an error.
    EnforceAlreadyComputed,
    /// Compute the TC here.
    ComputeNow,
}

/// The ancestor relation over action entities, as declared by a schema. This
/// is kept separate from the runtime entity store: `in` checks between action
/// UIDs are answered from the schema's action hierarchy, never from store
/// ancestors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionHierarchy {
    /// map from an action UID to all of its (transitive) ancestors
    ancestors: HashMap<EntityUID, HashSet<EntityUID>>,
}

impl ActionHierarchy {
    /// Construct an `ActionHierarchy` from (action, ancestors) pairs. The
    /// ancestor sets must already be transitively closed, which holds by
    /// construction for hierarchies derived from a validated schema.
    pub fn from_ancestor_sets(
        sets: impl IntoIterator<Item = (EntityUID, HashSet<EntityUID>)>,
    ) -> Self {
        Self {
            ancestors: sets.into_iter().collect(),
        }
    }

    /// Is `child` a member of `ancestor` (or equal to it) in the declared
    /// action hierarchy?
    pub fn action_in(&self, child: &EntityUID, ancestor: &EntityUID) -> bool {
        child == ancestor
            || self
                .ancestors
                .get(child)
                .is_some_and(|ancs| ancs.contains(ancestor))
    }

    /// Iterate over the actions in the hierarchy
    pub fn actions(&self) -> impl Iterator<Item = &EntityUID> {
        self.ancestors.keys()
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::ast::Entity;

    fn store_abc(tc: TCComputation) -> Result<Entities, EntitiesError> {
        // a -> b -> c, with only direct parents listed
        let a = Entity::new(
            EntityUID::with_eid("a"),
            [],
            [EntityUID::with_eid("b")],
            [],
        );
        let b = Entity::new(
            EntityUID::with_eid("b"),
            [],
            [EntityUID::with_eid("c")],
            [],
        );
        let c = Entity::with_uid(EntityUID::with_eid("c"));
        Entities::from_entities([a, b, c], tc)
    }

    #[test]
    fn compute_tc_closes_hierarchy() {
        let store = store_abc(TCComputation::ComputeNow).expect("should succeed");
        assert!(store.entity_in(&EntityUID::with_eid("a"), &EntityUID::with_eid("c")));
        assert!(store.entity_in(&EntityUID::with_eid("a"), &EntityUID::with_eid("b")));
        assert!(!store.entity_in(&EntityUID::with_eid("c"), &EntityUID::with_eid("a")));
    }

    #[test]
    fn enforce_tc_rejects_open_hierarchy() {
        assert!(matches!(
            store_abc(TCComputation::EnforceAlreadyComputed),
            Err(EntitiesError::TransitiveClosureViolation { .. })
        ));
    }

    #[test]
    fn cyclic_hierarchy_terminates() {
        let a = Entity::new(
            EntityUID::with_eid("a"),
            [],
            [EntityUID::with_eid("b")],
            [],
        );
        let b = Entity::new(
            EntityUID::with_eid("b"),
            [],
            [EntityUID::with_eid("a")],
            [],
        );
        let store = Entities::from_entities([a, b], TCComputation::ComputeNow)
            .expect("cycles must not prevent TC computation");
        assert!(store.entity_in(&EntityUID::with_eid("a"), &EntityUID::with_eid("b")));
        assert!(store.entity_in(&EntityUID::with_eid("b"), &EntityUID::with_eid("a")));
    }

    #[test]
    fn duplicate_uids_rejected() {
        let e1 = Entity::with_uid(EntityUID::with_eid("dup"));
        let e2 = Entity::with_uid(EntityUID::with_eid("dup"));
        assert!(matches!(
            Entities::from_entities([e1, e2], TCComputation::ComputeNow),
            Err(EntitiesError::Duplicate(_))
        ));
    }

    #[test]
    fn missing_entity_is_in_nothing_but_itself() {
        let store = Entities::new();
        let ghost = EntityUID::with_eid("ghost");
        assert!(store.entity_in(&ghost, &ghost));
        assert!(!store.entity_in(&ghost, &EntityUID::with_eid("other")));
    }
}
