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

use crate::ast::{InvalidNameError, Name, StaticallyTyped, Type, Value};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::{BTreeMap, HashSet};

/// The name of an entity type, possibly namespace-qualified.
/// Clone is O(1).
#[derive(Serialize, Deserialize, Hash, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityType(Name);

/// Basename of all action entity types. An entity type is an action type iff
/// its basename is `Action`; the namespace distinguishes action groups.
pub(crate) const ACTION_ENTITY_TYPE: &str = "Action";

impl EntityType {
    /// Is this an action entity type?
    pub fn is_action(&self) -> bool {
        self.0.basename() == ACTION_ENTITY_TYPE
    }

    /// The name of this entity type
    pub fn name(&self) -> &Name {
        &self.0
    }
}

impl From<Name> for EntityType {
    fn from(n: Name) -> Self {
        Self(n)
    }
}

impl std::str::FromStr for EntityType {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for an entity. These represent entities in the AST.
#[derive(Hash, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityUID {
    /// Typename of the entity
    ty: EntityType,
    /// EID of the entity
    eid: SmolStr,
}

impl EntityUID {
    /// Create an `EntityUID` with the given type name and EID.
    pub fn from_components(ty: EntityType, eid: impl Into<SmolStr>) -> Self {
        Self {
            ty,
            eid: eid.into(),
        }
    }

    /// Create an `EntityUID` from a type name string and EID.
    /// Returns an error if the type name is not a valid identifier.
    pub fn with_eid_and_type(typename: &str, eid: impl Into<SmolStr>) -> Result<Self, InvalidNameError> {
        Ok(Self {
            ty: typename.parse()?,
            eid: eid.into(),
        })
    }

    /// Get the type component.
    pub fn entity_type(&self) -> &EntityType {
        &self.ty
    }

    /// Get the EID component.
    pub fn eid(&self) -> &SmolStr {
        &self.eid
    }

    /// Does this UID refer to an action entity?
    pub fn is_action(&self) -> bool {
        self.ty.is_action()
    }
}

impl StaticallyTyped for EntityUID {
    fn type_of(&self) -> Type {
        Type::Entity {
            ty: self.ty.clone(),
        }
    }
}

impl std::fmt::Display for EntityUID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::\"{}\"", self.ty, self.eid.escape_debug())
    }
}

#[cfg(test)]
impl EntityUID {
    /// Testing utility for a UID with a fixed entity type
    pub(crate) fn with_eid(eid: &str) -> Self {
        // PANIC SAFETY: `test_entity_type` is a valid identifier
        #[allow(clippy::unwrap_used)]
        Self::from_components("test_entity_type".parse().unwrap(), eid)
    }
}

/// Entity datatype: an entity UID together with its attribute values, its
/// ancestors in the entity hierarchy, and its tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// UID
    uid: EntityUID,
    /// Internal BTreeMap of attributes.
    attrs: BTreeMap<SmolStr, Value>,
    /// Set of ancestors of this `Entity` (i.e., all direct and transitive
    /// parents), as UIDs
    ancestors: HashSet<EntityUID>,
    /// Tags on this entity
    tags: BTreeMap<SmolStr, Value>,
}

impl Entity {
    /// Create a new `Entity` with this UID, attributes, ancestors, and tags.
    pub fn new(
        uid: EntityUID,
        attrs: impl IntoIterator<Item = (SmolStr, Value)>,
        ancestors: impl IntoIterator<Item = EntityUID>,
        tags: impl IntoIterator<Item = (SmolStr, Value)>,
    ) -> Self {
        Self {
            uid,
            attrs: attrs.into_iter().collect(),
            ancestors: ancestors.into_iter().collect(),
            tags: tags.into_iter().collect(),
        }
    }

    /// Create a new `Entity` with this UID, no attributes, no parents, and no
    /// tags.
    pub fn with_uid(uid: EntityUID) -> Self {
        Self {
            uid,
            attrs: BTreeMap::new(),
            ancestors: HashSet::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Get the UID of this entity
    pub fn uid(&self) -> &EntityUID {
        &self.uid
    }

    /// Get the value for the given attribute, or `None` if not present
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    /// Get the value for the given tag, or `None` if not present
    pub fn get_tag(&self, tag: &str) -> Option<&Value> {
        self.tags.get(tag)
    }

    /// Is this `Entity` a descendant of `e` in the entity hierarchy?
    pub fn is_descendant_of(&self, e: &EntityUID) -> bool {
        self.ancestors.contains(e)
    }

    /// Iterate over this entity's ancestors
    pub fn ancestors(&self) -> impl Iterator<Item = &EntityUID> {
        self.ancestors.iter()
    }

    /// Iterate over this entity's attributes
    pub fn attrs(&self) -> impl Iterator<Item = (&SmolStr, &Value)> {
        self.attrs.iter()
    }

    /// Iterate over this entity's tags
    pub fn tags(&self) -> impl Iterator<Item = (&SmolStr, &Value)> {
        self.tags.iter()
    }

    /// Mark this entity as a (direct or transitive) child of `parent`.
    /// Used when computing the transitive closure of an entity store.
    pub(crate) fn add_ancestor(&mut self, parent: EntityUID) {
        self.ancestors.insert(parent);
    }
}
