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

//! Defines the validator's view of a schema: declared entity types with their
//! attribute shapes, tags, and hierarchy, and declared actions with their
//! hierarchy and request environments.

use crate::ast::{EntityType, EntityUID, InvalidNameError};
use crate::entities::ActionHierarchy;
use crate::validator::types::{AttributeType, Attributes, OpenTag, RequestEnv, Type};
use miette::Diagnostic;
use serde::Deserialize;
use smol_str::SmolStr;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Errors raised when converting a [`SchemaFragment`] into a
/// [`ValidatorSchema`].
#[derive(Debug, Diagnostic, Error)]
pub enum SchemaError {
    /// The fragment was not valid JSON for the schema format
    #[error("failed to parse schema from JSON: {0}")]
    JsonDeserialization(#[from] serde_json::Error),

    /// A name in the fragment was not a valid identifier
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidName(#[from] InvalidNameError),

    /// An entity type was referenced but never declared
    #[error("undeclared entity type `{name}`")]
    UndeclaredEntityType {
        /// The undeclared entity type
        name: EntityType,
    },

    /// An action was referenced in a `memberOf` but never declared
    #[error("undeclared action `{uid}`")]
    UndeclaredAction {
        /// The undeclared action UID
        uid: EntityUID,
    },

    /// An entity type's shape or an action's context was not a record
    #[error("the `{kind}` of `{name}` must be a record")]
    NotARecord {
        /// "shape" or "context"
        kind: &'static str,
        /// The declaration at fault
        name: SmolStr,
    },
}

fn default_true() -> bool {
    true
}

/// A type as written in the JSON schema format.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TypeFragment {
    /// Boolean type
    Boolean,
    /// Long (integer) type
    Long,
    /// String type
    String,
    /// Entity reference type
    Entity {
        /// Name of the entity type
        name: SmolStr,
    },
    /// Set type
    Set {
        /// Element type of the set
        element: Box<TypeFragment>,
    },
    /// Record type
    Record {
        /// Attributes of the record
        attributes: BTreeMap<SmolStr, RecordAttrFragment>,
    },
    /// Extension type
    Extension {
        /// Name of the extension type
        name: SmolStr,
    },
}

/// A record attribute as written in the JSON schema format: a type plus an
/// optional `required` flag (defaulting to required).
#[derive(Debug, Clone, Deserialize)]
pub struct RecordAttrFragment {
    /// Type of the attribute
    #[serde(flatten)]
    pub ty: TypeFragment,
    /// Whether the attribute is required
    #[serde(default = "default_true")]
    pub required: bool,
}

/// An entity type declaration in the JSON schema format.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeFragment {
    /// Entity types this type may be a direct member of
    #[serde(default)]
    pub member_of_types: Vec<SmolStr>,
    /// Attribute shape; must be a `Record` fragment when present
    #[serde(default)]
    pub shape: Option<TypeFragment>,
    /// Declared tag type, if tags are allowed on this entity type
    #[serde(default)]
    pub tags: Option<TypeFragment>,
}

/// Reference to another action in an action's `memberOf` list.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRef {
    /// EID of the parent action
    pub id: SmolStr,
}

/// What an action applies to.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppliesTo {
    /// Principal types the action applies to
    #[serde(default)]
    pub principal_types: Vec<SmolStr>,
    /// Resource types the action applies to
    #[serde(default)]
    pub resource_types: Vec<SmolStr>,
    /// Context type; must be a `Record` fragment when present
    #[serde(default)]
    pub context: Option<TypeFragment>,
}

/// An action declaration in the JSON schema format.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionFragment {
    /// Parent actions
    #[serde(default)]
    pub member_of: Vec<ActionRef>,
    /// What the action applies to
    #[serde(default)]
    pub applies_to: Option<AppliesTo>,
}

/// A schema fragment as deserialized from JSON. This is the external
/// representation; convert with `TryInto<ValidatorSchema>`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchemaFragment {
    /// Declared entity types, keyed by type name
    #[serde(default)]
    pub entity_types: HashMap<SmolStr, EntityTypeFragment>,
    /// Declared actions, keyed by action EID
    #[serde(default)]
    pub actions: HashMap<SmolStr, ActionFragment>,
}

impl SchemaFragment {
    /// Deserialize a `SchemaFragment` from a JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, SchemaError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Contains entity type information for use by the validator.
#[derive(Debug, Clone)]
pub struct ValidatorEntityType {
    /// The name of the entity type.
    name: EntityType,
    /// The set of entity types that can be members of this entity type. When
    /// this is the full set of entity types that can be members either
    /// directly or transitively.
    descendants: HashSet<EntityType>,
    /// The attribute types for this entity type.
    attrs: Attributes,
    /// The declared tag type, if this entity type allows tags.
    tags: Option<Type>,
}

impl ValidatorEntityType {
    /// The name of this entity type
    pub fn name(&self) -> &EntityType {
        &self.name
    }

    /// Get the type of the attribute with the given name, if it exists
    pub fn attr(&self, attr: &str) -> Option<&AttributeType> {
        self.attrs.get_attr(attr)
    }

    /// Iterate over the names of this entity type's attributes
    pub fn attr_names(&self) -> impl Iterator<Item = &SmolStr> {
        self.attrs.keys()
    }

    /// The declared tag type, if any
    pub fn tag_type(&self) -> Option<&Type> {
        self.tags.as_ref()
    }

    /// Is `other` a descendant of this entity type?
    pub fn has_descendant_entity_type(&self, other: &EntityType) -> bool {
        self.descendants.contains(other)
    }
}

/// Contains information about actions used by the validator.
#[derive(Debug, Clone)]
pub struct ValidatorActionId {
    /// The name of the action.
    name: EntityUID,
    /// Principal entity types the action can be applied to.
    applies_to_principals: Vec<EntityType>,
    /// Resource entity types the action can be applied to.
    applies_to_resources: Vec<EntityType>,
    /// The set of actions that can be members of this action, directly or
    /// transitively.
    descendants: HashSet<EntityUID>,
    /// The set of actions this action is a member of, directly or
    /// transitively. (The inverse view of `descendants`, kept so the action
    /// hierarchy handed to the evaluator needs no extra pass.)
    ancestors: HashSet<EntityUID>,
    /// The context type for this action.
    context: Type,
}

impl ValidatorActionId {
    /// The UID of this action
    pub fn name(&self) -> &EntityUID {
        &self.name
    }

    /// Principal types this action applies to
    pub fn applies_to_principals(&self) -> impl Iterator<Item = &EntityType> {
        self.applies_to_principals.iter()
    }

    /// Resource types this action applies to
    pub fn applies_to_resources(&self) -> impl Iterator<Item = &EntityType> {
        self.applies_to_resources.iter()
    }

    /// Iterate over the actions that are descendants of this action
    pub fn descendants(&self) -> impl Iterator<Item = &EntityUID> {
        self.descendants.iter()
    }

    /// The context type for this action
    pub fn context(&self) -> &Type {
        &self.context
    }
}

/// The validator's view of a schema.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSchema {
    /// Map from entity type names to their type information.
    entity_types: HashMap<EntityType, ValidatorEntityType>,
    /// Map from action UIDs to their information.
    action_ids: HashMap<EntityUID, ValidatorActionId>,
}

impl ValidatorSchema {
    /// Construct a `ValidatorSchema` directly from a JSON value in the schema
    /// format.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, SchemaError> {
        SchemaFragment::from_json_value(value)?.try_into()
    }

    /// Lookup the `ValidatorEntityType` for an entity type name.
    pub fn get_entity_type(&self, ty: &EntityType) -> Option<&ValidatorEntityType> {
        self.entity_types.get(ty)
    }

    /// Lookup the `ValidatorActionId` for an action UID.
    pub fn get_action_id(&self, uid: &EntityUID) -> Option<&ValidatorActionId> {
        self.action_ids.get(uid)
    }

    /// Iterate over the declared entity types.
    pub fn entity_types(&self) -> impl Iterator<Item = &ValidatorEntityType> {
        self.entity_types.values()
    }

    /// Iterate over the declared actions.
    pub fn action_ids(&self) -> impl Iterator<Item = &ValidatorActionId> {
        self.action_ids.values()
    }

    /// All entity types that are `in` the given entity type, i.e., the type
    /// itself plus its declared descendants. Empty if the type is undeclared.
    pub fn get_entity_types_in<'a>(&'a self, ety: &'a EntityType) -> Vec<&'a EntityType> {
        self.get_entity_type(ety)
            .map(|vety| {
                vety.descendants
                    .iter()
                    .chain(std::iter::once(&vety.name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All actions that are `in` any of the given action UIDs: the UIDs
    /// themselves plus their declared descendants. `None` if any given UID is
    /// not a declared action.
    pub fn get_actions_in_set<'a>(
        &'a self,
        euids: impl IntoIterator<Item = &'a EntityUID>,
    ) -> Option<Vec<&'a EntityUID>> {
        euids
            .into_iter()
            .map(|e| {
                self.get_action_id(e).map(|action| {
                    action
                        .descendants
                        .iter()
                        .chain(std::iter::once(&action.name))
                })
            })
            .collect::<Option<Vec<_>>>()
            .map(|v| v.into_iter().flatten().collect())
    }

    /// The schema-declared action hierarchy, in the form consumed by the
    /// evaluator.
    pub fn action_hierarchy(&self) -> ActionHierarchy {
        ActionHierarchy::from_ancestor_sets(
            self.action_ids
                .values()
                .map(|action| (action.name.clone(), action.ancestors.clone())),
        )
    }

    /// All request environments declared by the schema: the cross product of
    /// each action with its principal and resource types.
    pub fn request_envs(&self) -> impl Iterator<Item = RequestEnv<'_>> {
        self.action_ids.values().flat_map(|action| {
            action.applies_to_principals.iter().flat_map(move |principal| {
                action.applies_to_resources.iter().map(move |resource| RequestEnv {
                    principal,
                    action: &action.name,
                    resource,
                    context: &action.context,
                })
            })
        })
    }
}

impl TryFrom<SchemaFragment> for ValidatorSchema {
    type Error = SchemaError;

    fn try_from(fragment: SchemaFragment) -> Result<Self, Self::Error> {
        // First pass: collect the declared entity type names so references
        // can be checked as we convert.
        let mut declared: HashSet<EntityType> = HashSet::new();
        for name in fragment.entity_types.keys() {
            declared.insert(name.parse()?);
        }

        let mut parents_of: HashMap<EntityType, HashSet<EntityType>> = HashMap::new();
        let mut entity_types: HashMap<EntityType, ValidatorEntityType> = HashMap::new();
        for (name, ety) in &fragment.entity_types {
            let ty: EntityType = name.parse()?;
            let mut parents = HashSet::new();
            for parent in &ety.member_of_types {
                let parent: EntityType = parent.parse()?;
                if !declared.contains(&parent) {
                    return Err(SchemaError::UndeclaredEntityType { name: parent });
                }
                parents.insert(parent);
            }
            let attrs = match &ety.shape {
                None => Attributes::default(),
                Some(TypeFragment::Record { attributes }) => {
                    convert_record_attrs(attributes, &declared)?
                }
                Some(_) => {
                    return Err(SchemaError::NotARecord {
                        kind: "shape",
                        name: name.clone(),
                    })
                }
            };
            let tags = ety
                .tags
                .as_ref()
                .map(|t| convert_type(t, &declared))
                .transpose()?;
            parents_of.insert(ty.clone(), parents);
            entity_types.insert(
                ty.clone(),
                ValidatorEntityType {
                    name: ty,
                    descendants: HashSet::new(),
                    attrs,
                    tags,
                },
            );
        }

        // Close the entity hierarchy and invert it into descendant sets.
        let entity_ancestors = transitive_closure(&parents_of);
        for (child, ancestors) in &entity_ancestors {
            for ancestor in ancestors {
                if let Some(vety) = entity_types.get_mut(ancestor) {
                    vety.descendants.insert(child.clone());
                }
            }
        }

        // Actions. All action UIDs share the `Action` entity type.
        let action_type: EntityType = "Action".parse()?;
        let mut action_parents: HashMap<EntityUID, HashSet<EntityUID>> = HashMap::new();
        let mut action_ids: HashMap<EntityUID, ValidatorActionId> = HashMap::new();
        for (eid, action) in &fragment.actions {
            let uid = EntityUID::from_components(action_type.clone(), eid.clone());
            let mut parents = HashSet::new();
            for parent in &action.member_of {
                parents.insert(EntityUID::from_components(
                    action_type.clone(),
                    parent.id.clone(),
                ));
            }
            let applies_to = action.applies_to.clone().unwrap_or_default();
            let context = match &applies_to.context {
                None => Type::record_with_attributes(None, OpenTag::ClosedAttributes),
                Some(t @ TypeFragment::Record { .. }) => convert_type(t, &declared)?,
                Some(_) => {
                    return Err(SchemaError::NotARecord {
                        kind: "context",
                        name: eid.clone(),
                    })
                }
            };
            let applies_to_principals = applies_to
                .principal_types
                .iter()
                .map(|p| {
                    let p: EntityType = p.parse()?;
                    if declared.contains(&p) {
                        Ok(p)
                    } else {
                        Err(SchemaError::UndeclaredEntityType { name: p })
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            let applies_to_resources = applies_to
                .resource_types
                .iter()
                .map(|r| {
                    let r: EntityType = r.parse()?;
                    if declared.contains(&r) {
                        Ok(r)
                    } else {
                        Err(SchemaError::UndeclaredEntityType { name: r })
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            action_parents.insert(uid.clone(), parents);
            action_ids.insert(
                uid.clone(),
                ValidatorActionId {
                    name: uid,
                    applies_to_principals,
                    applies_to_resources,
                    descendants: HashSet::new(),
                    ancestors: HashSet::new(),
                    context,
                },
            );
        }

        // Every action referenced in a `memberOf` must itself be declared.
        for parents in action_parents.values() {
            for parent in parents {
                if !action_ids.contains_key(parent) {
                    return Err(SchemaError::UndeclaredAction {
                        uid: parent.clone(),
                    });
                }
            }
        }

        // Close the action hierarchy.
        let action_ancestors = transitive_closure(&action_parents);
        for (child, ancestors) in action_ancestors {
            for ancestor in &ancestors {
                if let Some(action) = action_ids.get_mut(ancestor) {
                    action.descendants.insert(child.clone());
                }
            }
            if let Some(action) = action_ids.get_mut(&child) {
                action.ancestors = ancestors;
            }
        }

        Ok(Self {
            entity_types,
            action_ids,
        })
    }
}

/// Compute, for every node, the set of nodes reachable through one or more
/// edges. Implemented as a fixpoint over adjacency sets, so cyclic inputs
/// terminate.
fn transitive_closure<T: Clone + Eq + std::hash::Hash>(
    direct: &HashMap<T, HashSet<T>>,
) -> HashMap<T, HashSet<T>> {
    let mut closed = direct.clone();
    let mut changed = true;
    while changed {
        changed = false;
        let keys: Vec<T> = closed.keys().cloned().collect();
        for key in keys {
            let reachable = closed.get(&key).cloned().unwrap_or_default();
            let mut additions: HashSet<T> = HashSet::new();
            for mid in &reachable {
                if let Some(next) = closed.get(mid) {
                    for far in next {
                        if !reachable.contains(far) {
                            additions.insert(far.clone());
                        }
                    }
                }
            }
            if !additions.is_empty() {
                changed = true;
                if let Some(set) = closed.get_mut(&key) {
                    set.extend(additions);
                }
            }
        }
    }
    closed
}

fn convert_record_attrs(
    attributes: &BTreeMap<SmolStr, RecordAttrFragment>,
    declared: &HashSet<EntityType>,
) -> Result<Attributes, SchemaError> {
    attributes
        .iter()
        .map(|(attr, frag)| {
            Ok((
                attr.clone(),
                AttributeType::new(convert_type(&frag.ty, declared)?, frag.required),
            ))
        })
        .collect::<Result<Vec<_>, SchemaError>>()
        .map(Attributes::with_attributes)
}

fn convert_type(frag: &TypeFragment, declared: &HashSet<EntityType>) -> Result<Type, SchemaError> {
    match frag {
        TypeFragment::Boolean => Ok(Type::primitive_boolean()),
        TypeFragment::Long => Ok(Type::primitive_long()),
        TypeFragment::String => Ok(Type::primitive_string()),
        TypeFragment::Entity { name } => {
            let ty: EntityType = name.parse()?;
            if declared.contains(&ty) {
                Ok(Type::named_entity_reference(ty))
            } else {
                Err(SchemaError::UndeclaredEntityType { name: ty })
            }
        }
        TypeFragment::Set { element } => Ok(Type::set(convert_type(element, declared)?)),
        TypeFragment::Record { attributes } => Ok(Type::EntityOrRecord(
            crate::validator::types::EntityRecordKind::Record {
                attrs: convert_record_attrs(attributes, declared)?,
                open_attributes: OpenTag::ClosedAttributes,
            },
        )),
        TypeFragment::Extension { name } => Ok(Type::extension(name.parse()?)),
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;
    use serde_json::json;

    fn schema() -> ValidatorSchema {
        ValidatorSchema::from_json_value(json!(
            {
                "entityTypes": {
                    "User": {
                        "memberOfTypes": ["Group"],
                        "shape": {
                            "type": "Record",
                            "attributes": {
                                "age": { "type": "Long" },
                                "manager": { "type": "Entity", "name": "User", "required": false }
                            }
                        },
                        "tags": { "type": "String" }
                    },
                    "Group": { "memberOfTypes": ["Org"] },
                    "Org": {},
                    "Photo": {
                        "shape": {
                            "type": "Record",
                            "attributes": {
                                "owner": { "type": "Entity", "name": "User" }
                            }
                        }
                    }
                },
                "actions": {
                    "readOnly": {},
                    "view": {
                        "memberOf": [ { "id": "readOnly" } ],
                        "appliesTo": {
                            "principalTypes": ["User"],
                            "resourceTypes": ["Photo"],
                            "context": {
                                "type": "Record",
                                "attributes": { "mfa": { "type": "Boolean" } }
                            }
                        }
                    }
                }
            }
        ))
        .expect("valid schema")
    }

    fn user_type() -> EntityType {
        "User".parse().expect("valid identifier")
    }

    #[test]
    fn entity_hierarchy_is_closed() {
        let schema = schema();
        let org: EntityType = "Org".parse().expect("valid identifier");
        // `User` is a transitive descendant of `Org` via `Group`
        let in_org = schema.get_entity_types_in(&org);
        assert!(in_org.contains(&&user_type()));
        assert!(in_org.contains(&&org));
        assert_eq!(in_org.len(), 3);
    }

    #[test]
    fn attrs_and_tags_are_declared() {
        let schema = schema();
        let user = schema.get_entity_type(&user_type()).expect("declared");
        assert_eq!(
            user.attr("age").map(|a| (&a.attr_type, a.is_required)),
            Some((&Type::primitive_long(), true))
        );
        assert_eq!(
            user.attr("manager").map(|a| a.is_required),
            Some(false)
        );
        assert_eq!(user.attr("missing"), None);
        assert_eq!(user.tag_type(), Some(&Type::primitive_string()));
    }

    #[test]
    fn action_hierarchy_is_closed() {
        let schema = schema();
        let view = EntityUID::with_eid_and_type("Action", "view").expect("valid");
        let read_only = EntityUID::with_eid_and_type("Action", "readOnly").expect("valid");
        let in_read_only = schema
            .get_actions_in_set([&read_only])
            .expect("declared action");
        assert!(in_read_only.contains(&&view));

        let hierarchy = schema.action_hierarchy();
        assert!(hierarchy.action_in(&view, &read_only));
        assert!(!hierarchy.action_in(&read_only, &view));
    }

    #[test]
    fn request_envs_cross_product() {
        let schema = schema();
        let envs: Vec<_> = schema.request_envs().collect();
        // only `view` has appliesTo declarations
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].principal_entity_type(), &user_type());
    }

    #[test]
    fn undeclared_references_rejected() {
        let err = ValidatorSchema::from_json_value(json!(
            {
                "entityTypes": { "User": { "memberOfTypes": ["Ghost"] } },
                "actions": {}
            }
        ));
        assert!(matches!(
            err,
            Err(SchemaError::UndeclaredEntityType { .. })
        ));

        let err = ValidatorSchema::from_json_value(json!(
            {
                "entityTypes": {},
                "actions": { "view": { "memberOf": [ { "id": "ghost" } ] } }
            }
        ));
        assert!(matches!(err, Err(SchemaError::UndeclaredAction { .. })));
    }
}
