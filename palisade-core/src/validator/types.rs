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

//! Defines the type structure for typechecking, and all of the operations on
//! types: subtyping and least upper bounds.

mod capability;
pub use capability::*;
mod request_env;
pub use request_env::*;

use crate::ast::{EntityType, EntityUID, Name};
use crate::validator::schema::ValidatorSchema;
use crate::validator::validation_errors::LubHelp;
use itertools::Itertools;
use serde::Serialize;
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// An entity-dereference level: how many more attribute/tag/membership hops
/// may be taken from a value of the carrying entity type.
///
/// `Finite(a) < Finite(b)` iff `a < b`, and every finite level is below
/// `Infinite`. Levels only restrict anything when a level checker or slicer
/// is in play; ordinary typechecking starts all roots at `Infinite`.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Clone, Copy, Serialize)]
pub enum Level {
    /// At most this many further entity dereferences
    Finite(u32),
    /// Unbounded dereferencing
    Infinite,
}

impl Level {
    /// The level after taking one dereference hop. `Infinite` is a fixpoint.
    /// `Finite(0)` saturates; the level checker, not this function, reports
    /// exhausted budgets.
    pub fn decrement(self) -> Self {
        match self {
            Self::Finite(n) => Self::Finite(n.saturating_sub(1)),
            Self::Infinite => Self::Infinite,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finite(n) => write!(f, "{n}"),
            Self::Infinite => write!(f, "∞"),
        }
    }
}

/// Primitive type: bool, long, or string.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Clone, Copy, Serialize)]
pub enum Primitive {
    /// Primitive boolean type.
    Bool,
    /// Primitive long type.
    Long,
    /// Primitive string type.
    String,
}

/// The main type structure.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Clone, Serialize)]
pub enum Type {
    /// Bottom type. Sub-type of all types.
    Never,

    /// Singleton boolean type true
    True,
    /// Singleton boolean type false
    False,

    /// Primitive types: bool, long, and string.
    Primitive {
        /// Which primitive type: bool, long, or string
        primitive_type: Primitive,
    },

    /// The type of sets containing some type.
    Set {
        /// The type of the elements in the set, or None if it represents an
        /// arbitrary set type. This should only be None when the type is being
        /// used in a subtype comparison (commonly done through `expect_type`)
        /// or for error reporting through the `TypeError` structure.
        element_type: Option<Box<Type>>,
    },

    /// Record and entity types
    EntityOrRecord(EntityRecordKind),

    /// Extension types
    ExtensionType {
        /// Name of the extension type
        name: Name,
    },
}

impl Type {
    /// Construct a singleton type, either `True` or `False` depending on `val`
    pub fn singleton_boolean(val: bool) -> Type {
        if val {
            Type::True
        } else {
            Type::False
        }
    }

    /// The Boolean type
    pub fn primitive_boolean() -> Type {
        Type::Primitive {
            primitive_type: Primitive::Bool,
        }
    }

    /// The Long (integer) type
    pub fn primitive_long() -> Type {
        Type::Primitive {
            primitive_type: Primitive::Long,
        }
    }

    /// The String type
    pub fn primitive_string() -> Type {
        Type::Primitive {
            primitive_type: Primitive::String,
        }
    }

    /// Construct a type for a literal EUID. This type will be a named entity
    /// type for the type of the [`EntityUID`], or `None` if the schema does
    /// not declare that entity type (or, for actions, that action UID).
    pub(crate) fn euid_literal(entity: &EntityUID, schema: &ValidatorSchema) -> Option<Type> {
        if entity.entity_type().is_action() {
            schema
                .get_action_id(entity)
                .map(|action| Type::named_entity_reference(action.name().entity_type().clone()))
        } else {
            schema
                .get_entity_type(entity.entity_type())
                .map(|ety| Type::named_entity_reference(ety.name().clone()))
        }
    }

    pub(crate) fn any_set() -> Type {
        Type::Set { element_type: None }
    }

    /// The Set type, with the element type `ety`
    pub fn set(ety: Type) -> Type {
        Type::Set {
            element_type: Some(Box::new(ety)),
        }
    }

    pub(crate) fn any_record() -> Type {
        // OpenAttributes <: ClosedAttributes, so this makes `any_record` a
        // super type of all records.
        Type::record_with_attributes(None, OpenTag::OpenAttributes)
    }

    /// Record type with given attribute types, all required
    pub fn record_with_required_attributes(
        required_attrs: impl IntoIterator<Item = (SmolStr, Type)>,
        open_attributes: OpenTag,
    ) -> Type {
        Type::EntityOrRecord(EntityRecordKind::Record {
            attrs: Attributes::with_required_attributes(required_attrs),
            open_attributes,
        })
    }

    /// Record type with given attribute types
    pub fn record_with_attributes(
        attrs: impl IntoIterator<Item = (SmolStr, AttributeType)>,
        open_attributes: OpenTag,
    ) -> Type {
        Type::EntityOrRecord(EntityRecordKind::Record {
            attrs: Attributes::with_attributes(attrs),
            open_attributes,
        })
    }

    /// An entity reference type for the named entity type, with an unbounded
    /// level.
    pub fn named_entity_reference(name: EntityType) -> Type {
        Type::entity_reference_with_level(name, Level::Infinite)
    }

    /// An entity reference type carrying an explicit level.
    pub fn entity_reference_with_level(name: EntityType, level: Level) -> Type {
        Type::EntityOrRecord(EntityRecordKind::Entity { ty: name, level })
    }

    pub(crate) fn any_entity_reference() -> Type {
        Type::EntityOrRecord(EntityRecordKind::AnyEntity)
    }

    /// An extension type with the given name.
    pub(crate) fn extension(name: Name) -> Type {
        Type::ExtensionType { name }
    }

    /// Cap every entity level appearing in this type at `level`. Used when a
    /// value of this type was reached by dereferencing an entity: whatever
    /// level budget the schema's declared type may claim, the fetched value
    /// cannot support more hops than remain after the dereference.
    pub(crate) fn with_max_entity_level(self, level: Level) -> Type {
        match self {
            Type::EntityOrRecord(rk) => Type::EntityOrRecord(rk.with_max_entity_level(level)),
            Type::Set {
                element_type: Some(ety),
            } => Type::Set {
                element_type: Some(Box::new(ety.with_max_entity_level(level))),
            },
            ty => ty,
        }
    }

    /// Implements a subtype relation for the type structure.
    pub(crate) fn is_subtype(ty0: &Type, ty1: &Type) -> bool {
        match (ty0, ty1) {
            // Never is a subtype of every type.
            (Type::Never, _) => true,

            (
                Type::True | Type::False,
                Type::Primitive {
                    primitive_type: Primitive::Bool,
                },
            ) => true,
            (Type::True, Type::True) => true,
            (Type::False, Type::False) => true,

            // Subtypes between two primitives only occurs when the primitive
            // types are the same.
            (Type::Primitive { primitive_type: _ }, Type::Primitive { primitive_type: _ }) => {
                ty0 == ty1
            }

            // A set type is a subtype of another set type when its element
            // type is a subtype.
            (
                Type::Set {
                    element_type: e_ty0,
                },
                Type::Set {
                    element_type: e_ty1,
                },
            ) => match (e_ty0, e_ty1) {
                (Some(e_ty0), Some(e_ty1)) => Type::is_subtype(e_ty0, e_ty1),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => true,
            },

            (Type::EntityOrRecord(rk0), Type::EntityOrRecord(rk1)) => {
                EntityRecordKind::is_subtype(rk0, rk1)
            }

            // Subtypes between extension types only occurs when the extension
            // types are the same.
            (Type::ExtensionType { .. }, Type::ExtensionType { .. }) => ty0 == ty1,

            // If none of the above apply, then ty0 is not a subtype of ty1.
            _ => false,
        }
    }

    /// Compute the least upper bound of two types. This is a type such that
    /// each type is a subtype of the least upper bound.
    pub(crate) fn least_upper_bound(ty0: &Type, ty1: &Type) -> Result<Type, LubHelp> {
        match (ty0, ty1) {
            _ if Type::is_subtype(ty0, ty1) => Ok(ty1.clone()),
            _ if Type::is_subtype(ty1, ty0) => Ok(ty0.clone()),

            (Type::True | Type::False, Type::True | Type::False) => Ok(Type::primitive_boolean()),

            // `None` as an element type represents the top type for the set
            // element, so every other set is a subtype of set<None>, making a
            // least upper bound containing set<None> and another set type
            // equal to set<None>. This case should be impossible due to the
            // subtype checks in the first two match cases, but we handle it
            // explicitly as an alternative to panicking if it occurs.
            (Type::Set { element_type: None }, Type::Set { .. })
            | (Type::Set { .. }, Type::Set { element_type: None }) => {
                Ok(Type::Set { element_type: None })
            }

            // The least upper bound of two set types is a set with an element
            // type that is the element type least upper bound.
            (
                Type::Set {
                    element_type: Some(te0),
                },
                Type::Set {
                    element_type: Some(te1),
                },
            ) => Ok(Type::set(Type::least_upper_bound(te0, te1)?)),

            (Type::EntityOrRecord(rk0), Type::EntityOrRecord(rk1)) => Ok(Type::EntityOrRecord(
                EntityRecordKind::least_upper_bound(rk0, rk1)?,
            )),

            _ => Err(LubHelp::None),
        }
    }

    /// Given a list of types, compute the least upper bound of all types in
    /// the list. The least upper bound of an empty list is Never.
    pub(crate) fn reduce_to_least_upper_bound<'a>(
        tys: impl IntoIterator<Item = &'a Type>,
    ) -> Result<Type, LubHelp> {
        tys.into_iter()
            .try_fold(Type::Never, |lub, next| Type::least_upper_bound(&lub, next))
    }

    /// Return `true` if the parameter types are definitely disjoint, i.e.,
    /// there are no values which inhabit both types. It is tempting to say
    /// that types are disjoint if neither is a subtype of the other, but this
    /// would be incorrect for set types where the set can be empty: set<long>
    /// and set<bool> would then be considered disjoint, but both are inhabited
    /// by the empty set. Declaring types disjoint when they are not would
    /// cause soundness errors in the typechecker, so this function errs
    /// toward `false`.
    pub(crate) fn are_types_disjoint(ty1: &Type, ty2: &Type) -> bool {
        match (ty1, ty2) {
            (
                Type::EntityOrRecord(EntityRecordKind::Entity { ty: ety1, .. }),
                Type::EntityOrRecord(EntityRecordKind::Entity { ty: ety2, .. }),
            ) => ety1 != ety2,
            _ => false, // conservatively false, not promising disjointness; see note above
        }
    }

    /// Get the type of the specified attribute of an entity or record type,
    /// if it is known.
    ///
    /// - If `ty` is not an entity or record type, returns `None`.
    /// - If the attribute is known to not exist on `ty`, returns `None`.
    /// - If the attribute is known to be optional on `ty`, returns `Some`
    ///   with the type. (Note that [`AttributeType`] contains an
    ///   `is_required` flag, so you can distinguish this case.)
    ///
    /// For entity types, any entity levels inside the returned attribute type
    /// are capped at the entity's level minus one: the attribute's value was
    /// reached by one dereference.
    pub(crate) fn lookup_attribute_type(
        schema: &ValidatorSchema,
        ty: &Type,
        attr: &str,
    ) -> Option<AttributeType> {
        match ty {
            Type::EntityOrRecord(rk) => rk.get_attr(schema, attr),
            _ => None,
        }
    }

    /// The declared tag type for an entity type, if any, with the same level
    /// capping as `lookup_attribute_type`.
    pub(crate) fn lookup_tag_type(schema: &ValidatorSchema, ty: &Type) -> Option<Type> {
        match ty {
            Type::EntityOrRecord(EntityRecordKind::Entity { ty, level }) => schema
                .get_entity_type(ty)
                .and_then(|ety| ety.tag_type())
                .map(|tag_ty| tag_ty.clone().with_max_entity_level(level.decrement())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Never => write!(f, "__never"),
            Type::True => write!(f, "True"),
            Type::False => write!(f, "False"),
            Type::Primitive {
                primitive_type: Primitive::Bool,
            } => write!(f, "Bool"),
            Type::Primitive {
                primitive_type: Primitive::Long,
            } => write!(f, "Long"),
            Type::Primitive {
                primitive_type: Primitive::String,
            } => write!(f, "String"),
            Type::Set { element_type } => match element_type {
                Some(ety) => write!(f, "Set<{ety}>"),
                None => write!(f, "Set<__any>"),
            },
            Type::EntityOrRecord(rk) => write!(f, "{rk}"),
            Type::ExtensionType { name } => write!(f, "Extension<{name}>"),
        }
    }
}

/// Record and entity kinds.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Clone, Serialize)]
pub enum EntityRecordKind {
    /// A record type
    Record {
        /// The attributes that we know must exist (or may exist in the case
        /// of optional attributes) for a record with this type along with the
        /// types the attributes must have if they do exist.
        attrs: Attributes,
        /// Encodes whether the attributes for this record are open or closed.
        open_attributes: OpenTag,
    },
    /// Any entity type. Used only as an expected-type bound when checking
    /// operand kinds; never inferred as the type of an expression.
    AnyEntity,
    /// An entity reference type for a single named entity type, carrying the
    /// remaining entity-dereference level.
    Entity {
        /// The entity type
        ty: EntityType,
        /// Remaining dereference budget for values of this type
        level: Level,
    },
}

impl EntityRecordKind {
    fn with_max_entity_level(self, max: Level) -> EntityRecordKind {
        match self {
            EntityRecordKind::Entity { ty, level } => EntityRecordKind::Entity {
                ty,
                level: level.min(max),
            },
            EntityRecordKind::Record {
                attrs,
                open_attributes,
            } => EntityRecordKind::Record {
                attrs: Attributes::with_attributes(attrs.into_iter().map(|(name, attr_ty)| {
                    (
                        name,
                        AttributeType {
                            attr_type: attr_ty.attr_type.with_max_entity_level(max),
                            is_required: attr_ty.is_required,
                        },
                    )
                })),
                open_attributes,
            },
            EntityRecordKind::AnyEntity => EntityRecordKind::AnyEntity,
        }
    }

    pub(crate) fn get_attr(&self, schema: &ValidatorSchema, attr: &str) -> Option<AttributeType> {
        match self {
            EntityRecordKind::Record { attrs, .. } => attrs.get_attr(attr).cloned(),
            EntityRecordKind::AnyEntity => None,
            EntityRecordKind::Entity { ty, level } => {
                schema.get_entity_type(ty).and_then(|ety| {
                    ety.attr(attr).map(|attr_ty| AttributeType {
                        attr_type: attr_ty
                            .attr_type
                            .clone()
                            .with_max_entity_level(level.decrement()),
                        is_required: attr_ty.is_required,
                    })
                })
            }
        }
    }

    pub(crate) fn is_subtype(rk0: &EntityRecordKind, rk1: &EntityRecordKind) -> bool {
        use EntityRecordKind::{AnyEntity, Entity, Record};
        match (rk0, rk1) {
            (
                Record {
                    attrs: attrs0,
                    open_attributes: open0,
                },
                Record {
                    attrs: attrs1,
                    open_attributes: open1,
                },
            ) => {
                // Closed records are subtypes of open records, but open
                // records are not subtypes of closed records.
                let open_attributes_ok = open1.is_open() || !open0.is_open();
                // When the supertype is open, it only demands the attributes
                // it declares; when closed, the attribute sets and their
                // required/optional qualifiers must match exactly.
                let width_ok = if open1.is_open() {
                    attrs1.iter().all(|(k, _)| attrs0.get_attr(k).is_some())
                } else {
                    attrs0.keys().collect::<Vec<_>>() == attrs1.keys().collect::<Vec<_>>()
                };
                open_attributes_ok
                    && width_ok
                    && attrs1.iter().all(|(k, ty1)| {
                        attrs0.get_attr(k).is_some_and(|ty0| {
                            let qualifier_ok = if open1.is_open() {
                                ty0.is_required || !ty1.is_required
                            } else {
                                ty0.is_required == ty1.is_required
                            };
                            qualifier_ok && Type::is_subtype(&ty0.attr_type, &ty1.attr_type)
                        })
                    })
            }
            // Entities are subtypes of AnyEntity
            (Entity { .. } | AnyEntity, AnyEntity) => true,
            // A higher remaining level means strictly more is permitted
            (
                Entity {
                    ty: ty0,
                    level: l0,
                },
                Entity {
                    ty: ty1,
                    level: l1,
                },
            ) => ty0 == ty1 && l0 >= l1,
            _ => false,
        }
    }

    pub(crate) fn least_upper_bound(
        rk0: &EntityRecordKind,
        rk1: &EntityRecordKind,
    ) -> Result<EntityRecordKind, LubHelp> {
        use EntityRecordKind::{AnyEntity, Entity, Record};
        match (rk0, rk1) {
            (
                Record {
                    attrs: attrs0,
                    open_attributes: open0,
                },
                Record {
                    attrs: attrs1,
                    open_attributes: open1,
                },
            ) => {
                if open0 != open1 {
                    return Err(LubHelp::RecordWidth);
                }
                Ok(Record {
                    attrs: Attributes::least_upper_bound(attrs0, attrs1)?,
                    open_attributes: *open0,
                })
            }
            // Entity types with the same name join at the more restrictive
            // (smaller) level: a value reachable along either path can only be
            // relied on for the hops both paths guarantee.
            (
                Entity {
                    ty: ty0,
                    level: l0,
                },
                Entity {
                    ty: ty1,
                    level: l1,
                },
            ) => {
                if ty0 == ty1 {
                    Ok(Entity {
                        ty: ty0.clone(),
                        level: (*l0).min(*l1),
                    })
                } else {
                    // Distinct entity types have no least upper bound. This is
                    // load-bearing: it is what lets `==` on distinct entity
                    // types be given type False.
                    Err(LubHelp::EntityType)
                }
            }
            (AnyEntity | Entity { .. }, AnyEntity | Entity { .. }) => Ok(AnyEntity),
            (Record { .. }, AnyEntity | Entity { .. })
            | (AnyEntity | Entity { .. }, Record { .. }) => Err(LubHelp::None),
        }
    }

    /// The single entity type of this kind, if it is an entity kind.
    pub(crate) fn as_entity_type(&self) -> Option<(&EntityType, Level)> {
        match self {
            EntityRecordKind::Entity { ty, level } => Some((ty, *level)),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityRecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRecordKind::Record { attrs, .. } => {
                write!(f, "{{")?;
                write!(
                    f,
                    "{}",
                    attrs
                        .iter()
                        .map(|(k, v)| format!(
                            "{k}{}: {}",
                            if v.is_required { "" } else { "?" },
                            v.attr_type
                        ))
                        .join(", ")
                )?;
                write!(f, "}}")
            }
            EntityRecordKind::AnyEntity => write!(f, "__entity"),
            EntityRecordKind::Entity { ty, level: Level::Infinite } => write!(f, "{ty}"),
            EntityRecordKind::Entity { ty, level } => write!(f, "{ty}@{level}"),
        }
    }
}

/// Tag to indicate when a record type is open or closed.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy, Serialize, PartialOrd, Ord)]
pub enum OpenTag {
    /// The attributes are open. A value of this type may have attributes
    /// other than those listed.
    OpenAttributes,
    /// The attributes are closed.
    ClosedAttributes,
}

impl OpenTag {
    pub(crate) fn is_open(self) -> bool {
        match self {
            OpenTag::OpenAttributes => true,
            OpenTag::ClosedAttributes => false,
        }
    }
}

/// A map of attribute names to types.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Serialize, PartialOrd, Ord, Default)]
pub struct Attributes {
    /// Attributes map
    pub attrs: BTreeMap<SmolStr, AttributeType>,
}

impl Attributes {
    /// Construct an [`Attributes`] with some required attributes.
    pub fn with_required_attributes(
        required_attrs: impl IntoIterator<Item = (SmolStr, Type)>,
    ) -> Self {
        Self {
            attrs: required_attrs
                .into_iter()
                .map(|(attr, ty)| (attr, AttributeType::required_attribute(ty)))
                .collect(),
        }
    }

    /// Construct an [`Attributes`] with some attributes that may be required
    /// or optional.
    pub fn with_attributes(attrs: impl IntoIterator<Item = (SmolStr, AttributeType)>) -> Self {
        Self {
            attrs: attrs.into_iter().collect(),
        }
    }

    /// Iterate over the attributes of this record with their types
    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &AttributeType)> {
        self.attrs.iter()
    }

    /// Iterate over the attribute names of this record
    pub fn keys(&self) -> impl Iterator<Item = &SmolStr> {
        self.attrs.keys()
    }

    /// Get a tuple of the type and required flag for the given attribute
    pub fn get_attr(&self, attr: &str) -> Option<&AttributeType> {
        self.attrs.get(attr)
    }

    /// The least upper bound of two attribute maps: defined only when the
    /// attribute names and their required/optional qualifiers agree exactly,
    /// in which case it is the pointwise least upper bound of the attribute
    /// types.
    pub(crate) fn least_upper_bound(
        attrs0: &Attributes,
        attrs1: &Attributes,
    ) -> Result<Attributes, LubHelp> {
        if attrs0.keys().collect::<Vec<_>>() != attrs1.keys().collect::<Vec<_>>() {
            return Err(LubHelp::RecordWidth);
        }
        attrs0
            .iter()
            .map(|(attr, ty0)| {
                // The unwrap-free lookup: we just checked the keysets agree
                let ty1 = attrs1.get_attr(attr).ok_or(LubHelp::RecordWidth)?;
                if ty0.is_required != ty1.is_required {
                    return Err(LubHelp::AttributeQualifier);
                }
                Ok((
                    attr.clone(),
                    AttributeType {
                        attr_type: Type::least_upper_bound(&ty0.attr_type, &ty1.attr_type)?,
                        is_required: ty0.is_required,
                    },
                ))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Attributes::with_attributes)
    }
}

impl IntoIterator for Attributes {
    type Item = (SmolStr, AttributeType);
    type IntoIter = std::collections::btree_map::IntoIter<SmolStr, AttributeType>;

    fn into_iter(self) -> Self::IntoIter {
        self.attrs.into_iter()
    }
}

/// The type of a single attribute: a type, plus whether the attribute is
/// required or optional.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Serialize, PartialOrd, Ord)]
pub struct AttributeType {
    /// The type of the attribute value
    pub attr_type: Type,
    /// True when the attribute must be present
    pub is_required: bool,
}

impl AttributeType {
    /// Construct an [`AttributeType`] with some type that may be required or
    /// optional as specified by the `is_required` parameter.
    pub fn new(attr_type: Type, is_required: bool) -> Self {
        Self {
            attr_type,
            is_required,
        }
    }

    /// Construct an [`AttributeType`] for an attribute that is required.
    pub fn required_attribute(attr_type: Type) -> Self {
        Self::new(attr_type, true)
    }
}
