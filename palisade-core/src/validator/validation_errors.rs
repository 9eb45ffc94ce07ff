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

//! Defines errors returned by the typechecker and the level checker.

use crate::ast::{EntityUID, Name};
use crate::validator::types::Type;
use itertools::Itertools;
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

/// Hints at the root cause of a failed least-upper-bound computation,
/// rendered as help text on [`TypeError::IncompatibleTypes`].
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum LubHelp {
    /// Attribute qualifiers (required vs optional) differ between records
    AttributeQualifier,
    /// Entity types are distinct, and distinct entity types never have a
    /// common supertype
    EntityType,
    /// Record types with different attribute names have no common supertype
    RecordWidth,
    /// No special-case help applies
    None,
}

impl std::fmt::Display for LubHelp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttributeQualifier => write!(f, "for policy types, both attributes must be required or both must be optional"),
            Self::EntityType => write!(f, "types of distinct entity types are never compatible with each other"),
            Self::RecordWidth => write!(f, "record types must have exactly the same attributes"),
            Self::None => write!(f, "types must exactly match"),
        }
    }
}

/// Where a least-upper-bound was being computed when it failed, for error
/// reporting.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum LubContext {
    /// The LUB of the elements of a set literal
    Set,
    /// The LUB of the branches of a conditional
    Conditional,
    /// Equality between two incompatible operands
    Equality,
    /// `contains` between a set element type and a candidate member
    Contains,
    /// `containsAll`/`containsAny` between two set types
    ContainsAnyAll,
}

impl std::fmt::Display for LubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set => write!(f, "elements of a set"),
            Self::Conditional => write!(f, "branches of a conditional"),
            Self::Equality => write!(f, "operands to `==`"),
            Self::Contains => write!(f, "operands to `contains`"),
            Self::ContainsAnyAll => write!(f, "operands to `containsAll` or `containsAny`"),
        }
    }
}

/// Extra help attached to an unexpected-type error when we can guess what the
/// author meant.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum UnexpectedTypeHelp {
    /// `in` applied to a non-entity
    TryUsingContains,
    /// `contains` applied to a non-set
    TryUsingIn,
    /// `has` applied to a non-record/entity
    TryUsingHas,
    /// entity type test applied to a non-entity
    TypeTestNotSupported,
}

impl std::fmt::Display for UnexpectedTypeHelp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TryUsingContains => write!(f, "try using `contains`"),
            Self::TryUsingIn => write!(f, "try using `in`"),
            Self::TryUsingHas => write!(f, "try using `has`"),
            Self::TypeTestNotSupported => {
                write!(f, "`is` is only supported for entity types")
            }
        }
    }
}

/// Structure containing details about a static type error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Diagnostic, Error)]
pub enum TypeError {
    /// The typechecker expected to see a subtype of one of the types in
    /// `expected`, but saw `actual`.
    #[error("unexpected type: expected {} but saw {actual}{}", .expected.iter().join(", "), match .help { Some(h) => format!(" ({h})"), None => String::new() })]
    UnexpectedType {
        /// Expected one of these types
        expected: Vec<Type>,
        /// The type actually seen
        actual: Type,
        /// Optional help for resolving the error
        help: Option<UnexpectedTypeHelp>,
    },

    /// The typechecker could not compute a least upper bound for `types`.
    #[error("the types {} are not compatible as {context}", .types.iter().join(" and "))]
    #[diagnostic(help("{hint}"))]
    IncompatibleTypes {
        /// Types for which the LUB was undefined
        types: Vec<Type>,
        /// Hint for resolving the error
        hint: LubHelp,
        /// `LubContext` for the error
        context: LubContext,
    },

    /// The typechecker detected an access to a record or entity attribute
    /// that it could not statically guarantee would be present.
    #[error("attribute `{attr}` not found on {actual}")]
    #[diagnostic(help("the schema does not declare this attribute"))]
    UnsafeAttributeAccess {
        /// The attribute accessed
        attr: SmolStr,
        /// Type the attribute was accessed on
        actual: Type,
        /// Whether the attribute may exist
        may_exist: bool,
    },

    /// The typechecker could not guarantee the safety of an access to a
    /// possibly-unset (optional) attribute.
    #[error("unable to guarantee safety of access to optional attribute `{attr}`")]
    #[diagnostic(help("try testing for the attribute's presence with `has` first"))]
    UnsafeOptionalAttributeAccess {
        /// The optional attribute accessed
        attr: SmolStr,
    },

    /// The typechecker could not guarantee the safety of a tag access.
    #[error("unable to guarantee safety of access to tag")]
    #[diagnostic(help("try testing for the tag's presence with `hasTag` first"))]
    UnsafeTagAccess,

    /// `getTag`/`hasTag` on an entity type that declares no tags.
    #[error("entity type {actual} has no tags declared")]
    NoTagsAllowed {
        /// The entity type accessed
        actual: Type,
    },

    /// Undefined extension function.
    #[error("undefined extension function: {name}")]
    UndefinedFunction {
        /// Name of the undefined function
        name: Name,
    },

    /// Incorrect number of arguments in an extension function application.
    #[error("wrong number of arguments in extension function application: expected {expected}, got {actual}")]
    WrongNumberArguments {
        /// Expected number of arguments
        expected: usize,
        /// Actual number of arguments
        actual: usize,
    },

    /// Error returned by an extension function when validating a call with
    /// literal arguments at typechecking time.
    #[error("error during extension function argument validation: {msg}")]
    FunctionArgumentValidation {
        /// Error message from the extension
        msg: String,
    },

    /// An entity literal whose entity type is not declared in the schema.
    #[error("unrecognized entity type `{actual}`")]
    UnrecognizedEntityType {
        /// The undeclared entity type
        actual: crate::ast::EntityType,
    },

    /// An action literal which is not declared in the schema.
    #[error("unrecognized action `{actual}`")]
    UnrecognizedActionId {
        /// The undeclared action UID
        actual: EntityUID,
    },

    /// Empty set literals are forbidden, since their element type cannot be
    /// inferred.
    #[error("empty set literals are forbidden in policies")]
    EmptySetForbidden,

    /// Extension constructors may only be applied to literals.
    #[error("extension constructors may not be called with non-literal expressions")]
    NonLitExtConstructor,

    /// Maximum recursion limit reached while typechecking.
    #[error("recursion limit reached while typechecking")]
    RecursionLimit,
}

/// Errors raised by the level checker on a type-annotated expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Diagnostic, Error)]
pub enum LevelValidationError {
    /// An entity-dereference chain exceeded the maximum level.
    #[error("this expression requires level {actual}, which exceeds the maximum allowed level ({max})")]
    MaximumLevelExceeded {
        /// Maximum allowed entity-dereference level
        max: u32,
        /// Level required by the offending dereference chain
        actual: u32,
    },

    /// An entity literal was used as the target of an entity dereference.
    #[error("entity literals cannot be dereferenced at any level")]
    LiteralDerefTarget {
        /// The dereferenced literal
        euid: EntityUID,
    },

    /// The level checker saw a node shape that a type-annotated expression
    /// cannot legally contain.
    #[error("internal invariant violated while level checking")]
    InternalInvariantViolation,
}
