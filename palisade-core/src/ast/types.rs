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

use crate::ast::{EntityType, Name};

/// Runtime type of a `Value`, used in dynamic type-error messages. This is
/// deliberately coarser than the validator's static type lattice: sets and
/// records are not parameterized here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Boolean type
    Bool,
    /// Signed integer type
    Long,
    /// String type
    String,
    /// Set type
    Set,
    /// Record type
    Record,
    /// Entity type, for an entity of the given type
    Entity {
        /// Entity type
        ty: EntityType,
    },
    /// Extension type, for an extension value of the named extension type
    Extension {
        /// Name of the extension type
        name: Name,
    },
}

impl Type {
    /// Shorthand for constructing an entity type.
    pub fn entity_type(name: EntityType) -> Self {
        Type::Entity { ty: name }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Long => write!(f, "long"),
            Type::String => write!(f, "string"),
            Type::Set => write!(f, "set"),
            Type::Record => write!(f, "record"),
            Type::Entity { ty } => write!(f, "(entity of type `{ty}`)"),
            Type::Extension { name } => write!(f, "{name}"),
        }
    }
}

/// Trait for everything in the interpreter that has a type known statically.
///
/// For instance, `Value`s and `Literal`s have this, but `Expr`s don't (they'd
/// have a dynamic type, not a static type).
pub trait StaticallyTyped {
    /// Get the object's type
    fn type_of(&self) -> Type;
}
