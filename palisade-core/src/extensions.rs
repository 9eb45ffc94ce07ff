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

//! This module contains all of the standard extensions.

#[cfg(feature = "ipaddr")]
pub mod ipaddr;

#[cfg(feature = "decimal")]
pub mod decimal;

use std::collections::HashMap;

use crate::ast::{Extension, ExtensionFunction, Name};
use miette::Diagnostic;
use thiserror::Error;

lazy_static::lazy_static! {
    static ref ALL_AVAILABLE_EXTENSION_OBJECTS: Vec<Extension> = vec![
        #[cfg(feature = "ipaddr")]
        ipaddr::extension(),
        #[cfg(feature = "decimal")]
        decimal::extension(),
    ];

    static ref ALL_AVAILABLE_EXTENSIONS : Extensions<'static> = Extensions::build_all_available();

    static ref EXTENSIONS_NONE : Extensions<'static> = Extensions {
        extensions: &[],
        functions: HashMap::new(),
    };
}

/// Holds data on all the Extensions which are active for a given evaluation.
///
/// This structure is intentionally not `Clone` because we can use it entirely
/// by reference.
#[derive(Debug)]
pub struct Extensions<'a> {
    /// the actual extensions
    extensions: &'a [Extension],
    /// All extension functions, collected from every extension used to
    /// construct this object.  Built ahead of time so that we know during
    /// extension function lookup that at most one extension function exists
    /// for a name. This should also make the lookup more efficient.
    functions: HashMap<&'a Name, &'a ExtensionFunction>,
}

impl Extensions<'static> {
    /// Get a new `Extensions` containing data on all the available extensions.
    fn build_all_available() -> Extensions<'static> {
        // PANIC SAFETY: Builtin extensions define functions only once. Also tested by many different test cases.
        #[allow(clippy::expect_used)]
        Self::specific_extensions(&ALL_AVAILABLE_EXTENSION_OBJECTS)
            .expect("Default extensions should never error on initialization")
    }

    /// An [`Extensions`] object with static lifetime containing all available
    /// extensions.
    pub fn all_available() -> &'static Extensions<'static> {
        &ALL_AVAILABLE_EXTENSIONS
    }

    /// Get a new `Extensions` with no extensions enabled.
    pub fn none() -> &'static Extensions<'static> {
        &EXTENSIONS_NONE
    }
}

impl<'a> Extensions<'a> {
    /// Get a new `Extensions` with these specific extensions enabled.
    pub fn specific_extensions(
        extensions: &'a [Extension],
    ) -> std::result::Result<Extensions<'a>, ExtensionInitializationError> {
        // Build the functions map, ensuring that no functions share a name.
        let mut functions: HashMap<&'a Name, &'a ExtensionFunction> = HashMap::new();
        for func in extensions.iter().flat_map(Extension::funcs) {
            if functions.insert(func.name(), func).is_some() {
                return Err(ExtensionInitializationError::FuncMultiplyDefined {
                    name: func.name().clone(),
                });
            }
        }
        Ok(Extensions {
            extensions,
            functions,
        })
    }

    /// Get the names of all active extensions.
    pub fn ext_names(&self) -> impl Iterator<Item = &Name> {
        self.extensions.iter().map(Extension::name)
    }

    /// Get all extension type names declared by active extensions.
    ///
    /// (An extension type's name is the name of the extension's constructor.)
    pub fn ext_types(&self) -> impl Iterator<Item = &Name> + '_ {
        self.functions
            .values()
            .filter(|f| f.is_constructor())
            .map(|f| f.name())
    }

    /// Get the extension function with the given name, from any of the active
    /// extensions.
    ///
    /// Returns an error if the function is not defined by any active
    /// extension.
    pub fn func(&self, name: &Name) -> Result<&ExtensionFunction, ExtensionFunctionLookupError> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| ExtensionFunctionLookupError::FuncDoesNotExist { name: name.clone() })
    }

    /// Iterate over all extension functions defined by all of the active
    /// extensions.
    pub fn all_funcs(&self) -> impl Iterator<Item = &'a ExtensionFunction> + '_ {
        self.functions.values().copied()
    }
}

/// Errors occurring while initializing extensions.
#[derive(Debug, Clone, PartialEq, Eq, Diagnostic, Error)]
pub enum ExtensionInitializationError {
    /// Tried to construct an extension with two functions of the same name.
    #[error("extension function `{name}` is defined multiple times")]
    FuncMultiplyDefined {
        /// Name of the function that was multiply defined
        name: Name,
    },
}

/// Errors thrown when looking up an extension function.
#[derive(Debug, Clone, PartialEq, Eq, Diagnostic, Error)]
pub enum ExtensionFunctionLookupError {
    /// Tried to call a function that doesn't exist.
    #[error("extension function `{name}` does not exist")]
    FuncDoesNotExist {
        /// Name of the function that doesn't exist
        name: Name,
    },
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn no_common_extension_function_names() {
        // Our extensions should never have two functions of the same name.
        // This is the condition that makes `Extensions::all_available()` safe.
        assert!(
            Extensions::specific_extensions(&ALL_AVAILABLE_EXTENSION_OBJECTS).is_ok()
        );
    }

    #[test]
    fn unknown_function_lookup_fails() {
        let exts = Extensions::none();
        let name = Name::parse_unqualified_name("nonexistent").expect("valid identifier");
        assert!(matches!(
            exts.func(&name),
            Err(ExtensionFunctionLookupError::FuncDoesNotExist { .. })
        ));
    }
}
