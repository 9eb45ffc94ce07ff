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

use itertools::Itertools;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::Arc;
use thiserror::Error;

/// Error constructing a [`Name`] from a string that is not a well-formed
/// (possibly `::`-qualified) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Diagnostic, Error)]
#[error("`{0}` is not a valid identifier")]
#[diagnostic(help(
    "identifiers must start with a letter or `_` and contain only letters, digits, and `_`"
))]
pub struct InvalidNameError(pub String);

fn is_valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// This is the `Name` type used to name types, functions, etc.
/// The name can include namespaces.
/// Clone is O(1).
#[derive(Serialize, Deserialize, Hash, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "SmolStr")]
#[serde(into = "SmolStr")]
pub struct Name {
    /// Basename
    id: SmolStr,
    /// Namespaces
    path: Arc<Vec<SmolStr>>,
}

impl Name {
    /// Create a `Name` with no path (no namespaces).
    /// Returns an error if `s` is not a valid identifier.
    pub fn parse_unqualified_name(s: &str) -> Result<Self, InvalidNameError> {
        if is_valid_ident(s) {
            Ok(Self {
                id: s.into(),
                path: Arc::new(vec![]),
            })
        } else {
            Err(InvalidNameError(s.to_owned()))
        }
    }

    /// Get the basename of the `Name` (ie, with namespaces stripped).
    pub fn basename(&self) -> &SmolStr {
        &self.id
    }

    /// Get the namespace of the `Name`, as components
    pub fn namespace_components(&self) -> impl Iterator<Item = &SmolStr> {
        self.path.iter()
    }

    /// Test if a `Name` is a `Name` in the empty namespace
    pub fn is_unqualified(&self) -> bool {
        self.path.is_empty()
    }
}

impl std::str::FromStr for Name {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = s.split("::").collect::<Vec<_>>();
        if components.iter().any(|c| !is_valid_ident(c)) {
            return Err(InvalidNameError(s.to_owned()));
        }
        // `components` is non-empty because `split` always yields at least one
        // element, so `pop` returns `Some`
        let id = components.pop().unwrap_or_default();
        Ok(Self {
            id: id.into(),
            path: Arc::new(components.into_iter().map(SmolStr::new).collect()),
        })
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for elem in self.path.iter() {
            write!(f, "{elem}::")?;
        }
        write!(f, "{}", self.id)
    }
}

impl TryFrom<SmolStr> for Name {
    type Error = InvalidNameError;

    fn try_from(value: SmolStr) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Name> for SmolStr {
    fn from(value: Name) -> Self {
        value.path.iter().chain(std::iter::once(&value.id)).join("::").into()
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test {
    use super::*;
    use cool_asserts::assert_matches;

    #[test]
    fn normalized_name_roundtrips() {
        let n: Name = "Foo::Bar::Baz".parse().expect("should parse");
        assert_eq!(n.basename(), "Baz");
        assert_eq!(n.namespace_components().count(), 2);
        assert_eq!(n.to_string(), "Foo::Bar::Baz");

        let n = Name::parse_unqualified_name("decimal").expect("should parse");
        assert!(n.is_unqualified());
        assert_eq!(n.to_string(), "decimal");
    }

    #[test]
    fn invalid_names_rejected() {
        assert_matches!("".parse::<Name>(), Err(InvalidNameError(_)));
        assert_matches!("3foo".parse::<Name>(), Err(InvalidNameError(_)));
        assert_matches!("foo bar".parse::<Name>(), Err(InvalidNameError(_)));
        assert_matches!("A::".parse::<Name>(), Err(InvalidNameError(_)));
        assert_matches!(
            Name::parse_unqualified_name("A::B"),
            Err(InvalidNameError(_))
        );
    }
}
