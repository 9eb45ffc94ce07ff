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

use crate::ast::*;
use smol_str::SmolStr;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// This describes all the values which could be the dynamic result of
/// evaluating an `Expr`. Cloning is O(1).
#[derive(Debug, Clone)]
pub enum Value {
    /// anything that is a Literal can also be the dynamic result of evaluating an `Expr`
    Lit(Literal),
    /// Evaluating an `Expr` can result in a first-class set
    Set(Set),
    /// Evaluating an `Expr` can result in a first-class anonymous record (keyed on String)
    Record(Arc<BTreeMap<SmolStr, Value>>),
    /// Evaluating an `Expr` can result in an extension value
    ExtensionValue(Arc<dyn InternalExtensionValue>),
}

/// `Value`'s internal representation of a `Set`
#[derive(Debug, Clone)]
pub struct Set {
    /// the values in the set, stored in a `BTreeSet`
    pub authoritative: Arc<BTreeSet<Value>>,
    /// if possible, `HashSet<Literal>` representation of the set.
    /// (This is possible if all the elements are literals.)
    /// Some operations are much faster in this case.
    ///
    /// INVARIANT (FastRepr)
    /// we guarantee that if the elements are all literals, then this will be
    /// `Some`. (This allows us to further optimize e.g. equality checks
    /// between sets: if one set has `fast` and another does not, the sets
    /// can't be equal.)
    pub fast: Option<Arc<HashSet<Literal>>>,
}

impl Set {
    /// Get the number of items in the set
    pub fn len(&self) -> usize {
        self.authoritative.len()
    }

    /// Convenience method to check if a set is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrowed iterator
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.authoritative.iter()
    }

    /// Does the set contain the given value?
    pub fn contains(&self, v: &Value) -> bool {
        match (&self.fast, v.try_as_lit()) {
            (Some(h), Some(lit)) => h.contains(lit),
            // a fast-form set contains only literals, so it can't contain a
            // non-literal
            (Some(_), None) => false,
            (None, _) => self.authoritative.contains(v),
        }
    }
}

impl FromIterator<Value> for Set {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        let authoritative: BTreeSet<Value> = iter.into_iter().collect();
        let fast: Option<HashSet<Literal>> = authoritative
            .iter()
            .map(|v| v.try_as_lit().cloned())
            .collect();
        Self {
            authoritative: Arc::new(authoritative),
            fast: fast.map(Arc::new),
        }
    }
}

// PartialEq on Set compares only the `authoritative` version
impl PartialEq for Set {
    fn eq(&self, other: &Self) -> bool {
        self.authoritative.as_ref() == other.authoritative.as_ref()
    }
}

impl Eq for Set {}

// PartialOrd on Set compares only the `authoritative` version; note that
// HashSet doesn't implement PartialOrd
impl PartialOrd<Set> for Set {
    fn partial_cmp(&self, other: &Set) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Ord on Set compares only the `authoritative` version; note that HashSet
// doesn't implement Ord
impl Ord for Set {
    fn cmp(&self, other: &Set) -> std::cmp::Ordering {
        self.authoritative
            .as_ref()
            .cmp(other.authoritative.as_ref())
    }
}

impl Value {
    /// If the value is a Literal, get a reference to the underlying Literal
    pub(crate) fn try_as_lit(&self) -> Option<&Literal> {
        match self {
            Self::Lit(lit) => Some(lit),
            _ => None,
        }
    }

    /// Variant rank used to order values of different kinds
    fn variant_rank(&self) -> u8 {
        match self {
            Self::Lit(_) => 0,
            Self::Set(_) => 1,
            Self::Record(_) => 2,
            Self::ExtensionValue(_) => 3,
        }
    }
}

// `Arc<dyn InternalExtensionValue>` prevents deriving `PartialEq`, so the
// comparison impls are written out manually, dispatching to
// `equals_extvalue`/`cmp_extvalue` for extension values
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Lit(l1), Value::Lit(l2)) => l1 == l2,
            (Value::Set(s1), Value::Set(s2)) => s1 == s2,
            (Value::Record(r1), Value::Record(r2)) => r1 == r2,
            (Value::ExtensionValue(ev1), Value::ExtensionValue(ev2)) => {
                ev1.equals_extvalue(ev2.as_ref())
            }
            (_, _) => false, // values of different types are not equal
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> std::cmp::Ordering {
        match (self, other) {
            (Value::Lit(l1), Value::Lit(l2)) => l1.cmp(l2),
            (Value::Set(s1), Value::Set(s2)) => s1.cmp(s2),
            (Value::Record(r1), Value::Record(r2)) => r1.cmp(r2),
            (Value::ExtensionValue(ev1), Value::ExtensionValue(ev2)) => {
                ev1.cmp_extvalue(ev2.as_ref())
            }
            (_, _) => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl StaticallyTyped for Value {
    fn type_of(&self) -> Type {
        match self {
            Self::Lit(lit) => lit.type_of(),
            Self::Set(_) => Type::Set,
            Self::Record(_) => Type::Record,
            Self::ExtensionValue(ev) => Type::Extension {
                name: ev.typename(),
            },
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lit(lit) => write!(f, "{lit}"),
            Self::Set(set) => {
                match set.len() {
                    0 => write!(f, "[]"),
                    1..=5 => {
                        write!(f, "[")?;
                        for item in set.iter() {
                            write!(f, "{item}, ")?;
                        }
                        write!(f, "]")
                    }
                    n => write!(f, "<set with {n} elements>"),
                }
            }
            Self::Record(record) => write!(f, "<first-class record with {} fields>", record.len()),
            Self::ExtensionValue(ev) => write!(f, "{ev}"),
        }
    }
}

/// Create a `Value` directly from a `Vec<Value>`, or `Vec<T> where T: Into<Value>`
/// (so `Vec<i64>`, `Vec<String>`, etc)
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::set(v.into_iter().map(Into::into))
    }
}

/// Create a `Value::Record` from a map of `SmolStr` to `Value`
impl From<BTreeMap<SmolStr, Value>> for Value {
    fn from(map: BTreeMap<SmolStr, Value>) -> Self {
        Self::Record(Arc::new(map))
    }
}

/// Create a `Value` directly from a `Vec` of `(String, Value)` pairs, which
/// will be interpreted as (field, value) pairs for a first-class record
impl<S> From<Vec<(S, Value)>> for Value
where
    S: Into<SmolStr>,
{
    fn from(v: Vec<(S, Value)>) -> Self {
        Self::Record(Arc::new(v.into_iter().map(|(k, v)| (k.into(), v)).collect()))
    }
}

/// Create a `Value` directly from a `Literal`, or from anything that implements
/// `Into<Literal>` (so `i64`, `&str`, `EntityUID`, etc)
impl<T: Into<Literal>> From<T> for Value {
    fn from(lit: T) -> Self {
        Self::Lit(lit.into())
    }
}

impl Value {
    /// Create a new empty set
    pub fn empty_set() -> Self {
        Self::Set(Set {
            authoritative: Arc::new(BTreeSet::new()),
            fast: Some(Arc::new(HashSet::new())),
        })
    }

    /// Create a new empty record
    pub fn empty_record() -> Self {
        Self::Record(Arc::new(BTreeMap::new()))
    }

    /// Create a set with the given `Value`s as elements
    pub fn set(vals: impl IntoIterator<Item = Value>) -> Self {
        Self::Set(vals.into_iter().collect())
    }

    /// Create a set with the given `Literal`s as elements
    pub fn set_of_lits(lits: impl IntoIterator<Item = Literal>) -> Self {
        let fast: HashSet<Literal> = lits.into_iter().collect();
        let authoritative: BTreeSet<Value> =
            fast.iter().map(|lit| Value::Lit(lit.clone())).collect();
        Self::Set(Set {
            authoritative: Arc::new(authoritative),
            fast: Some(Arc::new(fast)),
        })
    }

    /// Create a record with the given (attribute, value) pairs
    pub fn record<S: Into<SmolStr>>(pairs: impl IntoIterator<Item = (S, Value)>) -> Self {
        Self::Record(Arc::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }
}
