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

use crate::ast::{EntityType, Literal, Name};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Internal AST for expressions used by the evaluator and typechecker.
/// This structure is a wrapper around an `ExprKind`, which is the expression
/// variant this object contains. It also contains some generic data which is
/// stored on each node of the AST.
/// Cloning is O(1).
#[derive(Hash, Debug, Clone, PartialEq, Eq)]
pub struct Expr<T = ()> {
    expr_kind: ExprKind<T>,
    data: T,
}

/// The possible expression variants. This enum should be matched on by code
/// recursively traversing the AST.
#[derive(Hash, Debug, Clone, PartialEq, Eq)]
pub enum ExprKind<T = ()> {
    /// Literal value
    Lit(Literal),
    /// Variable
    Var(Var),
    /// Ternary expression
    If {
        /// Condition for the ternary expression. Must evaluate to Bool type
        test_expr: Arc<Expr<T>>,
        /// Value if true
        then_expr: Arc<Expr<T>>,
        /// Value if false
        else_expr: Arc<Expr<T>>,
    },
    /// Boolean AND
    And {
        /// Left operand, which will be eagerly evaluated
        left: Arc<Expr<T>>,
        /// Right operand, which may not be evaluated due to short-circuiting
        right: Arc<Expr<T>>,
    },
    /// Boolean OR
    Or {
        /// Left operand, which will be eagerly evaluated
        left: Arc<Expr<T>>,
        /// Right operand, which may not be evaluated due to short-circuiting
        right: Arc<Expr<T>>,
    },
    /// Application of a built-in unary operator (single parameter)
    UnaryApp {
        /// Unary operator to apply
        op: UnaryOp,
        /// Argument to apply operator to
        arg: Arc<Expr<T>>,
    },
    /// Application of a built-in binary operator (two parameters)
    BinaryApp {
        /// Binary operator to apply
        op: BinaryOp,
        /// First arg
        arg1: Arc<Expr<T>>,
        /// Second arg
        arg2: Arc<Expr<T>>,
    },
    /// Application of an extension function to n arguments
    ExtensionFunctionApp {
        /// Extension function to apply
        fn_name: Name,
        /// Args to apply the function to
        args: Arc<Vec<Expr<T>>>,
    },
    /// Get an attribute of an entity, or a field of a record
    GetAttr {
        /// Expression to get an attribute/field of. Must evaluate to either
        /// Entity or Record type
        expr: Arc<Expr<T>>,
        /// Attribute or field to get
        attr: SmolStr,
    },
    /// Does the given `expr` have the given `attr`?
    HasAttr {
        /// Expression to test. Must evaluate to either Entity or Record type
        expr: Arc<Expr<T>>,
        /// Attribute or field to check for
        attr: SmolStr,
    },
    /// Entity type test. Does the first argument have the entity type
    /// specified by the second argument.
    Is {
        /// Expression to test. Must evaluate to an Entity.
        expr: Arc<Expr<T>>,
        /// The entity type used for the type membership test.
        entity_type: EntityType,
    },
    /// Set (whose elements may be arbitrary expressions)
    //
    // This is backed by `Vec` (and not e.g. `HashSet`), because two `Expr`s
    // that are syntactically unequal, may actually be semantically equal --
    // i.e., we can't do the dedup of duplicates until all of the `Expr`s are
    // evaluated into `Value`s
    Set(Arc<Vec<Expr<T>>>),
    /// Anonymous record (whose elements may be arbitrary expressions)
    Record(Arc<BTreeMap<SmolStr, Expr<T>>>),
}

/// Built-in variables bound by the authorization request.
#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    /// the Principal of the given request
    Principal,
    /// the Action of the given request
    Action,
    /// the Resource of the given request
    Resource,
    /// the Context of the given request
    Context,
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Principal => write!(f, "principal"),
            Self::Action => write!(f, "action"),
            Self::Resource => write!(f, "resource"),
            Self::Context => write!(f, "context"),
        }
    }
}

/// Built-in operators with exactly one argument
#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation
    ///
    /// Argument must have Bool type
    Not,
    /// Integer negation
    ///
    /// Argument must have Long type
    Neg,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Not => write!(f, "!"),
            Self::Neg => write!(f, "-"),
        }
    }
}

/// Built-in operators with exactly two arguments
#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Equality
    ///
    /// Works on arguments of any type, ie "total equality". If you compare
    /// things of different types, `Eq` will return `false`, rather than error.
    Eq,

    /// <
    ///
    /// Arguments must have Long type
    Less,

    /// <=
    ///
    /// Arguments must have Long type
    LessEq,

    /// Integer addition
    ///
    /// Arguments must have Long type
    Add,

    /// Integer subtraction
    ///
    /// Arguments must have Long type
    Sub,

    /// Integer multiplication
    ///
    /// Arguments must have Long type
    Mul,

    /// Hierarchy membership. Specifically, is the first arg a member of the
    /// second.
    ///
    /// First argument must have Entity type.
    /// Second argument must either have Entity type, or Set type where the
    /// set elements all have Entity type.
    ///
    /// A `B in C` relation is not stored in the entity store as `B in C`;
    /// instead, `B` has an ancestors set which contains `C`.
    In,

    /// Set membership.
    ///
    /// First argument must have Set type.
    Contains,

    /// ContainsAll test for sets. Specifically, if the first set contains the
    /// second arg.
    ///
    /// Arguments must have Set type
    ContainsAll,

    /// ContainsAny test for sets (is the intersection empty?)
    ///
    /// Arguments must have Set type
    ContainsAny,

    /// Get a tag of an entity.
    ///
    /// First argument must have Entity type, second argument must have String
    /// type.
    GetTag,

    /// Does the given `expr` have the given `tag`?
    ///
    /// First argument must have Entity type, second argument must have String
    /// type.
    HasTag,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eq => write!(f, "=="),
            Self::Less => write!(f, "<"),
            Self::LessEq => write!(f, "<="),
            Self::Add => write!(f, "+"),
            Self::Sub => write!(f, "-"),
            Self::Mul => write!(f, "*"),
            Self::In => write!(f, "in"),
            Self::Contains => write!(f, "contains"),
            Self::ContainsAll => write!(f, "containsAll"),
            Self::ContainsAny => write!(f, "containsAny"),
            Self::GetTag => write!(f, "getTag"),
            Self::HasTag => write!(f, "hasTag"),
        }
    }
}

impl<T> Expr<T> {
    fn new(expr_kind: ExprKind<T>, data: T) -> Self {
        Self { expr_kind, data }
    }

    /// Access the inner `ExprKind` for this `Expr`. The `ExprKind` is the
    /// enum which specifies the expression variant, so it must be accessed by
    /// any code matching and recursing on an expression.
    pub fn expr_kind(&self) -> &ExprKind<T> {
        &self.expr_kind
    }

    /// Access the inner `ExprKind`, taking ownership.
    pub fn into_expr_kind(self) -> ExprKind<T> {
        self.expr_kind
    }

    /// Access the data stored on the `Expr`.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Update the data for this `Expr`. A convenient function used by the
    /// typechecker in place of `with_data()` when a type is determined after
    /// the `Expr` is constructed.
    pub fn set_data(&mut self, data: T) {
        self.data = data;
    }

    /// Check whether this expression is an entity reference, and return the
    /// UID if so.
    pub fn as_euid_lit(&self) -> Option<&Arc<crate::ast::EntityUID>> {
        match &self.expr_kind {
            ExprKind::Lit(Literal::EntityUID(euid)) => Some(euid),
            _ => None,
        }
    }
}

#[allow(dead_code)] // some constructors are only used in tests or by specific features
impl Expr {
    /// Create an `Expr` that's just a single `Literal`.
    ///
    /// Note that you can pass this a `Literal`, an `i64`, a `String`, etc.
    pub fn val(v: impl Into<Literal>) -> Self {
        ExprBuilder::new().val(v)
    }

    /// Create an `Expr` that's just this literal `Var`
    pub fn var(v: Var) -> Self {
        ExprBuilder::new().var(v)
    }

    /// Create a ternary (if-then-else) `Expr`.
    pub fn ite(test_expr: Expr, then_expr: Expr, else_expr: Expr) -> Self {
        ExprBuilder::new().ite(test_expr, then_expr, else_expr)
    }

    /// Create a 'not' expression.
    pub fn not(e: Expr) -> Self {
        ExprBuilder::new().not(e)
    }

    /// Create a 'neg' expression.
    pub fn neg(e: Expr) -> Self {
        ExprBuilder::new().neg(e)
    }

    /// Create an '==' expression
    pub fn is_eq(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().is_eq(e1, e2)
    }

    /// Create an 'and' expression.
    pub fn and(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().and(e1, e2)
    }

    /// Create an 'or' expression.
    pub fn or(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().or(e1, e2)
    }

    /// Create a '<' expression.
    pub fn less(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().less(e1, e2)
    }

    /// Create a '<=' expression.
    pub fn lesseq(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().lesseq(e1, e2)
    }

    /// Create an 'add' expression.
    pub fn add(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().add(e1, e2)
    }

    /// Create a 'sub' expression.
    pub fn sub(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().sub(e1, e2)
    }

    /// Create a 'mul' expression.
    pub fn mul(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().mul(e1, e2)
    }

    /// Create an 'in' expression.
    pub fn is_in(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().is_in(e1, e2)
    }

    /// Create a 'contains' expression.
    pub fn contains(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().contains(e1, e2)
    }

    /// Create a 'containsAll' expression.
    pub fn contains_all(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().contains_all(e1, e2)
    }

    /// Create a 'containsAny' expression.
    pub fn contains_any(e1: Expr, e2: Expr) -> Self {
        ExprBuilder::new().contains_any(e1, e2)
    }

    /// Create a 'getTag' expression.
    pub fn get_tag(expr: Expr, tag: Expr) -> Self {
        ExprBuilder::new().get_tag(expr, tag)
    }

    /// Create a 'hasTag' expression.
    pub fn has_tag(expr: Expr, tag: Expr) -> Self {
        ExprBuilder::new().has_tag(expr, tag)
    }

    /// Create an `Expr` which evaluates to a Set of the given `Expr`s
    pub fn set(exprs: impl IntoIterator<Item = Expr>) -> Self {
        ExprBuilder::new().set(exprs)
    }

    /// Create an `Expr` which evaluates to a Record with the given (key, value) pairs.
    pub fn record<S: Into<SmolStr>>(pairs: impl IntoIterator<Item = (S, Expr)>) -> Self {
        ExprBuilder::new().record(pairs)
    }

    /// Create an `Expr` which calls the extension function with the given
    /// `Name` on `args`
    pub fn call_extension_fn(fn_name: Name, args: Vec<Expr>) -> Self {
        ExprBuilder::new().call_extension_fn(fn_name, args)
    }

    /// Create an `Expr` which gets the attribute of some `Expr`
    pub fn get_attr(expr: Expr, attr: impl Into<SmolStr>) -> Self {
        ExprBuilder::new().get_attr(expr, attr)
    }

    /// Create an `Expr` which tests for the existence of a given attribute on
    /// a given entity or record.
    pub fn has_attr(expr: Expr, attr: impl Into<SmolStr>) -> Self {
        ExprBuilder::new().has_attr(expr, attr)
    }

    /// Create an 'is' expression.
    pub fn is_entity_type(expr: Expr, entity_type: EntityType) -> Self {
        ExprBuilder::new().is_entity_type(expr, entity_type)
    }
}

/// Builder for constructing `Expr` objects annotated with some `data` (possibly
/// taking default value).
#[derive(Debug)]
pub struct ExprBuilder<T> {
    data: T,
}

impl<T: Default> ExprBuilder<T> {
    /// Construct a new `ExprBuilder` where the data used for an expression
    /// takes a default value.
    pub fn new() -> Self {
        Self {
            data: T::default(),
        }
    }
}

impl<T: Default> Default for ExprBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ExprBuilder<T> {
    /// Construct a new `ExprBuilder` where the specified data will be stored
    /// on the `Expr` it constructs.
    pub fn with_data(data: T) -> Self {
        Self { data }
    }

    /// Create an `Expr` that's just a single `Literal`.
    pub fn val(self, v: impl Into<Literal>) -> Expr<T> {
        Expr::new(ExprKind::Lit(v.into()), self.data)
    }

    /// Create an `Expr` that's just this literal `Var`
    pub fn var(self, v: Var) -> Expr<T> {
        Expr::new(ExprKind::Var(v), self.data)
    }

    /// Create a ternary (if-then-else) `Expr`.
    pub fn ite(self, test_expr: Expr<T>, then_expr: Expr<T>, else_expr: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::If {
                test_expr: Arc::new(test_expr),
                then_expr: Arc::new(then_expr),
                else_expr: Arc::new(else_expr),
            },
            self.data,
        )
    }

    /// Create a 'not' expression.
    pub fn not(self, e: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::UnaryApp {
                op: UnaryOp::Not,
                arg: Arc::new(e),
            },
            self.data,
        )
    }

    /// Create a 'neg' expression.
    pub fn neg(self, e: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::UnaryApp {
                op: UnaryOp::Neg,
                arg: Arc::new(e),
            },
            self.data,
        )
    }

    /// Create a unary-op expression
    pub fn unary_app(self, op: UnaryOp, arg: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::UnaryApp {
                op,
                arg: Arc::new(arg),
            },
            self.data,
        )
    }

    /// Create a binary-op expression
    pub fn binary_app(self, op: BinaryOp, arg1: Expr<T>, arg2: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::BinaryApp {
                op,
                arg1: Arc::new(arg1),
                arg2: Arc::new(arg2),
            },
            self.data,
        )
    }

    /// Create an '==' expression
    pub fn is_eq(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::Eq, e1, e2)
    }

    /// Create an 'and' expression.
    pub fn and(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::And {
                left: Arc::new(e1),
                right: Arc::new(e2),
            },
            self.data,
        )
    }

    /// Create an 'or' expression.
    pub fn or(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        Expr::new(
            ExprKind::Or {
                left: Arc::new(e1),
                right: Arc::new(e2),
            },
            self.data,
        )
    }

    /// Create a '<' expression.
    pub fn less(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::Less, e1, e2)
    }

    /// Create a '<=' expression.
    pub fn lesseq(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::LessEq, e1, e2)
    }

    /// Create an 'add' expression.
    pub fn add(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::Add, e1, e2)
    }

    /// Create a 'sub' expression.
    pub fn sub(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::Sub, e1, e2)
    }

    /// Create a 'mul' expression.
    pub fn mul(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::Mul, e1, e2)
    }

    /// Create an 'in' expression.
    pub fn is_in(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::In, e1, e2)
    }

    /// Create a 'contains' expression.
    pub fn contains(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::Contains, e1, e2)
    }

    /// Create a 'containsAll' expression.
    pub fn contains_all(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::ContainsAll, e1, e2)
    }

    /// Create a 'containsAny' expression.
    pub fn contains_any(self, e1: Expr<T>, e2: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::ContainsAny, e1, e2)
    }

    /// Create a 'getTag' expression.
    pub fn get_tag(self, expr: Expr<T>, tag: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::GetTag, expr, tag)
    }

    /// Create a 'hasTag' expression.
    pub fn has_tag(self, expr: Expr<T>, tag: Expr<T>) -> Expr<T> {
        self.binary_app(BinaryOp::HasTag, expr, tag)
    }

    /// Create an `Expr` which evaluates to a Set of the given `Expr`s
    pub fn set(self, exprs: impl IntoIterator<Item = Expr<T>>) -> Expr<T> {
        Expr::new(ExprKind::Set(Arc::new(exprs.into_iter().collect())), self.data)
    }

    /// Create an `Expr` which evaluates to a Record with the given (key, value) pairs.
    pub fn record<S: Into<SmolStr>>(
        self,
        pairs: impl IntoIterator<Item = (S, Expr<T>)>,
    ) -> Expr<T> {
        Expr::new(
            ExprKind::Record(Arc::new(
                pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            )),
            self.data,
        )
    }

    /// Create an `Expr` which calls the extension function with the given
    /// `Name` on `args`
    pub fn call_extension_fn(self, fn_name: Name, args: impl IntoIterator<Item = Expr<T>>) -> Expr<T> {
        Expr::new(
            ExprKind::ExtensionFunctionApp {
                fn_name,
                args: Arc::new(args.into_iter().collect()),
            },
            self.data,
        )
    }

    /// Create an `Expr` which gets the attribute of some `Expr`
    pub fn get_attr(self, expr: Expr<T>, attr: impl Into<SmolStr>) -> Expr<T> {
        Expr::new(
            ExprKind::GetAttr {
                expr: Arc::new(expr),
                attr: attr.into(),
            },
            self.data,
        )
    }

    /// Create an `Expr` which tests for the existence of a given attribute on
    /// a given entity or record.
    pub fn has_attr(self, expr: Expr<T>, attr: impl Into<SmolStr>) -> Expr<T> {
        Expr::new(
            ExprKind::HasAttr {
                expr: Arc::new(expr),
                attr: attr.into(),
            },
            self.data,
        )
    }

    /// Create an 'is' expression.
    pub fn is_entity_type(self, expr: Expr<T>, entity_type: EntityType) -> Expr<T> {
        Expr::new(
            ExprKind::Is {
                expr: Arc::new(expr),
                entity_type,
            },
            self.data,
        )
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::ast::EntityUID;

    #[test]
    fn builders_agree() {
        assert_eq!(
            Expr::and(Expr::val(true), Expr::val(false)),
            ExprBuilder::new().and(
                ExprBuilder::new().val(true),
                ExprBuilder::new().val(false)
            )
        );
        assert_eq!(
            Expr::get_attr(Expr::var(Var::Principal), "foo"),
            ExprBuilder::new().get_attr(ExprBuilder::new().var(Var::Principal), "foo")
        );
    }

    #[test]
    fn annotated_exprs_compare_data() {
        let unannotated = ExprBuilder::<Option<u32>>::new().val(1);
        let annotated = ExprBuilder::with_data(Some(7)).val(1);
        assert_ne!(unannotated, annotated);
        assert_eq!(annotated.data(), &Some(7));
    }

    #[test]
    fn euid_literal_accessor() {
        let euid = EntityUID::with_eid("alice");
        let e = Expr::val(euid.clone());
        assert_eq!(e.as_euid_lit().map(|e| e.as_ref()), Some(&euid));
        assert_eq!(Expr::val(1).as_euid_lit(), None);
    }
}
