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

//! This module contains the expression evaluator.

use crate::ast::*;
use crate::entities::{ActionHierarchy, Entities};
use crate::extensions::Extensions;
use std::sync::Arc;

mod err;
pub use err::{EvaluationError, EvaluationErrorKind, IntegerOverflowError, Result};

const REQUIRED_STACK_SPACE: usize = 1024 * 100;

// PANIC SAFETY `Name`s in here are valid `Name`s
#[allow(clippy::expect_used)]
mod names {
    use super::EntityType;
    lazy_static::lazy_static! {
        pub static ref ANY_ENTITY_TYPE : EntityType = "any_entity_type".parse().expect("valid identifier");
    }
}

/// Evaluator object.
///
/// Conceptually keeps the evaluation environment as part of its internal
/// state, because we will be repeatedly invoking the evaluator on every
/// condition of every policy in a policy set.
pub struct Evaluator<'e> {
    /// `Principal` for the current request
    principal: EntityUID,
    /// `Action` for the current request
    action: EntityUID,
    /// `Resource` for the current request
    resource: EntityUID,
    /// `Context` for the current request; this will be a Record type
    context: Value,
    /// Entities which we use to resolve entity references.
    ///
    /// This is a reference, because the `Evaluator` doesn't need ownership of
    /// (or need to modify) the `Entities`. One advantage of this is that you
    /// could create multiple `Evaluator`s without copying the `Entities`.
    entities: &'e Entities,
    /// Schema-declared action hierarchy, if available. When present, `in`
    /// checks whose left operand is an action UID are answered here rather
    /// than from `entities` -- action ancestors are declared by the schema,
    /// not by the runtime store.
    actions: Option<&'e ActionHierarchy>,
    /// Extensions which are active for this evaluation
    extensions: &'e Extensions<'e>,
}

impl<'e> Evaluator<'e> {
    /// Create a fresh `Evaluator` for the given `request`, which uses the
    /// given `Entities` to resolve entity references. Use the given
    /// `Extension`s when evaluating.
    pub fn new(q: &Request, entities: &'e Entities, extensions: &'e Extensions<'e>) -> Self {
        Self {
            principal: q.principal().clone(),
            action: q.action().clone(),
            resource: q.resource().clone(),
            context: q.context().clone(),
            entities,
            actions: None,
            extensions,
        }
    }

    /// Answer action-hierarchy `in` checks from the given schema-declared
    /// hierarchy instead of the entity store.
    pub fn with_action_hierarchy(self, actions: &'e ActionHierarchy) -> Self {
        Self {
            actions: Some(actions),
            ..self
        }
    }

    /// Interpret an `Expr` into a `Value` in this evaluation environment.
    ///
    /// May return an error, for instance if the `Expr` tries to access an
    /// attribute that doesn't exist.
    pub fn interpret(&self, e: &Expr) -> Result<Value> {
        stack_size_check()?;

        match e.expr_kind() {
            ExprKind::Lit(lit) => Ok(lit.clone().into()),
            ExprKind::Var(v) => match v {
                Var::Principal => Ok(self.principal.clone().into()),
                Var::Action => Ok(self.action.clone().into()),
                Var::Resource => Ok(self.resource.clone().into()),
                Var::Context => Ok(self.context.clone()),
            },
            ExprKind::If {
                test_expr,
                then_expr,
                else_expr,
            } => {
                // only the chosen branch is evaluated
                if self.interpret(test_expr)?.get_as_bool()? {
                    self.interpret(then_expr)
                } else {
                    self.interpret(else_expr)
                }
            }
            ExprKind::And { left, right } => {
                if self.interpret(left)?.get_as_bool()? {
                    Ok(self.interpret(right)?.get_as_bool()?.into())
                } else {
                    // We can short circuit here
                    Ok(false.into())
                }
            }
            ExprKind::Or { left, right } => {
                if self.interpret(left)?.get_as_bool()? {
                    // We can short circuit here
                    Ok(true.into())
                } else {
                    Ok(self.interpret(right)?.get_as_bool()?.into())
                }
            }
            ExprKind::UnaryApp { op, arg } => {
                let arg = self.interpret(arg)?;
                match op {
                    UnaryOp::Not => match arg.get_as_bool()? {
                        true => Ok(false.into()),
                        false => Ok(true.into()),
                    },
                    UnaryOp::Neg => {
                        let i = arg.get_as_long()?;
                        match i.checked_neg() {
                            Some(v) => Ok(v.into()),
                            None => Err(IntegerOverflowError::UnaryOp { op: *op, arg }.into()),
                        }
                    }
                }
            }
            ExprKind::BinaryApp { op, arg1, arg2 } => {
                // both arguments are evaluated eagerly, left to right, so the
                // left argument's error surfaces before the right argument is
                // touched
                let arg1 = self.interpret(arg1)?;
                let arg2 = self.interpret(arg2)?;
                match op {
                    BinaryOp::Eq => Ok((arg1 == arg2).into()),
                    // comparison and arithmetic operators, which only work on Longs
                    BinaryOp::Less
                    | BinaryOp::LessEq
                    | BinaryOp::Add
                    | BinaryOp::Sub
                    | BinaryOp::Mul => {
                        let i1 = arg1.get_as_long()?;
                        let i2 = arg2.get_as_long()?;
                        match op {
                            BinaryOp::Less => Ok((i1 < i2).into()),
                            BinaryOp::LessEq => Ok((i1 <= i2).into()),
                            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                                let result = match op {
                                    BinaryOp::Add => i1.checked_add(i2),
                                    BinaryOp::Sub => i1.checked_sub(i2),
                                    _ => i1.checked_mul(i2),
                                };
                                match result {
                                    Some(v) => Ok(v.into()),
                                    None => Err(IntegerOverflowError::BinaryOp {
                                        op: *op,
                                        arg1,
                                        arg2,
                                    }
                                    .into()),
                                }
                            }
                            // PANIC SAFETY `op` is checked to be one of the above
                            #[allow(clippy::unreachable)]
                            _ => {
                                unreachable!("Should have already checked that op was one of these")
                            }
                        }
                    }
                    // hierarchy membership operator; see note on `BinaryOp::In`
                    BinaryOp::In => {
                        let uid1 = arg1.get_as_entity().map_err(|mut e| {
                            // If arg1 is not an entity and arg2 is a set, then
                            // possibly the user intended `arg2.contains(arg1)`
                            // rather than `arg1 in arg2`. If arg2 is a record,
                            // then possibly they intended `arg2 has arg1`.
                            if matches!(e.error_kind(), EvaluationErrorKind::TypeError { .. }) {
                                match arg2 {
                                    Value::Set(_) => e.set_advice("`in` is for checking the entity hierarchy; use `.contains()` to test set membership".into()),
                                    Value::Record(_) => e.set_advice("`in` is for checking the entity hierarchy; use `has` to test if a record has a key".into()),
                                    _ => {}
                                }
                            };
                            e
                        })?;
                        let rhs = eval_in_rhs_as_vec(&arg2)?;
                        self.eval_in(uid1, &rhs)
                    }
                    // contains, which works on Sets
                    BinaryOp::Contains => match &arg1 {
                        Value::Set(s) => Ok(s.contains(&arg2).into()),
                        _ => Err(EvaluationError::type_error(vec![Type::Set], arg1.type_of())),
                    },
                    // ContainsAll and ContainsAny, which work on Sets
                    BinaryOp::ContainsAll | BinaryOp::ContainsAny => {
                        let arg1_set = arg1.get_as_set()?;
                        let arg2_set = arg2.get_as_set()?;
                        match (&arg1_set.fast, &arg2_set.fast) {
                            (Some(arg1_set), Some(arg2_set)) => {
                                // both sets are in fast form, ie, they only contain literals.
                                // Fast hashset-based implementation.
                                match op {
                                    BinaryOp::ContainsAll => {
                                        Ok((arg2_set.is_subset(arg1_set)).into())
                                    }
                                    _ => Ok((!arg1_set.is_disjoint(arg2_set)).into()),
                                }
                            }
                            (_, _) => {
                                // one or both sets are in slow form, ie, contain a non-literal.
                                // Fallback to slow implementation.
                                match op {
                                    BinaryOp::ContainsAll => {
                                        let is_subset = arg2_set
                                            .authoritative
                                            .iter()
                                            .all(|item| arg1_set.authoritative.contains(item));
                                        Ok(is_subset.into())
                                    }
                                    _ => {
                                        let not_disjoint = arg1_set
                                            .authoritative
                                            .iter()
                                            .any(|item| arg2_set.authoritative.contains(item));
                                        Ok(not_disjoint.into())
                                    }
                                }
                            }
                        }
                    }
                    BinaryOp::GetTag => {
                        let uid = Arc::clone(arg1.get_as_entity_arc()?);
                        let tag = arg2.get_as_string()?.clone();
                        match self.entities.entity(&uid) {
                            None => Err(EvaluationError::entity_does_not_exist(uid)),
                            Some(entity) => entity.get_tag(&tag).cloned().ok_or_else(|| {
                                EvaluationError::entity_tag_does_not_exist(uid, tag)
                            }),
                        }
                    }
                    BinaryOp::HasTag => {
                        let uid = arg1.get_as_entity()?;
                        let tag = arg2.get_as_string()?;
                        match self.entities.entity(uid) {
                            // a nonexistent entity has no tags
                            None => Ok(false.into()),
                            Some(entity) => Ok(entity.get_tag(tag).is_some().into()),
                        }
                    }
                }
            }
            ExprKind::ExtensionFunctionApp { fn_name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.interpret(arg))
                    .collect::<Result<Vec<_>>>()?;
                let efunc = self.extensions.func(fn_name)?;
                efunc.call(&args)
            }
            ExprKind::GetAttr { expr, attr } => self.get_attr(expr.as_ref(), attr),
            ExprKind::HasAttr { expr, attr } => match self.interpret(expr)? {
                Value::Record(record) => Ok(record.get(attr).is_some().into()),
                Value::Lit(Literal::EntityUID(uid)) => match self.entities.entity(&uid) {
                    // a nonexistent entity has no attributes
                    None => Ok(false.into()),
                    Some(entity) => Ok(entity.get(attr).is_some().into()),
                },
                val => Err(EvaluationError::type_error(
                    vec![
                        Type::Record,
                        Type::entity_type(names::ANY_ENTITY_TYPE.clone()),
                    ],
                    val.type_of(),
                )),
            },
            ExprKind::Is { expr, entity_type } => {
                let uid = self.interpret(expr)?;
                let uid = uid.get_as_entity()?;
                Ok((uid.entity_type() == entity_type).into())
            }
            ExprKind::Set(items) => {
                let vals = items
                    .iter()
                    .map(|item| self.interpret(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::set(vals))
            }
            ExprKind::Record(map) => {
                let map = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.interpret(v)?)))
                    .collect::<Result<std::collections::BTreeMap<_, _>>>()?;
                Ok(Value::Record(Arc::new(map)))
            }
        }
    }

    fn eval_in(&self, uid1: &EntityUID, rhs: &[EntityUID]) -> Result<Value> {
        // Action UIDs are checked against the schema-declared action
        // hierarchy when one was supplied; the runtime store's ancestors are
        // not consulted for them.
        if uid1.is_action() {
            if let Some(actions) = self.actions {
                return Ok(rhs.iter().any(|uid2| actions.action_in(uid1, uid2)).into());
            }
        }
        Ok(rhs
            .iter()
            .any(|uid2| self.entities.entity_in(uid1, uid2))
            .into())
    }

    fn get_attr(&self, expr: &Expr, attr: &smol_str::SmolStr) -> Result<Value> {
        match self.interpret(expr)? {
            Value::Record(attrs) => attrs
                .as_ref()
                .get(attr)
                .ok_or_else(|| {
                    EvaluationError::record_attr_does_not_exist(
                        attr.clone(),
                        attrs.keys().cloned().collect(),
                    )
                })
                .cloned(),
            Value::Lit(Literal::EntityUID(uid)) => match self.entities.entity(&uid) {
                None => Err(EvaluationError::entity_does_not_exist(uid)),
                Some(entity) => entity.get(attr).cloned().ok_or_else(|| {
                    EvaluationError::entity_attr_does_not_exist(uid, attr.clone())
                }),
            },
            v => Err(EvaluationError::type_error(
                vec![
                    Type::Record,
                    Type::entity_type(names::ANY_ENTITY_TYPE.clone()),
                ],
                v.type_of(),
            )),
        }
    }
}

impl std::fmt::Debug for Evaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Evaluator with principal = {:?}, action = {:?}, resource = {:?}>",
            &self.principal, &self.action, &self.resource
        )
    }
}

/// `rhs` of an `in` is a list of all the UIDs for which we need to check if
/// the lhs is a descendant of
fn eval_in_rhs_as_vec(rhs: &Value) -> Result<Vec<EntityUID>> {
    match rhs {
        Value::Lit(Literal::EntityUID(uid)) => Ok(vec![(**uid).clone()]),
        Value::Set(set) => set
            .iter()
            .map(|val| Ok(val.get_as_entity()?.clone()))
            .collect::<Result<Vec<EntityUID>>>(),
        _ => Err(EvaluationError::type_error(
            vec![
                Type::Set,
                Type::entity_type(names::ANY_ENTITY_TYPE.clone()),
            ],
            rhs.type_of(),
        )),
    }
}

impl Value {
    /// Convert the `Value` to a boolean, or throw a type error if it's not a
    /// boolean.
    pub(crate) fn get_as_bool(&self) -> Result<bool> {
        match self {
            Value::Lit(Literal::Bool(b)) => Ok(*b),
            _ => Err(EvaluationError::type_error(
                vec![Type::Bool],
                self.type_of(),
            )),
        }
    }

    /// Convert the `Value` to a Long, or throw a type error if it's not a
    /// Long.
    pub(crate) fn get_as_long(&self) -> Result<Integer> {
        match self {
            Value::Lit(Literal::Long(i)) => Ok(*i),
            _ => Err(EvaluationError::type_error(
                vec![Type::Long],
                self.type_of(),
            )),
        }
    }

    /// Convert the `Value` to a String, or throw a type error if it's not a
    /// String.
    pub(crate) fn get_as_string(&self) -> Result<&smol_str::SmolStr> {
        match self {
            Value::Lit(Literal::String(s)) => Ok(s),
            _ => Err(EvaluationError::type_error(
                vec![Type::String],
                self.type_of(),
            )),
        }
    }

    /// Convert the `Value` to a Set, or throw a type error if it's not a Set.
    pub(crate) fn get_as_set(&self) -> Result<&Set> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(EvaluationError::type_error(vec![Type::Set], self.type_of())),
        }
    }

    /// Convert the `Value` to an Entity, or throw a type error if it's not an
    /// Entity.
    pub(crate) fn get_as_entity(&self) -> Result<&EntityUID> {
        self.get_as_entity_arc().map(AsRef::as_ref)
    }

    /// Like `get_as_entity`, but exposing the `Arc` so callers can share it.
    pub(crate) fn get_as_entity_arc(&self) -> Result<&Arc<EntityUID>> {
        match self {
            Value::Lit(Literal::EntityUID(uid)) => Ok(uid),
            _ => Err(EvaluationError::type_error(
                vec![Type::entity_type(names::ANY_ENTITY_TYPE.clone())],
                self.type_of(),
            )),
        }
    }
}

#[inline(always)]
fn stack_size_check() -> Result<()> {
    if stacker::remaining_stack().unwrap_or(0) < REQUIRED_STACK_SPACE {
        return Err(EvaluationError::recursion_limit());
    }
    Ok(())
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod test {
    use super::*;
    use crate::entities::TCComputation;
    use cool_asserts::assert_matches;

    /// the request used for most evaluator tests: principal `test_entity_type::"alice"`,
    /// action `Action::"view"`, resource `test_entity_type::"doc"`, context `{cur_time: "03:22:11"}`
    pub(crate) fn basic_request() -> Request {
        Request::new(
            EntityUID::with_eid("alice"),
            EntityUID::with_eid_and_type("Action", "view").expect("valid"),
            EntityUID::with_eid("doc"),
            Value::record([("cur_time", Value::from("03:22:11"))]),
        )
        .expect("context is a record")
    }

    /// basic store for evaluator tests:
    /// `alice` is in `friends` and has attrs and tags; `doc` has an owner
    pub(crate) fn basic_entities() -> Entities {
        let alice = Entity::new(
            EntityUID::with_eid("alice"),
            [
                ("age".into(), Value::from(41)),
                ("spouse".into(), Value::from(EntityUID::with_eid("bob"))),
            ],
            [EntityUID::with_eid("friends")],
            [("dept".into(), Value::from("eng"))],
        );
        let bob = Entity::new(
            EntityUID::with_eid("bob"),
            [("age".into(), Value::from(39))],
            [],
            [],
        );
        let doc = Entity::new(
            EntityUID::with_eid("doc"),
            [("owner".into(), Value::from(EntityUID::with_eid("alice")))],
            [],
            [],
        );
        let friends = Entity::with_uid(EntityUID::with_eid("friends"));
        Entities::from_entities([alice, bob, doc, friends], TCComputation::ComputeNow)
            .expect("valid store")
    }

    fn evaluator_on<'e>(entities: &'e Entities, exts: &'e Extensions<'e>) -> Evaluator<'e> {
        Evaluator::new(&basic_request(), entities, exts)
    }

    /// an expression that always errors at evaluation time (overflow)
    fn error_expr() -> Expr {
        Expr::add(Expr::val(Integer::MAX), Expr::val(1))
    }

    #[test]
    fn interpret_lits_and_vars() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        assert_eq!(eval.interpret(&Expr::val(true)), Ok(Value::from(true)));
        assert_eq!(eval.interpret(&Expr::val(-17)), Ok(Value::from(-17)));
        assert_eq!(eval.interpret(&Expr::val("hi")), Ok(Value::from("hi")));
        assert_eq!(
            eval.interpret(&Expr::var(Var::Principal)),
            Ok(Value::from(EntityUID::with_eid("alice")))
        );
        assert_eq!(
            eval.interpret(&Expr::get_attr(Expr::var(Var::Context), "cur_time")),
            Ok(Value::from("03:22:11"))
        );
    }

    #[test]
    fn short_circuit_and_skips_error() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        assert_eq!(
            eval.interpret(&Expr::and(Expr::val(false), error_expr())),
            Ok(Value::from(false))
        );
        // but a true lhs forces evaluation of the rhs
        assert_matches!(
            eval.interpret(&Expr::and(Expr::val(true), error_expr())),
            Err(e) => assert_matches!(
                e.error_kind(),
                EvaluationErrorKind::IntegerOverflow(_)
            )
        );
    }

    #[test]
    fn short_circuit_or_skips_error() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        assert_eq!(
            eval.interpret(&Expr::or(Expr::val(true), error_expr())),
            Ok(Value::from(true))
        );
        assert_matches!(
            eval.interpret(&Expr::or(Expr::val(false), error_expr())),
            Err(_)
        );
    }

    #[test]
    fn left_operand_error_wins() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        // the lhs error surfaces even though the rhs would error too
        assert_matches!(
            eval.interpret(&Expr::add(error_expr(), Expr::get_attr(Expr::val(3), "x"))),
            Err(e) => assert_matches!(
                e.error_kind(),
                EvaluationErrorKind::IntegerOverflow(_)
            )
        );
    }

    #[test]
    fn ite_evaluates_only_chosen_branch() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        assert_eq!(
            eval.interpret(&Expr::ite(Expr::val(true), Expr::val(1), error_expr())),
            Ok(Value::from(1))
        );
        assert_eq!(
            eval.interpret(&Expr::ite(Expr::val(false), error_expr(), Expr::val(2))),
            Ok(Value::from(2))
        );
        // non-boolean guard is a type error
        assert_matches!(
            eval.interpret(&Expr::ite(Expr::val(7), Expr::val(1), Expr::val(2))),
            Err(e) => assert_eq!(
                e.error_kind(),
                &EvaluationErrorKind::TypeError {
                    expected: vec![Type::Bool],
                    actual: Type::Long,
                }
            )
        );
    }

    #[test]
    fn arithmetic_is_checked() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        assert_eq!(
            eval.interpret(&Expr::add(Expr::val(1), Expr::val(2))),
            Ok(Value::from(3))
        );
        assert_eq!(
            eval.interpret(&Expr::mul(Expr::val(6), Expr::val(-7))),
            Ok(Value::from(-42))
        );
        assert_matches!(
            eval.interpret(&Expr::add(Expr::val(Integer::MAX), Expr::val(1))),
            Err(e) => assert_matches!(e.error_kind(), EvaluationErrorKind::IntegerOverflow(_))
        );
        assert_matches!(
            eval.interpret(&Expr::sub(Expr::val(Integer::MIN), Expr::val(1))),
            Err(e) => assert_matches!(e.error_kind(), EvaluationErrorKind::IntegerOverflow(_))
        );
        assert_matches!(
            eval.interpret(&Expr::mul(Expr::val(Integer::MAX), Expr::val(2))),
            Err(e) => assert_matches!(e.error_kind(), EvaluationErrorKind::IntegerOverflow(_))
        );
        assert_matches!(
            eval.interpret(&Expr::neg(Expr::val(Integer::MIN))),
            Err(e) => assert_matches!(e.error_kind(), EvaluationErrorKind::IntegerOverflow(_))
        );
    }

    #[test]
    fn eq_is_total() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        // different runtime types compare unequal, not error
        assert_eq!(
            eval.interpret(&Expr::is_eq(Expr::val(1), Expr::val("1"))),
            Ok(Value::from(false))
        );
        // sets compare by contents, not insertion order
        assert_eq!(
            eval.interpret(&Expr::is_eq(
                Expr::set([Expr::val(1), Expr::val(2)]),
                Expr::set([Expr::val(2), Expr::val(1), Expr::val(2)])
            )),
            Ok(Value::from(true))
        );
    }

    #[test]
    fn entity_hierarchy_membership() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        let alice = Expr::val(EntityUID::with_eid("alice"));
        let friends = Expr::val(EntityUID::with_eid("friends"));
        let doc = Expr::val(EntityUID::with_eid("doc"));
        assert_eq!(
            eval.interpret(&Expr::is_in(alice.clone(), friends.clone())),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::is_in(alice.clone(), alice.clone())),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::is_in(alice.clone(), doc.clone())),
            Ok(Value::from(false))
        );
        // entity-in-set checks against each element
        assert_eq!(
            eval.interpret(&Expr::is_in(alice.clone(), Expr::set([doc, friends]))),
            Ok(Value::from(true))
        );
        // a UID not in the store is only in itself
        let ghost = Expr::val(EntityUID::with_eid("ghost"));
        assert_eq!(
            eval.interpret(&Expr::is_in(ghost.clone(), alice)),
            Ok(Value::from(false))
        );
        assert_eq!(
            eval.interpret(&Expr::is_in(ghost.clone(), ghost)),
            Ok(Value::from(true))
        );
    }

    #[test]
    fn in_type_errors_have_advice() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        assert_matches!(
            eval.interpret(&Expr::is_in(Expr::val(1), Expr::set([Expr::val(1)]))),
            Err(e) => assert!(e.advice().is_some_and(|a| a.contains("contains")))
        );
    }

    #[test]
    fn action_in_uses_schema_hierarchy_not_store() {
        use std::collections::HashSet;
        let entities = basic_entities();
        let view = EntityUID::with_eid_and_type("Action", "view").expect("valid");
        let read_only = EntityUID::with_eid_and_type("Action", "readOnly").expect("valid");
        let hierarchy = ActionHierarchy::from_ancestor_sets([(
            view.clone(),
            HashSet::from([read_only.clone()]),
        )]);
        let eval = evaluator_on(&entities, Extensions::none()).with_action_hierarchy(&hierarchy);
        assert_eq!(
            eval.interpret(&Expr::is_in(
                Expr::val(view.clone()),
                Expr::val(read_only.clone())
            )),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::is_in(Expr::val(read_only), Expr::val(view))),
            Ok(Value::from(false))
        );
    }

    #[test]
    fn attribute_access() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        let alice = Expr::val(EntityUID::with_eid("alice"));
        assert_eq!(
            eval.interpret(&Expr::get_attr(alice.clone(), "age")),
            Ok(Value::from(41))
        );
        // chained through an entity-valued attribute
        assert_eq!(
            eval.interpret(&Expr::get_attr(
                Expr::get_attr(alice.clone(), "spouse"),
                "age"
            )),
            Ok(Value::from(39))
        );
        assert_matches!(
            eval.interpret(&Expr::get_attr(alice.clone(), "ssn")),
            Err(e) => assert_matches!(
                e.error_kind(),
                EvaluationErrorKind::EntityAttrDoesNotExist { .. }
            )
        );
        // getattr on a nonexistent entity is an error...
        assert_matches!(
            eval.interpret(&Expr::get_attr(Expr::val(EntityUID::with_eid("ghost")), "age")),
            Err(e) => assert_matches!(
                e.error_kind(),
                EvaluationErrorKind::EntityDoesNotExist(_)
            )
        );
        // ...but hasattr on a nonexistent entity is just false
        assert_eq!(
            eval.interpret(&Expr::has_attr(Expr::val(EntityUID::with_eid("ghost")), "age")),
            Ok(Value::from(false))
        );
        assert_eq!(
            eval.interpret(&Expr::has_attr(alice.clone(), "age")),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::has_attr(alice, "ssn")),
            Ok(Value::from(false))
        );
    }

    #[test]
    fn record_access() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        let rec = Expr::record([("a", Expr::val(3)), ("b", Expr::val("x"))]);
        assert_eq!(
            eval.interpret(&Expr::get_attr(rec.clone(), "a")),
            Ok(Value::from(3))
        );
        assert_matches!(
            eval.interpret(&Expr::get_attr(rec.clone(), "c")),
            Err(e) => assert_matches!(
                e.error_kind(),
                EvaluationErrorKind::RecordAttrDoesNotExist(_, _)
            )
        );
        assert_eq!(
            eval.interpret(&Expr::has_attr(rec, "b")),
            Ok(Value::from(true))
        );
    }

    #[test]
    fn tag_access() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        let alice = Expr::val(EntityUID::with_eid("alice"));
        assert_eq!(
            eval.interpret(&Expr::get_tag(alice.clone(), Expr::val("dept"))),
            Ok(Value::from("eng"))
        );
        assert_eq!(
            eval.interpret(&Expr::has_tag(alice.clone(), Expr::val("dept"))),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::has_tag(alice.clone(), Expr::val("team"))),
            Ok(Value::from(false))
        );
        assert_matches!(
            eval.interpret(&Expr::get_tag(alice, Expr::val("team"))),
            Err(e) => assert_matches!(
                e.error_kind(),
                EvaluationErrorKind::EntityTagDoesNotExist { .. }
            )
        );
    }

    #[test]
    fn is_entity_type_test() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        let alice = Expr::val(EntityUID::with_eid("alice"));
        assert_eq!(
            eval.interpret(&Expr::is_entity_type(
                alice.clone(),
                "test_entity_type".parse().expect("valid")
            )),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::is_entity_type(
                alice,
                "Other".parse().expect("valid")
            )),
            Ok(Value::from(false))
        );
    }

    #[test]
    fn set_operations() {
        let entities = basic_entities();
        let eval = evaluator_on(&entities, Extensions::none());
        let s = Expr::set([Expr::val(1), Expr::val(2), Expr::val(3)]);
        assert_eq!(
            eval.interpret(&Expr::contains(s.clone(), Expr::val(2))),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::contains(s.clone(), Expr::val(7))),
            Ok(Value::from(false))
        );
        assert_eq!(
            eval.interpret(&Expr::contains_all(
                s.clone(),
                Expr::set([Expr::val(1), Expr::val(3)])
            )),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::contains_all(
                Expr::set([Expr::val(1)]),
                s.clone()
            )),
            Ok(Value::from(false))
        );
        assert_eq!(
            eval.interpret(&Expr::contains_any(s.clone(), Expr::set([Expr::val(3), Expr::val(9)]))),
            Ok(Value::from(true))
        );
        assert_eq!(
            eval.interpret(&Expr::contains_any(s, Expr::set([Expr::val(9)]))),
            Ok(Value::from(false))
        );
        // slow-form sets (containing a non-literal element) agree with fast form
        let slow = Expr::set([Expr::set([Expr::val(1)]), Expr::val(2)]);
        assert_eq!(
            eval.interpret(&Expr::contains_any(
                slow,
                Expr::set([Expr::set([Expr::val(1)])])
            )),
            Ok(Value::from(true))
        );
    }
}
