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

//! End-to-end agreement between the typechecker and the evaluator: values of
//! well-typed expressions inhabit their inferred types, and statically
//! resolved `True`/`False` types match the evaluated result.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use palisade_core::ast::{
    Entity, EntityUID, Expr, Literal, Request, StaticallyTyped, Value, Var,
};
use palisade_core::entities::{Entities, TCComputation};
use palisade_core::evaluator::Evaluator;
use palisade_core::extensions::Extensions;
use palisade_core::validator::types::EntityRecordKind;
use palisade_core::validator::{Type, Typechecker, ValidatorSchema};

fn schema() -> ValidatorSchema {
    ValidatorSchema::from_json_value(serde_json::json!(
        {
            "entityTypes": {
                "User": {
                    "memberOfTypes": ["Group"],
                    "shape": {
                        "type": "Record",
                        "attributes": {
                            "age": { "type": "Long" },
                            "friends": { "type": "Set", "element": { "type": "Entity", "name": "User" } },
                            "manager": { "type": "Entity", "name": "User", "required": false }
                        }
                    }
                },
                "Group": {},
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

fn user(eid: &str) -> EntityUID {
    EntityUID::with_eid_and_type("User", eid).expect("valid")
}

fn entities() -> Entities {
    let alice = Entity::new(
        user("alice"),
        [
            ("age".into(), Value::from(31)),
            (
                "friends".into(),
                Value::set([Value::from(user("bob"))]),
            ),
            ("manager".into(), Value::from(user("bob"))),
        ],
        [EntityUID::with_eid_and_type("Group", "admins").expect("valid")],
        [],
    );
    let bob = Entity::new(
        user("bob"),
        [
            ("age".into(), Value::from(44)),
            ("friends".into(), Value::empty_set()),
        ],
        [],
        [],
    );
    let admins = Entity::with_uid(EntityUID::with_eid_and_type("Group", "admins").expect("valid"));
    let vacation = Entity::new(
        EntityUID::with_eid_and_type("Photo", "vacation").expect("valid"),
        [("owner".into(), Value::from(user("alice")))],
        [],
        [],
    );
    Entities::from_entities([alice, bob, admins, vacation], TCComputation::ComputeNow)
        .expect("valid store")
}

fn request() -> Request {
    Request::new(
        user("alice"),
        EntityUID::with_eid_and_type("Action", "view").expect("valid"),
        EntityUID::with_eid_and_type("Photo", "vacation").expect("valid"),
        Value::record([("mfa", Value::from(true))]),
    )
    .expect("context is a record")
}

/// Check that a runtime value inhabits a static type.
fn value_has_type(value: &Value, ty: &Type) -> bool {
    match ty {
        Type::Never => false,
        Type::True => value == &Value::from(true),
        Type::False => value == &Value::from(false),
        _ if *ty == Type::primitive_boolean() => {
            matches!(value, Value::Lit(Literal::Bool(_)))
        }
        _ if *ty == Type::primitive_long() => matches!(value, Value::Lit(Literal::Long(_))),
        _ if *ty == Type::primitive_string() => {
            matches!(value, Value::Lit(Literal::String(_)))
        }
        Type::Set { element_type } => match value {
            Value::Set(set) => match element_type {
                Some(elem_ty) => set.iter().all(|v| value_has_type(v, elem_ty)),
                None => true,
            },
            _ => false,
        },
        Type::EntityOrRecord(EntityRecordKind::Entity { ty, .. }) => match value {
            Value::Lit(Literal::EntityUID(uid)) => uid.entity_type() == ty,
            _ => false,
        },
        Type::EntityOrRecord(EntityRecordKind::AnyEntity) => {
            matches!(value, Value::Lit(Literal::EntityUID(_)))
        }
        Type::EntityOrRecord(EntityRecordKind::Record { attrs, .. }) => match value {
            Value::Record(record) => attrs.iter().all(|(name, attr_ty)| {
                match record.get(name.as_str()) {
                    Some(v) => value_has_type(v, &attr_ty.attr_type),
                    None => !attr_ty.is_required,
                }
            }),
            _ => false,
        },
        Type::ExtensionType { name } => match value.type_of() {
            palisade_core::ast::Type::Extension { name: actual } => &actual == name,
            _ => false,
        },
        _ => false,
    }
}

/// A collection of well-typed expressions covering every expression kind.
fn well_typed_exprs() -> Vec<Expr> {
    let principal = Expr::var(Var::Principal);
    let decimal = |s: &str| {
        Expr::call_extension_fn(
            "decimal".parse().expect("valid name"),
            vec![Expr::val(s)],
        )
    };
    vec![
        Expr::val(true),
        Expr::val(-3),
        Expr::val("hello"),
        Expr::var(Var::Resource),
        Expr::var(Var::Context),
        Expr::and(
            Expr::less(Expr::get_attr(principal.clone(), "age"), Expr::val(65)),
            Expr::val(true),
        ),
        Expr::or(Expr::val(false), Expr::get_attr(Expr::var(Var::Context), "mfa")),
        Expr::not(Expr::get_attr(Expr::var(Var::Context), "mfa")),
        Expr::neg(Expr::get_attr(principal.clone(), "age")),
        Expr::add(Expr::get_attr(principal.clone(), "age"), Expr::val(10)),
        Expr::mul(Expr::get_attr(principal.clone(), "age"), Expr::val(2)),
        Expr::ite(
            Expr::get_attr(Expr::var(Var::Context), "mfa"),
            Expr::get_attr(principal.clone(), "age"),
            Expr::val(0),
        ),
        Expr::is_eq(principal.clone(), Expr::var(Var::Resource)),
        Expr::is_eq(principal.clone(), Expr::val(user("alice"))),
        Expr::is_in(principal.clone(), Expr::val(EntityUID::with_eid_and_type("Group", "admins").expect("valid"))),
        Expr::is_entity_type(principal.clone(), "User".parse().expect("valid")),
        Expr::contains(
            Expr::get_attr(principal.clone(), "friends"),
            Expr::val(user("bob")),
        ),
        Expr::contains_all(
            Expr::get_attr(principal.clone(), "friends"),
            Expr::get_attr(principal.clone(), "friends"),
        ),
        Expr::contains_any(
            Expr::get_attr(principal.clone(), "friends"),
            Expr::set([Expr::val(user("bob")), Expr::val(user("carol"))]),
        ),
        Expr::has_attr(principal.clone(), "manager"),
        Expr::and(
            Expr::has_attr(principal.clone(), "manager"),
            Expr::is_eq(
                Expr::get_attr(principal.clone(), "manager"),
                Expr::val(user("bob")),
            ),
        ),
        Expr::get_attr(Expr::var(Var::Resource), "owner"),
        Expr::set([Expr::val(1), Expr::val(2)]),
        Expr::record([("a", Expr::val(1)), ("b", Expr::val("x"))]),
        decimal("12.34"),
        Expr::call_extension_fn(
            "lessThan".parse().expect("valid name"),
            vec![decimal("1.0"), decimal("2.0")],
        ),
        Expr::is_in(
            Expr::var(Var::Action),
            Expr::val(EntityUID::with_eid_and_type("Action", "readOnly").expect("valid")),
        ),
    ]
}

#[test]
fn well_typed_expressions_evaluate_to_their_types() {
    let schema = schema();
    let typechecker = Typechecker::new(&schema);
    let env = schema.request_envs().next().expect("at least one env");
    let entities = entities();
    let actions = schema.action_hierarchy();
    let request = request();
    let eval = Evaluator::new(&request, &entities, Extensions::all_available())
        .with_action_hierarchy(&actions);

    for e in well_typed_exprs() {
        let (typed, _) = typechecker
            .typecheck_expr(&e, &env)
            .unwrap_or_else(|errs| panic!("{e:?} should typecheck, got {errs:?}"));
        let inferred = typed.data().clone().expect("successful typecheck has a type");
        let value = eval
            .interpret(&e)
            .unwrap_or_else(|err| panic!("{e:?} should evaluate, got {err}"));
        assert!(
            value_has_type(&value, &inferred),
            "value {value} of {e:?} does not inhabit inferred type {inferred}"
        );
    }
}

/// The entity-type equality shortcut: when two entity types have no least
/// upper bound, `==` types to `False`, and runtime evaluation agrees for
/// arbitrary entity values of those types.
#[test]
fn entity_eq_shortcut_agrees_with_runtime() {
    let schema = schema();
    let typechecker = Typechecker::new(&schema);
    let env = schema.request_envs().next().expect("at least one env");
    let entities = entities();
    let request = request();
    let eval = Evaluator::new(&request, &entities, Extensions::none());

    let e = Expr::is_eq(Expr::var(Var::Principal), Expr::var(Var::Resource));
    let (typed, _) = typechecker.typecheck_expr(&e, &env).expect("typechecks");
    assert_eq!(typed.data(), &Some(Type::False));
    assert_eq!(eval.interpret(&e), Ok(Value::from(false)));

    // also through attributes: a User-typed attribute can never equal a
    // Photo-typed variable
    let e = Expr::is_eq(
        Expr::get_attr(Expr::var(Var::Resource), "owner"),
        Expr::var(Var::Resource),
    );
    let (typed, _) = typechecker.typecheck_expr(&e, &env).expect("typechecks");
    assert_eq!(typed.data(), &Some(Type::False));
    assert_eq!(eval.interpret(&e), Ok(Value::from(false)));
}

/// The action-hierarchy shortcut: `in` between literal action UIDs resolves
/// at typecheck time to exactly the result the evaluator computes from the
/// schema's action hierarchy.
#[test]
fn action_in_shortcut_agrees_with_runtime() {
    let schema = schema();
    let typechecker = Typechecker::new(&schema);
    let env = schema.request_envs().next().expect("at least one env");
    let entities = entities();
    let actions = schema.action_hierarchy();
    let request = request();
    let eval =
        Evaluator::new(&request, &entities, Extensions::none()).with_action_hierarchy(&actions);

    let view = EntityUID::with_eid_and_type("Action", "view").expect("valid");
    let read_only = EntityUID::with_eid_and_type("Action", "readOnly").expect("valid");

    for (lhs, rhs) in [
        (view.clone(), read_only.clone()),
        (read_only.clone(), view.clone()),
        (view.clone(), view.clone()),
        (read_only.clone(), read_only),
    ] {
        let e = Expr::is_in(Expr::val(lhs), Expr::val(rhs));
        let (typed, _) = typechecker.typecheck_expr(&e, &env).expect("typechecks");
        let static_result = match typed.data() {
            Some(Type::True) => true,
            Some(Type::False) => false,
            other => panic!("action-literal `in` should be statically resolved, got {other:?}"),
        };
        assert_eq!(
            eval.interpret(&e),
            Ok(Value::from(static_result)),
            "static and runtime `in` disagree for {e:?}"
        );
    }
}
