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

//! Level-bounded entity slicer.
//!
//! Given a request and a level bound `n`, the slicer extracts the subset of
//! the entity store reachable from the request's roots (principal, action,
//! resource, and the entity references in the context record) by at most `n`
//! attribute or tag dereferences. Evaluating an expression that passes level
//! validation at `n` against the slice gives the same result as evaluating it
//! against the full store.

use crate::ast::{EntityUID, Request, Value};
use crate::entities::{Entities, TCComputation};
use std::collections::HashSet;

/// Level-bounded entity slicer over a concrete entity store.
#[derive(Debug, Clone)]
pub struct EntitySlicer<'s> {
    store: &'s Entities,
}

impl<'s> EntitySlicer<'s> {
    /// Construct a slicer over the given store.
    pub fn new(store: &'s Entities) -> Self {
        Self { store }
    }

    /// Compute the slice of the store sufficient to evaluate any expression
    /// that passes level validation at `level` for this request.
    ///
    /// The frontier starts with the request entities and every entity UID
    /// mentioned in the context record; each round of the walk includes the
    /// frontier's entity records and advances to the entity UIDs mentioned in
    /// their attribute and tag values. The walk is bounded by `level`, so
    /// cyclic attribute references terminate. Ancestor UIDs travel with each
    /// included record as data; they never extend the frontier, since the
    /// hierarchy is not traversable by expressions.
    pub fn slice_at_level(&self, request: &Request, level: u32) -> Entities {
        let mut frontier: Vec<EntityUID> = vec![
            request.principal().clone(),
            request.action().clone(),
            request.resource().clone(),
        ];
        collect_entity_uids(request.context(), &mut frontier);

        let mut included: HashSet<EntityUID> = HashSet::new();
        let mut slice = Vec::new();
        for _ in 0..level {
            let mut next_frontier = Vec::new();
            for uid in frontier {
                if !included.insert(uid.clone()) {
                    continue;
                }
                if let Some(entity) = self.store.entity(&uid) {
                    for (_, val) in entity.attrs() {
                        collect_entity_uids(val, &mut next_frontier);
                    }
                    for (_, val) in entity.tags() {
                        collect_entity_uids(val, &mut next_frontier);
                    }
                    slice.push(entity.clone());
                }
            }
            frontier = next_frontier;
        }

        // The input store was transitively closed, and every entity is copied
        // whole, so the slice is closed too.
        // PANIC SAFETY: `included` guarantees each entity is added once, so
        // the only `from_entities` error (duplicates) cannot occur
        #[allow(clippy::unwrap_used)]
        Entities::from_entities(slice, TCComputation::AssumeAlreadyComputed).unwrap()
    }
}

/// Push every entity UID appearing in `value` (at any nesting depth) onto
/// `out`.
fn collect_entity_uids(value: &Value, out: &mut Vec<EntityUID>) {
    match value {
        Value::Lit(crate::ast::Literal::EntityUID(uid)) => out.push(uid.as_ref().clone()),
        Value::Lit(_) | Value::ExtensionValue(_) => {}
        Value::Set(set) => {
            for v in set.iter() {
                collect_entity_uids(v, out);
            }
        }
        Value::Record(record) => {
            for v in record.values() {
                collect_entity_uids(v, out);
            }
        }
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::ast::{Entity, EntityUID, Expr, Var};
    use crate::entities::ActionHierarchy;
    use crate::evaluator::Evaluator;
    use crate::extensions::Extensions;
    use crate::validator::test_utils::test_schema;
    use crate::validator::typecheck::Typechecker;
    use crate::validator::{level_satisfied, validate_level};

    fn user(eid: &str) -> EntityUID {
        EntityUID::with_eid_and_type("User", eid).expect("valid")
    }

    fn group(eid: &str) -> EntityUID {
        EntityUID::with_eid_and_type("Group", eid).expect("valid")
    }

    fn photo(eid: &str) -> EntityUID {
        EntityUID::with_eid_and_type("Photo", eid).expect("valid")
    }

    /// A chain of managers: alice -> bob -> carol, with alice in the admins
    /// group, plus a photo owned by bob.
    fn full_entities() -> Entities {
        let alice = Entity::new(
            user("alice"),
            [
                ("age".into(), Value::from(31)),
                ("email".into(), Value::from("alice@example.com")),
                ("manager".into(), Value::from(user("bob"))),
                (
                    "nested".into(),
                    Value::record([("user", Value::from(user("bob")))]),
                ),
            ],
            [group("admins")],
            [("dept".into(), Value::from("eng"))],
        );
        let bob = Entity::new(
            user("bob"),
            [
                ("age".into(), Value::from(44)),
                ("email".into(), Value::from("bob@example.com")),
                ("manager".into(), Value::from(user("carol"))),
                (
                    "nested".into(),
                    Value::record([("user", Value::from(user("carol")))]),
                ),
            ],
            [],
            [],
        );
        let carol = Entity::new(
            user("carol"),
            [
                ("age".into(), Value::from(52)),
                ("email".into(), Value::from("carol@example.com")),
                (
                    "nested".into(),
                    Value::record([("user", Value::from(user("carol")))]),
                ),
            ],
            [],
            [],
        );
        let admins = Entity::with_uid(group("admins"));
        let vacation = Entity::new(
            photo("vacation"),
            [("owner".into(), Value::from(user("bob")))],
            [],
            [],
        );
        Entities::from_entities(
            [alice, bob, carol, admins, vacation],
            TCComputation::ComputeNow,
        )
        .expect("valid store")
    }

    fn request() -> Request {
        Request::new(
            user("alice"),
            EntityUID::with_eid_and_type("Action", "view").expect("valid"),
            photo("vacation"),
            Value::record([("mfa", Value::from(true))]),
        )
        .expect("context is a record")
    }

    #[test]
    fn slice_contents_by_level() {
        let entities = full_entities();
        let slicer = EntitySlicer::new(&entities);

        let slice0 = slicer.slice_at_level(&request(), 0);
        assert!(slice0.is_empty());

        let slice1 = slicer.slice_at_level(&request(), 1);
        assert!(slice1.entity(&user("alice")).is_some());
        assert!(slice1.entity(&photo("vacation")).is_some());
        // bob is only reachable through alice's attributes
        assert!(slice1.entity(&user("bob")).is_none());

        let slice2 = slicer.slice_at_level(&request(), 2);
        assert!(slice2.entity(&user("bob")).is_some());
        assert!(slice2.entity(&user("carol")).is_none());

        let slice3 = slicer.slice_at_level(&request(), 3);
        assert!(slice3.entity(&user("carol")).is_some());
    }

    /// Expressions used for the slice-equivalence property, paired with the
    /// level each passes at.
    fn leveled_exprs() -> Vec<(Expr, u32)> {
        vec![
            (
                Expr::is_eq(Expr::var(Var::Principal), Expr::val(user("alice"))),
                0,
            ),
            (Expr::get_attr(Expr::var(Var::Context), "mfa"), 0),
            (
                Expr::less(Expr::get_attr(Expr::var(Var::Principal), "age"), Expr::val(40)),
                1,
            ),
            (Expr::is_in(Expr::var(Var::Principal), Expr::val(group("admins"))), 1),
            (
                Expr::and(
                    Expr::has_tag(Expr::var(Var::Principal), Expr::val("dept")),
                    Expr::is_eq(
                        Expr::get_tag(Expr::var(Var::Principal), Expr::val("dept")),
                        Expr::val("eng"),
                    ),
                ),
                1,
            ),
            (
                Expr::and(
                    Expr::has_attr(Expr::var(Var::Principal), "manager"),
                    Expr::less(
                        Expr::get_attr(
                            Expr::get_attr(Expr::var(Var::Principal), "manager"),
                            "age",
                        ),
                        Expr::val(40),
                    ),
                ),
                2,
            ),
            (
                Expr::is_eq(
                    Expr::get_attr(
                        Expr::get_attr(
                            Expr::get_attr(Expr::var(Var::Principal), "nested"),
                            "user",
                        ),
                        "email",
                    ),
                    Expr::val("bob@example.com"),
                ),
                2,
            ),
            (
                Expr::is_eq(
                    Expr::get_attr(Expr::get_attr(Expr::var(Var::Resource), "owner"), "email"),
                    Expr::val("bob@example.com"),
                ),
                2,
            ),
        ]
    }

    /// The central soundness property of level slicing: if an expression
    /// passes level validation at `n`, evaluating it against the slice at `n`
    /// agrees with evaluating it against the full store.
    #[test]
    fn evaluation_agrees_on_slice() {
        let schema = test_schema();
        let typechecker = Typechecker::new(&schema);
        let env = schema.request_envs().next().expect("at least one env");
        let entities = full_entities();
        let slicer = EntitySlicer::new(&entities);
        let actions = schema.action_hierarchy();
        let request = request();

        for (e, level) in leveled_exprs() {
            let (typed, _) = typechecker
                .typecheck_expr(&e, &env)
                .expect("slice-equivalence exprs are well-typed");
            assert_eq!(
                validate_level(&typed, &env, level),
                Ok(()),
                "{e:?} should pass at level {level}"
            );

            let slice = slicer.slice_at_level(&request, level);
            let full_eval = Evaluator::new(&request, &entities, Extensions::all_available())
                .with_action_hierarchy(&actions);
            let slice_eval = Evaluator::new(&request, &slice, Extensions::all_available())
                .with_action_hierarchy(&actions);
            assert_eq!(
                full_eval.interpret(&e),
                slice_eval.interpret(&e),
                "{e:?} must agree between the full store and the level-{level} slice"
            );
        }
    }

    /// Sanity check in the other direction: an expression that does NOT pass
    /// at a level may disagree when evaluated against that level's slice, so
    /// the level check is doing real work.
    #[test]
    fn failing_level_can_disagree_on_slice() {
        let schema = test_schema();
        let typechecker = Typechecker::new(&schema);
        let env = schema.request_envs().next().expect("at least one env");
        let entities = full_entities();
        let slicer = EntitySlicer::new(&entities);
        let request = request();

        // requires level 2, checked against the level-1 slice
        let e = Expr::and(
            Expr::has_attr(Expr::var(Var::Principal), "manager"),
            Expr::less(
                Expr::get_attr(Expr::get_attr(Expr::var(Var::Principal), "manager"), "age"),
                Expr::val(40),
            ),
        );
        let (typed, _) = typechecker.typecheck_expr(&e, &env).expect("well-typed");
        assert!(!level_satisfied(&typed, &env, 1));

        let slice = slicer.slice_at_level(&request, 1);
        let full_eval = Evaluator::new(&request, &entities, Extensions::none());
        let slice_eval = Evaluator::new(&request, &slice, Extensions::none());
        // the full store finds bob's age; the slice can't dereference bob
        assert_eq!(full_eval.interpret(&e), Ok(Value::from(false)));
        assert!(slice_eval.interpret(&e).is_err());
    }

    #[test]
    fn action_in_unaffected_by_slicing() {
        let schema = test_schema();
        let entities = full_entities();
        let slicer = EntitySlicer::new(&entities);
        let actions = schema.action_hierarchy();
        let request = request();

        // action UIDs never live in the store, so even the empty slice
        // resolves action-hierarchy membership
        let e = Expr::is_in(
            Expr::var(Var::Action),
            Expr::val(EntityUID::with_eid_and_type("Action", "readOnly").expect("valid")),
        );
        let slice = slicer.slice_at_level(&request, 1);
        let slice_eval = Evaluator::new(&request, &slice, Extensions::none())
            .with_action_hierarchy(&actions);
        assert_eq!(slice_eval.interpret(&e), Ok(Value::from(true)));
    }

    #[test]
    fn context_entities_are_roots() {
        let entities = full_entities();
        let slicer = EntitySlicer::new(&entities);
        // a request whose context smuggles in carol directly
        let request = Request::new(
            user("alice"),
            EntityUID::with_eid_and_type("Action", "view").expect("valid"),
            photo("vacation"),
            Value::record([("requester", Value::from(user("carol")))]),
        )
        .expect("context is a record");
        let slice1 = slicer.slice_at_level(&request, 1);
        assert!(slice1.entity(&user("carol")).is_some());
    }
}
