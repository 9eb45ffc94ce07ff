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

//! Implementation of level validation: bounding the number of entity
//! dereferences (attribute accesses, tag accesses, and hierarchy membership
//! tests) an expression may chain from a request variable.

use crate::ast::{BinaryOp, Expr, ExprKind, Literal};
use crate::validator::types::{EntityRecordKind, RequestEnv, Type};
use crate::validator::validation_errors::LevelValidationError;
use smol_str::SmolStr;
use std::collections::HashSet;

/// Represents how many entity dereferences have been applied to a node.
#[derive(Default, Debug, Clone, Hash, Eq, PartialEq, Copy, Ord, PartialOrd)]
pub struct EntityDerefLevel {
    level: u32,
}

impl std::fmt::Display for EntityDerefLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level)
    }
}

impl From<u32> for EntityDerefLevel {
    fn from(value: u32) -> Self {
        EntityDerefLevel { level: value }
    }
}

impl EntityDerefLevel {
    fn increment(self) -> Self {
        (self.level + 1).into()
    }

    fn zero() -> Self {
        EntityDerefLevel { level: 0 }
    }
}

/// Check that every entity-dereference chain in the type-annotated expression
/// `e` stays within `max_level` hops of a request variable. Returns all level
/// violations found; an empty result means the expression passes at
/// `max_level`.
///
/// The expression must have passed the typechecker for the same request
/// environment; nodes the typechecker would have rejected are reported as
/// internal invariant violations.
pub fn validate_level(
    e: &Expr<Option<Type>>,
    env: &RequestEnv<'_>,
    max_level: u32,
) -> Result<(), Vec<LevelValidationError>> {
    let mut checker = LevelChecker {
        max_level: max_level.into(),
        level_checking_errors: HashSet::new(),
    };
    checker.check_expr_level(e, env);
    if checker.level_checking_errors.is_empty() {
        Ok(())
    } else {
        let mut errors: Vec<_> = checker.level_checking_errors.into_iter().collect();
        errors.sort_by_key(ToString::to_string);
        Err(errors)
    }
}

/// The boolean form of [`validate_level`]: does `e` stay within `max_level`?
pub fn level_satisfied(e: &Expr<Option<Type>>, env: &RequestEnv<'_>, max_level: u32) -> bool {
    validate_level(e, env, max_level).is_ok()
}

#[derive(Debug)]
struct LevelChecker {
    max_level: EntityDerefLevel,
    level_checking_errors: HashSet<LevelValidationError>,
}

impl LevelChecker {
    /// Check the level of the target of an entity dereference.
    ///
    /// We assume the expression has passed the typechecker, so the target of
    /// an entity dereference will be an entity-typed expression. If this
    /// function is initially called on a non-entity-typed expression it will
    /// report an `InternalInvariantViolation`.
    ///
    /// In order to handle attribute accesses on records containing entities
    /// (e.g., `{foo: principal}.foo.bar`), this function tracks an
    /// `access_path` of record attributes accessed by the expression. This
    /// generalizes the precondition on `e` so that this function can be
    /// called if `e` is a record literal with an attribute `a` such that
    /// `access_path.pop() == Some(a)` and the expression for `a` recursively
    /// satisfies the precondition. For `{foo: principal}.foo.bar` the
    /// recursive call on `{foo: principal}` is made with access path `[foo]`.
    fn check_entity_deref_target_level(
        &mut self,
        e: &Expr<Option<Type>>,
        mut access_path: Vec<SmolStr>,
        env: &RequestEnv<'_>,
    ) -> EntityDerefLevel {
        match e.expr_kind() {
            ExprKind::Var(_) => EntityDerefLevel::zero(),
            ExprKind::Lit(Literal::EntityUID(euid)) => {
                // Allow a literal if it's the current request env's action
                // entity: the action is part of the request, so it resolves
                // without consulting a slice.
                if euid.as_ref() != env.action_entity_uid() {
                    self.level_checking_errors
                        .insert(LevelValidationError::LiteralDerefTarget {
                            euid: euid.as_ref().clone(),
                        });
                }
                EntityDerefLevel::zero()
            }
            ExprKind::If {
                test_expr,
                then_expr,
                else_expr,
            } => {
                self.check_expr_level(test_expr, env);
                let then_lvl =
                    self.check_entity_deref_target_level(then_expr, access_path.clone(), env);
                let else_lvl = self.check_entity_deref_target_level(else_expr, access_path, env);
                then_lvl.max(else_lvl)
            }
            // We don't need to handle `HasAttr` here because it has type
            // Boolean.
            ExprKind::GetAttr { expr, attr } => match expr.data() {
                Some(Type::EntityOrRecord(EntityRecordKind::Entity { .. })) => self
                    .check_entity_deref_target_level(expr, access_path, env)
                    .increment(),
                Some(Type::EntityOrRecord(EntityRecordKind::Record { .. })) => {
                    // We push `attr` onto the access path so that, if the
                    // target of the `getAttr` is a record literal, we can
                    // avoid reporting false positives for the unaccessed
                    // attributes.
                    access_path.push(attr.clone());
                    self.check_entity_deref_target_level(expr, access_path, env)
                }
                // The typechecker ensures `GetAttr` only applies to entities
                // and records.
                _ => {
                    self.level_checking_errors
                        .insert(LevelValidationError::InternalInvariantViolation);
                    EntityDerefLevel::zero()
                }
            },
            ExprKind::BinaryApp {
                // We don't need to handle `HasTag` or `In` here because they
                // have type Boolean.
                op: BinaryOp::GetTag,
                arg1,
                arg2,
            } => {
                let deref_target_level =
                    self.check_entity_deref_target_level(arg1, access_path, env);
                self.check_expr_level(arg2, env);
                deref_target_level.increment()
            }
            ExprKind::Record(attrs) => {
                match access_path
                    .pop()
                    .and_then(|a| attrs.get_key_value(a.as_str()))
                {
                    Some((attr, accessed_e)) => {
                        for (_, e) in attrs.iter().filter(|(a, _)| *a != attr) {
                            self.check_expr_level(e, env);
                        }
                        self.check_entity_deref_target_level(accessed_e, access_path, env)
                    }
                    // From the `access_path` precondition, for a record
                    // literal, the access path must be non-empty and start
                    // with an attribute in the record literal.
                    None => {
                        self.level_checking_errors
                            .insert(LevelValidationError::InternalInvariantViolation);
                        EntityDerefLevel::zero()
                    }
                }
            }

            // We only ever call this function on the target of entity
            // dereferencing expressions, so a non-entity-typed expression
            // shouldn't be possible.
            _ => {
                self.level_checking_errors
                    .insert(LevelValidationError::InternalInvariantViolation);
                EntityDerefLevel::zero()
            }
        }
    }

    fn check_expr_level(&mut self, e: &Expr<Option<Type>>, env: &RequestEnv<'_>) {
        match e.expr_kind() {
            ExprKind::Lit(_) | ExprKind::Var(_) => (),
            ExprKind::If {
                test_expr,
                then_expr,
                else_expr,
            } => {
                self.check_expr_level(test_expr, env);
                self.check_expr_level(then_expr, env);
                self.check_expr_level(else_expr, env);
            }
            ExprKind::Or { left, right } | ExprKind::And { left, right } => {
                self.check_expr_level(left, env);
                self.check_expr_level(right, env);
            }
            ExprKind::UnaryApp { arg, .. } => {
                self.check_expr_level(arg, env);
            }
            ExprKind::BinaryApp {
                op: BinaryOp::HasTag | BinaryOp::GetTag | BinaryOp::In,
                arg1,
                arg2,
            } => {
                let deref_target_lvl = self.check_entity_deref_target_level(arg1, Vec::new(), env);
                if deref_target_lvl >= self.max_level {
                    self.level_checking_errors
                        .insert(LevelValidationError::MaximumLevelExceeded {
                            max: self.max_level.level,
                            actual: deref_target_lvl.increment().level,
                        });
                }
                self.check_expr_level(arg2, env);
            }
            ExprKind::BinaryApp { arg1, arg2, .. } => {
                self.check_expr_level(arg1, env);
                self.check_expr_level(arg2, env);
            }
            ExprKind::ExtensionFunctionApp { args, .. } => {
                for arg in args.iter() {
                    self.check_expr_level(arg, env);
                }
            }
            ExprKind::HasAttr { expr, .. } | ExprKind::GetAttr { expr, .. } => match expr.data() {
                Some(Type::EntityOrRecord(EntityRecordKind::Entity { .. })) => {
                    let deref_target_lvl =
                        self.check_entity_deref_target_level(expr, Vec::new(), env);
                    if deref_target_lvl >= self.max_level {
                        self.level_checking_errors.insert(
                            LevelValidationError::MaximumLevelExceeded {
                                max: self.max_level.level,
                                actual: deref_target_lvl.increment().level,
                            },
                        );
                    }
                }
                Some(Type::EntityOrRecord(EntityRecordKind::Record { .. })) => {
                    self.check_expr_level(expr, env);
                }
                // The typechecker ensures `GetAttr` only applies to entities
                // and records. (`AnyEntity` cannot appear in an inferred
                // type.)
                _ => {
                    self.level_checking_errors
                        .insert(LevelValidationError::InternalInvariantViolation);
                }
            },
            ExprKind::Is { expr, .. } => {
                self.check_expr_level(expr, env);
            }
            ExprKind::Set(exprs) => {
                for e in exprs.iter() {
                    self.check_expr_level(e, env);
                }
            }
            ExprKind::Record(attrs) => {
                for (_, e) in attrs.iter() {
                    self.check_expr_level(e, env);
                }
            }
        }
    }
}
