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

//! Implementation of the typechecker, flow-sensitive in the capability set.

mod typecheck_answer;
pub(crate) use typecheck_answer::TypecheckAnswer;

use std::borrow::Cow;
use std::sync::Arc;

use crate::ast::{BinaryOp, EntityType, EntityUID, Expr, ExprBuilder, ExprKind, Literal, UnaryOp, Var};
use crate::extensions::Extensions;
use crate::validator::schema::ValidatorSchema;
use crate::validator::types::{
    Capability, CapabilitySet, EntityRecordKind, RequestEnv, Type,
};
use crate::validator::validation_errors::{
    LubContext, TypeError, UnexpectedTypeHelp,
};

const REQUIRED_STACK_SPACE: usize = 1024 * 100;

/// Typechecker for expressions, against a schema.
#[derive(Debug)]
pub struct Typechecker<'a> {
    schema: &'a ValidatorSchema,
    extensions: &'static Extensions<'static>,
}

impl<'a> Typechecker<'a> {
    /// Construct a new typechecker. All available extensions are enabled.
    pub fn new(schema: &'a ValidatorSchema) -> Self {
        Self {
            schema,
            extensions: Extensions::all_available(),
        }
    }

    /// Typecheck `e` under a single request environment, starting with no
    /// capabilities. On success, return the type-annotated AST and the
    /// capability set that holds after `e` evaluates to `true`. On failure,
    /// return every type error encountered.
    pub fn typecheck_expr<'b>(
        &self,
        e: &'b Expr,
        request_env: &RequestEnv<'_>,
    ) -> Result<(Expr<Option<Type>>, CapabilitySet<'b>), Vec<TypeError>> {
        let typechecker = SingleEnvTypechecker {
            schema: self.schema,
            extensions: self.extensions,
            request_env,
        };
        let mut type_errors = Vec::new();
        match typechecker.typecheck(&CapabilitySet::new(), e, &mut type_errors) {
            TypecheckAnswer::TypecheckSuccess {
                expr_type,
                expr_capability,
            } => Ok((expr_type, expr_capability)),
            TypecheckAnswer::TypecheckFail { .. } => Err(type_errors),
            TypecheckAnswer::RecursionLimit => Err(vec![TypeError::RecursionLimit]),
        }
    }
}

/// Typechecker for a single request environment.
struct SingleEnvTypechecker<'a> {
    schema: &'a ValidatorSchema,
    extensions: &'static Extensions<'static>,
    /// The single env which we're performing typechecking for
    request_env: &'a RequestEnv<'a>,
}

impl<'a> SingleEnvTypechecker<'a> {
    /// This method handles the majority of the work. Given an expression and
    /// the prior capability, return the result of typechecking the expression
    /// in the single env this typechecker was constructed for, and add any
    /// errors encountered into the `type_errors` list.
    fn typecheck<'b>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        e: &'b Expr,
        type_errors: &mut Vec<TypeError>,
    ) -> TypecheckAnswer<'b> {
        // We assume there's enough space if we cannot determine it with `remaining_stack`
        if stacker::remaining_stack().unwrap_or(REQUIRED_STACK_SPACE) < REQUIRED_STACK_SPACE {
            return TypecheckAnswer::RecursionLimit;
        }

        match e.expr_kind() {
            // Principal, resource, and context have types defined by the
            // request type.
            ExprKind::Var(Var::Principal) => TypecheckAnswer::success(
                ExprBuilder::with_data(Some(self.request_env.principal_type()))
                    .var(Var::Principal),
            ),
            // While the EntityUID for Action is held in the request env,
            // entity types do not consider the id of the entity (only the
            // entity type), so the type of Action is only the entity type
            // name taken from the euid.
            ExprKind::Var(Var::Action) => match self.request_env.action_type(self.schema) {
                Some(ty) => TypecheckAnswer::success(
                    ExprBuilder::with_data(Some(ty)).var(Var::Action),
                ),
                None => {
                    type_errors.push(TypeError::UnrecognizedActionId {
                        actual: self.request_env.action_entity_uid().clone(),
                    });
                    TypecheckAnswer::fail(ExprBuilder::new().var(Var::Action))
                }
            },
            ExprKind::Var(Var::Resource) => TypecheckAnswer::success(
                ExprBuilder::with_data(Some(self.request_env.resource_type()))
                    .var(Var::Resource),
            ),
            ExprKind::Var(Var::Context) => TypecheckAnswer::success(
                ExprBuilder::with_data(Some(self.request_env.context_type()))
                    .var(Var::Context),
            ),

            // Literal booleans get singleton type according to their value.
            ExprKind::Lit(Literal::Bool(val)) => TypecheckAnswer::success(
                ExprBuilder::with_data(Some(Type::singleton_boolean(*val))).val(*val),
            ),
            // Other literal primitive values have the type of that primitive
            // value.
            ExprKind::Lit(Literal::Long(val)) => TypecheckAnswer::success(
                ExprBuilder::with_data(Some(Type::primitive_long())).val(*val),
            ),
            ExprKind::Lit(Literal::String(val)) => TypecheckAnswer::success(
                ExprBuilder::with_data(Some(Type::primitive_string())).val(val.clone()),
            ),

            // Literal entity references have a type based on the entity type
            // that can be looked up in the schema.
            ExprKind::Lit(Literal::EntityUID(euid)) => {
                match Type::euid_literal(euid.as_ref(), self.schema) {
                    Some(ty) => TypecheckAnswer::success(
                        ExprBuilder::with_data(Some(ty)).val(euid.clone()),
                    ),
                    None => {
                        if euid.is_action() {
                            type_errors.push(TypeError::UnrecognizedActionId {
                                actual: euid.as_ref().clone(),
                            });
                        } else {
                            type_errors.push(TypeError::UnrecognizedEntityType {
                                actual: euid.entity_type().clone(),
                            });
                        }
                        TypecheckAnswer::fail(ExprBuilder::new().val(euid.clone()))
                    }
                }
            }

            ExprKind::If {
                test_expr,
                then_expr,
                else_expr,
            } => {
                // The guard expression must be boolean.
                let ans_test = self.expect_type(
                    prior_capability,
                    test_expr,
                    Type::primitive_boolean(),
                    type_errors,
                    |_| None,
                );
                ans_test.then_typecheck(|typ_test, test_capability| {
                    // If the guard has type `true` or `false`, we short
                    // circuit, looking at only the relevant branch.
                    if typ_test.data() == &Some(Type::singleton_boolean(true)) {
                        // The `then` branch needs to be typechecked using the
                        // prior capability of the `if` and any new capability
                        // generated by `test`. This enables an attribute
                        // access `principal.foo` after a condition
                        // `principal has foo`.
                        let ans_then = self.typecheck(
                            &prior_capability.union(&test_capability),
                            then_expr,
                            type_errors,
                        );

                        ans_then.then_typecheck(|typ_then, then_capability| {
                            TypecheckAnswer::success_with_capability(
                                ExprBuilder::with_data(typ_then.data().clone()).ite(
                                    typ_test,
                                    typ_then.clone(),
                                    // The type of the test expression is
                                    // `True`, so we know the `else` branch
                                    // will never be evaluated. We still need
                                    // to put something here, so we use a copy
                                    // of the `then` branch.
                                    typ_then,
                                ),
                                // The output capability of the whole `if`
                                // expression also needs to contain the
                                // capability of the condition.
                                then_capability.union(&test_capability),
                            )
                        })
                    } else if typ_test.data() == &Some(Type::singleton_boolean(false)) {
                        // The `else` branch cannot use the `test` capability
                        // since we know in the `else` branch that the
                        // condition evaluated to `false`. It still can use the
                        // original prior capability.
                        let ans_else = self.typecheck(prior_capability, else_expr, type_errors);

                        ans_else.then_typecheck(|typ_else, else_capability| {
                            TypecheckAnswer::success_with_capability(
                                ExprBuilder::with_data(typ_else.data().clone()).ite(
                                    typ_test,
                                    // The type of the test expression is
                                    // `False`, so the `then` branch will never
                                    // be evaluated; a copy of the `else`
                                    // branch stands in for it.
                                    typ_else.clone(),
                                    typ_else,
                                ),
                                else_capability,
                            )
                        })
                    } else {
                        // When we don't short circuit, the `then` and `else`
                        // branches are individually typechecked with the same
                        // prior capability as in their individual cases.
                        let ans_then = self
                            .typecheck(
                                &prior_capability.union(&test_capability),
                                then_expr,
                                type_errors,
                            )
                            .map_capability(|capability| capability.union(&test_capability));
                        let ans_else = self.typecheck(prior_capability, else_expr, type_errors);
                        // The type of the if expression is then the least
                        // upper bound of the types of the then and else
                        // branches. If either of these fails to typecheck, the
                        // other is still typechecked to detect errors that may
                        // exist in that branch.
                        ans_then.then_typecheck(|typ_then, then_capability| {
                            ans_else.then_typecheck(|typ_else, else_capability| {
                                let lub_ty = self.least_upper_bound_or_error(
                                    vec![typ_then.data().clone(), typ_else.data().clone()],
                                    type_errors,
                                    LubContext::Conditional,
                                );
                                let has_lub = lub_ty.is_some();
                                let annot_expr = ExprBuilder::with_data(lub_ty)
                                    .ite(typ_test, typ_then, typ_else);
                                if has_lub {
                                    // The capability of the conditional must
                                    // hold no matter which branch was taken,
                                    // so we intersect the branch capabilities.
                                    TypecheckAnswer::success_with_capability(
                                        annot_expr,
                                        else_capability.intersect(&then_capability),
                                    )
                                } else {
                                    TypecheckAnswer::fail(annot_expr)
                                }
                            })
                        })
                    }
                })
            }

            ExprKind::And { left, right } => {
                let ans_left = self.expect_type(
                    prior_capability,
                    left,
                    Type::primitive_boolean(),
                    type_errors,
                    |_| None,
                );
                ans_left.then_typecheck(|typ_left, capability_left| {
                    match typ_left.data() {
                        // LHS argument is false, so short circuit the `&&` to
                        // `False` _without_ typechecking the RHS.
                        Some(Type::False) => TypecheckAnswer::success(typ_left),
                        _ => {
                            // Similar to the `then` branch of an `if`
                            // expression, the rhs of an `&&` is typechecked
                            // using an updated prior capability that includes
                            // the capability from the lhs to enable
                            // typechecking expressions like
                            // `principal has foo && principal.foo`. This is
                            // valid because `&&` short circuits at run time,
                            // so the right will only be evaluated after the
                            // left evaluated to `true`.
                            let ans_right = self.expect_type(
                                &prior_capability.union(&capability_left),
                                right,
                                Type::primitive_boolean(),
                                type_errors,
                                |_| None,
                            );
                            ans_right.then_typecheck(|typ_right, capability_right| {
                                match (typ_left.data(), typ_right.data()) {
                                    // The second argument is false, so the
                                    // `&&` is false. The capability is empty
                                    // for the same reason as when the first
                                    // argument was false.
                                    (Some(_), Some(Type::False)) => TypecheckAnswer::success(
                                        ExprBuilder::with_data(Some(Type::False))
                                            .and(typ_left, typ_right),
                                    ),

                                    // When the left argument is true, the
                                    // `&&` has the value of the right
                                    // argument, and the capability is the
                                    // right argument's capability.
                                    (Some(Type::True), Some(_)) => {
                                        TypecheckAnswer::success_with_capability(
                                            ExprBuilder::with_data(typ_right.data().clone())
                                                .and(typ_left, typ_right),
                                            capability_right,
                                        )
                                    }

                                    // When the right argument is true, the
                                    // result type is the type of the left
                                    // argument. Both operands must be true for
                                    // the whole `&&` to be true, so the
                                    // capability is the union of the operand
                                    // capabilities.
                                    (Some(_), Some(Type::True)) => {
                                        TypecheckAnswer::success_with_capability(
                                            ExprBuilder::with_data(typ_left.data().clone())
                                                .and(typ_left, typ_right),
                                            capability_left.union(&capability_right),
                                        )
                                    }

                                    // Neither argument was true or false, so
                                    // we only know the result type is boolean.
                                    (Some(_), Some(_)) => {
                                        TypecheckAnswer::success_with_capability(
                                            ExprBuilder::with_data(Some(
                                                Type::primitive_boolean(),
                                            ))
                                            .and(typ_left, typ_right),
                                            capability_left.union(&capability_right),
                                        )
                                    }

                                    // One or both of the left and the right
                                    // failed to typecheck, so the `&&`
                                    // expression also fails.
                                    _ => TypecheckAnswer::fail(
                                        ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                            .and(typ_left, typ_right),
                                    ),
                                }
                            })
                        }
                    }
                })
            }

            // `||` follows the same pattern as `&&`, but with short circuiting
            // capability propagation adjusted as necessary.
            ExprKind::Or { left, right } => {
                let ans_left = self.expect_type(
                    prior_capability,
                    left,
                    Type::primitive_boolean(),
                    type_errors,
                    |_| None,
                );
                ans_left.then_typecheck(|typ_left, capability_left| match typ_left.data() {
                    // LHS argument is true, so short circuit the `||` to
                    // `True` _without_ typechecking the RHS. Contrary to `&&`,
                    // we keep a capability when short circuiting `||`.
                    Some(Type::True) => {
                        TypecheckAnswer::success_with_capability(typ_left, capability_left)
                    }
                    _ => {
                        // The right operand of an `||` cannot be typechecked
                        // using the capability learned from the left because
                        // the left could have evaluated to either `true` or
                        // `false` when the right is evaluated.
                        let ans_right = self.expect_type(
                            prior_capability,
                            right,
                            Type::primitive_boolean(),
                            type_errors,
                            |_| None,
                        );
                        ans_right.then_typecheck(|typ_right, capability_right| {
                            match (typ_left.data(), typ_right.data()) {
                                // Now the right operand is always `true`, so
                                // we can use its capability as the result
                                // capability. The left operand might have been
                                // `true` or `false`, but it does not affect
                                // the value of the `||` if the right is always
                                // `true`.
                                (Some(_), Some(Type::True)) => {
                                    TypecheckAnswer::success_with_capability(
                                        ExprBuilder::with_data(Some(Type::True))
                                            .or(typ_left, typ_right),
                                        capability_right,
                                    )
                                }
                                // If the right or left operand is always
                                // `false`, then the only way the `||`
                                // expression can be `true` is if the other
                                // operand is `true`. This lets us pass the
                                // capability of the other operand through to
                                // the capability of the `||`.
                                (Some(typ_lhs), Some(Type::False)) => {
                                    TypecheckAnswer::success_with_capability(
                                        ExprBuilder::with_data(Some(typ_lhs.clone()))
                                            .or(typ_left, typ_right),
                                        capability_left,
                                    )
                                }
                                (Some(Type::False), Some(typ_rhs)) => {
                                    TypecheckAnswer::success_with_capability(
                                        ExprBuilder::with_data(Some(typ_rhs.clone()))
                                            .or(typ_left, typ_right),
                                        capability_right,
                                    )
                                }
                                // When neither has a constant value, the `||`
                                // evaluates to true if one or both is `true`.
                                // This means we can only keep capabilities in
                                // the intersection of their capability sets.
                                (Some(_), Some(_)) => TypecheckAnswer::success_with_capability(
                                    ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                        .or(typ_left, typ_right),
                                    capability_right.intersect(&capability_left),
                                ),
                                _ => TypecheckAnswer::fail(
                                    ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                        .or(typ_left, typ_right),
                                ),
                            }
                        })
                    }
                })
            }

            ExprKind::UnaryApp { .. } => self.typecheck_unary(prior_capability, e, type_errors),
            ExprKind::BinaryApp { .. } => self.typecheck_binary(prior_capability, e, type_errors),
            ExprKind::ExtensionFunctionApp { .. } => {
                self.typecheck_extension(prior_capability, e, type_errors)
            }

            ExprKind::GetAttr { expr, attr } => {
                // Accessing an attribute requires either an entity or a
                // record that has the attribute.
                let actual = self.expect_one_of_types(
                    prior_capability,
                    expr,
                    &[Type::any_entity_reference(), Type::any_record()],
                    type_errors,
                    |_| None,
                );

                actual.then_typecheck(|typ_expr_actual, _| match typ_expr_actual.data() {
                    Some(typ_actual) => {
                        let attr_ty = Type::lookup_attribute_type(self.schema, typ_actual, attr);
                        let annot_expr =
                            ExprBuilder::with_data(attr_ty.clone().map(|a| a.attr_type))
                                .get_attr(typ_expr_actual.clone(), attr.clone());
                        match attr_ty {
                            Some(ty) => {
                                // A safe access to an attribute requires
                                // either that the attribute is required
                                // (always present), or that the attribute is
                                // in the prior capability set (the current
                                // expression is guarded by a condition that
                                // will only evaluate to `true` when the
                                // attribute is present).
                                if ty.is_required
                                    || prior_capability
                                        .contains(&Capability::new_attribute(expr, attr.clone()))
                                {
                                    TypecheckAnswer::success(annot_expr)
                                } else {
                                    type_errors.push(TypeError::UnsafeOptionalAttributeAccess {
                                        attr: attr.clone(),
                                    });
                                    TypecheckAnswer::fail(annot_expr)
                                }
                            }
                            None => {
                                type_errors.push(TypeError::UnsafeAttributeAccess {
                                    attr: attr.clone(),
                                    actual: typ_actual.clone(),
                                    may_exist: matches!(
                                        typ_actual,
                                        Type::EntityOrRecord(EntityRecordKind::AnyEntity)
                                    ),
                                });
                                TypecheckAnswer::fail(annot_expr)
                            }
                        }
                    }
                    None => TypecheckAnswer::fail(
                        ExprBuilder::new().get_attr(typ_expr_actual, attr.clone()),
                    ),
                })
            }

            ExprKind::HasAttr { expr, attr } => {
                // `has` applies to an entity or a record
                let actual = self.expect_one_of_types(
                    prior_capability,
                    expr,
                    &[Type::any_entity_reference(), Type::any_record()],
                    type_errors,
                    |actual| match actual {
                        Type::Set { .. } => Some(UnexpectedTypeHelp::TryUsingContains),
                        _ => None,
                    },
                );
                actual.then_typecheck(|typ_expr_actual, _| match typ_expr_actual.data() {
                    Some(typ_actual) => {
                        match Type::lookup_attribute_type(self.schema, typ_actual, attr) {
                            Some(attr_ty) if attr_ty.is_required => {
                                // Since an entity doesn't always have to exist
                                // in the entity store, and `has` evaluates to
                                // `false` when this is the case, we can't
                                // conclude that `has` is true just because an
                                // attribute is required for an entity type.
                                let exists_in_store = matches!(
                                    typ_actual,
                                    Type::EntityOrRecord(EntityRecordKind::Record { .. })
                                );
                                // We can make an exception when the attribute
                                // access of the expression is already in the
                                // prior capability, which means the entity
                                // must exist.
                                let in_prior_capability = prior_capability
                                    .contains(&Capability::new_attribute(expr, attr.clone()));
                                let type_of_has = if exists_in_store || in_prior_capability {
                                    Type::singleton_boolean(true)
                                } else {
                                    Type::primitive_boolean()
                                };
                                TypecheckAnswer::success_with_capability(
                                    ExprBuilder::with_data(Some(type_of_has))
                                        .has_attr(typ_expr_actual, attr.clone()),
                                    CapabilitySet::singleton(Capability::new_attribute(
                                        expr,
                                        attr.clone(),
                                    )),
                                )
                            }
                            // This is where capability information is
                            // generated. If the `HasAttr` for an optional
                            // attribute evaluates to `true`, then we know that
                            // it is safe to access that attribute, so we add
                            // an entry to the capability set.
                            Some(_) => TypecheckAnswer::success_with_capability(
                                ExprBuilder::with_data(Some(
                                    if prior_capability
                                        .contains(&Capability::new_attribute(expr, attr.clone()))
                                    {
                                        Type::singleton_boolean(true)
                                    } else {
                                        Type::primitive_boolean()
                                    },
                                ))
                                .has_attr(typ_expr_actual, attr.clone()),
                                CapabilitySet::singleton(Capability::new_attribute(
                                    expr,
                                    attr.clone(),
                                )),
                            ),
                            // The attribute is not declared at all, so the
                            // `has` is always false.
                            None => TypecheckAnswer::success(
                                ExprBuilder::with_data(Some(Type::singleton_boolean(false)))
                                    .has_attr(typ_expr_actual, attr.clone()),
                            ),
                        }
                    }
                    None => TypecheckAnswer::fail(
                        ExprBuilder::with_data(Some(Type::primitive_boolean()))
                            .has_attr(typ_expr_actual, attr.clone()),
                    ),
                })
            }

            ExprKind::Is { expr, entity_type } => self
                .expect_type(
                    prior_capability,
                    expr,
                    Type::any_entity_reference(),
                    type_errors,
                    |_| Some(UnexpectedTypeHelp::TypeTestNotSupported),
                )
                .then_typecheck(|expr_ty, _| {
                    match expr_ty.data() {
                        Some(Type::EntityOrRecord(EntityRecordKind::Entity { ty, .. })) => {
                            // The actual entity type is known exactly, so the
                            // `is` is statically `true` or `false`.
                            let type_of_is = Type::singleton_boolean(ty == entity_type);
                            TypecheckAnswer::success(
                                ExprBuilder::with_data(Some(type_of_is))
                                    .is_entity_type(expr_ty, entity_type.clone()),
                            )
                        }
                        // For `AnyEntity` we don't know anything about what
                        // entity type it could be, so we just return `Bool`.
                        Some(Type::EntityOrRecord(EntityRecordKind::AnyEntity)) => {
                            TypecheckAnswer::success(
                                ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                    .is_entity_type(expr_ty, entity_type.clone()),
                            )
                        }
                        // Expression type is not an entity type or is `None`.
                        // In either case a type error was already reported.
                        _ => TypecheckAnswer::fail(
                            ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                .is_entity_type(expr_ty, entity_type.clone()),
                        ),
                    }
                }),

            // Literal sets have a set type where the type of the set element
            // is the least upper bound of all the types of expression in the
            // set.
            ExprKind::Set(exprs) => {
                let elem_types = exprs
                    .iter()
                    .map(|elem| self.typecheck(prior_capability, elem, type_errors))
                    .collect::<Vec<_>>();

                // If we cannot compute a least upper bound for the element
                // types, then a type error will be generated by
                // `least_upper_bound_or_error` and TypecheckFail will be
                // returned.
                TypecheckAnswer::sequence_all_then_typecheck(elem_types, |types_and_capabilities| {
                    let (elem_expr_types, _): (Vec<Expr<Option<Type>>>, Vec<_>) =
                        types_and_capabilities.into_iter().unzip();
                    let elem_lub = self.least_upper_bound_or_error(
                        elem_expr_types.iter().map(|ety| ety.data().clone()),
                        type_errors,
                        LubContext::Set,
                    );
                    match elem_lub {
                        _ if exprs.is_empty() => {
                            type_errors.push(TypeError::EmptySetForbidden);
                            TypecheckAnswer::fail(ExprBuilder::new().set(elem_expr_types))
                        }
                        Some(elem_lub) => TypecheckAnswer::success(
                            ExprBuilder::with_data(Some(Type::set(elem_lub)))
                                .set(elem_expr_types),
                        ),
                        None => TypecheckAnswer::fail(ExprBuilder::new().set(elem_expr_types)),
                    }
                })
            }

            // For records, each (attribute, value) pair in the initializer
            // needs to be individually accounted for in the record type.
            ExprKind::Record(map) => {
                // Typecheck each attribute initializer expression individually.
                let record_attr_tys = map
                    .values()
                    .map(|value| self.typecheck(prior_capability, value, type_errors));
                // This will cause the return value to be `TypecheckFail` if
                // any of the attributes did not typecheck.
                TypecheckAnswer::sequence_all_then_typecheck(
                    record_attr_tys,
                    |record_attr_tys_and_capabilities| {
                        let (record_attr_expr_tys, _): (Vec<Expr<Option<Type>>>, Vec<_>) =
                            record_attr_tys_and_capabilities.into_iter().unzip();
                        // If any of the attributes could not be assigned a
                        // type (recall that an expression can fail to
                        // typecheck but still be assigned a type), then we
                        // cannot assign any type to this expression.
                        let record_attr_tys = record_attr_expr_tys
                            .iter()
                            .map(|e| e.data().clone())
                            .collect::<Option<Vec<_>>>();
                        let ty = record_attr_tys.map(|record_attr_tys| {
                            Type::record_with_required_attributes(
                                std::iter::zip(map.keys().cloned(), record_attr_tys),
                                crate::validator::types::OpenTag::ClosedAttributes,
                            )
                        });
                        let is_success = ty.is_some();
                        let expr = ExprBuilder::with_data(ty)
                            .record(map.keys().cloned().zip(record_attr_expr_tys));
                        if is_success {
                            TypecheckAnswer::success(expr)
                        } else {
                            TypecheckAnswer::fail(expr)
                        }
                    },
                )
            }
        }
    }

    /// A utility called by the main typecheck method to handle unary operator
    /// application.
    /// INVARIANT: `unary_expr` must be of kind `UnaryApp`
    fn typecheck_unary<'b>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        unary_expr: &'b Expr,
        type_errors: &mut Vec<TypeError>,
    ) -> TypecheckAnswer<'b> {
        // PANIC SAFETY maintained by invariant on this function
        #[allow(clippy::panic)]
        let ExprKind::UnaryApp { op, arg } = unary_expr.expr_kind() else {
            panic!("`typecheck_unary` called with an expression kind other than `UnaryApp`");
        };
        match op {
            UnaryOp::Not => {
                let ans_arg = self.expect_type(
                    prior_capability,
                    arg,
                    Type::primitive_boolean(),
                    type_errors,
                    |_| None,
                );
                ans_arg.then_typecheck(|typ_expr_arg, _| match typ_expr_arg.data() {
                    Some(typ_arg) => {
                        // Negating a singleton boolean type gives the other
                        // singleton boolean type.
                        let ty = if typ_arg == &Type::singleton_boolean(true) {
                            Type::singleton_boolean(false)
                        } else if typ_arg == &Type::singleton_boolean(false) {
                            Type::singleton_boolean(true)
                        } else {
                            Type::primitive_boolean()
                        };
                        TypecheckAnswer::success(
                            ExprBuilder::with_data(Some(ty)).not(typ_expr_arg),
                        )
                    }
                    None => TypecheckAnswer::fail(
                        ExprBuilder::with_data(Some(Type::primitive_boolean()))
                            .not(typ_expr_arg),
                    ),
                })
            }
            UnaryOp::Neg => {
                let ans_arg = self.expect_type(
                    prior_capability,
                    arg,
                    Type::primitive_long(),
                    type_errors,
                    |_| None,
                );
                ans_arg.then_typecheck(|typ_expr_arg, _| {
                    TypecheckAnswer::success(
                        ExprBuilder::with_data(Some(Type::primitive_long())).neg(typ_expr_arg),
                    )
                })
            }
        }
    }

    /// A utility called by the main typecheck method to handle binary
    /// operator application.
    /// INVARIANT: `bin_expr` must be a `BinaryApp`
    fn typecheck_binary<'b>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        bin_expr: &'b Expr,
        type_errors: &mut Vec<TypeError>,
    ) -> TypecheckAnswer<'b> {
        // PANIC SAFETY: maintained by invariant on this function
        #[allow(clippy::panic)]
        let ExprKind::BinaryApp { op, arg1, arg2 } = bin_expr.expr_kind() else {
            panic!("`typecheck_binary` called with an expression kind other than `BinaryApp`");
        };

        match op {
            // The arguments to `==` may typecheck with any type, but we will
            // return false if the types are disjoint.
            BinaryOp::Eq => {
                let lhs_ty = self.typecheck(prior_capability, arg1, type_errors);
                let rhs_ty = self.typecheck(prior_capability, arg2, type_errors);
                lhs_ty.then_typecheck(|lhs_ty, _| {
                    rhs_ty.then_typecheck(|rhs_ty, _| {
                        let type_of_eq = self.type_of_equality(
                            arg1,
                            lhs_ty.data().as_ref(),
                            arg2,
                            rhs_ty.data().as_ref(),
                        );
                        let annotated_eq = ExprBuilder::with_data(Some(type_of_eq.clone()))
                            .binary_app(*op, lhs_ty.clone(), rhs_ty.clone());
                        // When the equality is not already statically
                        // resolved, the operand types must be compatible;
                        // equality between incomparable types is almost
                        // surely an authoring error.
                        if type_of_eq == Type::primitive_boolean()
                            && self
                                .least_upper_bound_or_error(
                                    [lhs_ty.data().clone(), rhs_ty.data().clone()],
                                    type_errors,
                                    LubContext::Equality,
                                )
                                .is_none()
                        {
                            return TypecheckAnswer::fail(annotated_eq);
                        }
                        TypecheckAnswer::success(annotated_eq)
                    })
                })
            }

            BinaryOp::Less | BinaryOp::LessEq => {
                let ans_arg1 = self.expect_type(
                    prior_capability,
                    arg1,
                    Type::primitive_long(),
                    type_errors,
                    |_| None,
                );
                ans_arg1.then_typecheck(|expr_ty_arg1, _| {
                    let ans_arg2 = self.expect_type(
                        prior_capability,
                        arg2,
                        Type::primitive_long(),
                        type_errors,
                        |_| None,
                    );
                    ans_arg2.then_typecheck(|expr_ty_arg2, _| {
                        TypecheckAnswer::success(
                            ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                .binary_app(*op, expr_ty_arg1, expr_ty_arg2),
                        )
                    })
                })
            }

            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                let ans_arg1 = self.expect_type(
                    prior_capability,
                    arg1,
                    Type::primitive_long(),
                    type_errors,
                    |_| None,
                );
                ans_arg1.then_typecheck(|expr_ty_arg1, _| {
                    let ans_arg2 = self.expect_type(
                        prior_capability,
                        arg2,
                        Type::primitive_long(),
                        type_errors,
                        |_| None,
                    );
                    ans_arg2.then_typecheck(|expr_ty_arg2, _| {
                        TypecheckAnswer::success(
                            ExprBuilder::with_data(Some(Type::primitive_long()))
                                .binary_app(*op, expr_ty_arg1, expr_ty_arg2),
                        )
                    })
                })
            }

            BinaryOp::In => self.typecheck_in(prior_capability, arg1, arg2, type_errors),

            BinaryOp::Contains => {
                // The first argument must be a set.
                self.expect_type(prior_capability, arg1, Type::any_set(), type_errors, |actual| {
                    match actual {
                        Type::EntityOrRecord(
                            EntityRecordKind::AnyEntity | EntityRecordKind::Entity { .. },
                        ) => Some(UnexpectedTypeHelp::TryUsingIn),
                        Type::EntityOrRecord(EntityRecordKind::Record { .. }) => {
                            Some(UnexpectedTypeHelp::TryUsingHas)
                        }
                        _ => None,
                    }
                })
                .then_typecheck(|expr_ty_arg1, _| {
                    self.typecheck(prior_capability, arg2, type_errors)
                        .then_typecheck(|expr_ty_arg2, _| {
                            let annotated_expr =
                                ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                    .binary_app(*op, expr_ty_arg1.clone(), expr_ty_arg2.clone());
                            // The candidate member must be LUB-compatible
                            // with the set's element type.
                            let elem_ty = match expr_ty_arg1.data() {
                                Some(Type::Set {
                                    element_type: Some(ty),
                                }) => Some(ty.as_ref().clone()),
                                _ => None,
                            };
                            if self
                                .least_upper_bound_or_error(
                                    [elem_ty, expr_ty_arg2.data().clone()],
                                    type_errors,
                                    LubContext::Contains,
                                )
                                .is_none()
                            {
                                TypecheckAnswer::fail(annotated_expr)
                            } else {
                                TypecheckAnswer::success(annotated_expr)
                            }
                        })
                })
            }

            BinaryOp::ContainsAll | BinaryOp::ContainsAny => {
                // Both arguments to a `containsAll` or `containsAny` must be
                // sets with compatible element types.
                self.expect_type(prior_capability, arg1, Type::any_set(), type_errors, |actual| {
                    match actual {
                        Type::EntityOrRecord(
                            EntityRecordKind::AnyEntity | EntityRecordKind::Entity { .. },
                        ) => Some(UnexpectedTypeHelp::TryUsingIn),
                        _ => None,
                    }
                })
                .then_typecheck(|expr_ty_arg1, _| {
                    self.expect_type(prior_capability, arg2, Type::any_set(), type_errors, |_| {
                        None
                    })
                    .then_typecheck(|expr_ty_arg2, _| {
                        let annotated_expr =
                            ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                .binary_app(*op, expr_ty_arg1.clone(), expr_ty_arg2.clone());
                        if self
                            .least_upper_bound_or_error(
                                [expr_ty_arg1.data().clone(), expr_ty_arg2.data().clone()],
                                type_errors,
                                LubContext::ContainsAnyAll,
                            )
                            .is_none()
                        {
                            TypecheckAnswer::fail(annotated_expr)
                        } else {
                            TypecheckAnswer::success(annotated_expr)
                        }
                    })
                })
            }

            BinaryOp::GetTag | BinaryOp::HasTag => {
                self.typecheck_tag_op(prior_capability, *op, arg1, arg2, type_errors)
            }
        }
    }

    /// Handles typechecking of `getTag` and `hasTag`, which mirrors
    /// `getAttr`/`hasAttr` except that tag names are arbitrary string
    /// expressions and the declared tag type comes from the schema's `tags`
    /// declaration.
    fn typecheck_tag_op<'b>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        op: BinaryOp,
        arg1: &'b Expr,
        arg2: &'b Expr,
        type_errors: &mut Vec<TypeError>,
    ) -> TypecheckAnswer<'b> {
        let ans_arg1 = self.expect_type(
            prior_capability,
            arg1,
            Type::any_entity_reference(),
            type_errors,
            |_| None,
        );
        ans_arg1.then_typecheck(|expr_ty_arg1, _| {
            let ans_arg2 = self.expect_type(
                prior_capability,
                arg2,
                Type::primitive_string(),
                type_errors,
                |_| None,
            );
            ans_arg2.then_typecheck(|expr_ty_arg2, _| {
                let tag_ty = expr_ty_arg1
                    .data()
                    .as_ref()
                    .and_then(|ty| Type::lookup_tag_type(self.schema, ty));
                match op {
                    BinaryOp::GetTag => match tag_ty {
                        Some(tag_ty) => {
                            if prior_capability.contains(&Capability::new_tag(arg1, arg2)) {
                                TypecheckAnswer::success(
                                    ExprBuilder::with_data(Some(tag_ty))
                                        .get_tag(expr_ty_arg1, expr_ty_arg2),
                                )
                            } else {
                                type_errors.push(TypeError::UnsafeTagAccess);
                                TypecheckAnswer::fail(
                                    ExprBuilder::with_data(Some(tag_ty))
                                        .get_tag(expr_ty_arg1, expr_ty_arg2),
                                )
                            }
                        }
                        None => {
                            type_errors.push(TypeError::NoTagsAllowed {
                                actual: expr_ty_arg1
                                    .data()
                                    .clone()
                                    .unwrap_or_else(Type::any_entity_reference),
                            });
                            TypecheckAnswer::fail(
                                ExprBuilder::new().get_tag(expr_ty_arg1, expr_ty_arg2),
                            )
                        }
                    },
                    _ => match tag_ty {
                        // `hasTag` on an entity type with declared tags
                        // generates the tag capability.
                        Some(_) => TypecheckAnswer::success_with_capability(
                            ExprBuilder::with_data(Some(
                                if prior_capability.contains(&Capability::new_tag(arg1, arg2)) {
                                    Type::singleton_boolean(true)
                                } else {
                                    Type::primitive_boolean()
                                },
                            ))
                            .has_tag(expr_ty_arg1, expr_ty_arg2),
                            CapabilitySet::singleton(Capability::new_tag(arg1, arg2)),
                        ),
                        // An entity type with no tags declared never has any
                        // tag.
                        None => TypecheckAnswer::success(
                            ExprBuilder::with_data(Some(Type::singleton_boolean(false)))
                                .has_tag(expr_ty_arg1, expr_ty_arg2),
                        ),
                    },
                }
            })
        })
    }

    /// The type of an equality between expressions with the given types.
    fn type_of_equality(
        &self,
        lhs_expr: &Expr,
        lhs_ty: Option<&Type>,
        rhs_expr: &Expr,
        rhs_ty: Option<&Type>,
    ) -> Type {
        // If we know the types are disjoint, then we can give the expression
        // type False. See `are_types_disjoint` for why fewer types are
        // disjoint than may be expected.
        let disjoint_types = match (lhs_ty, rhs_ty) {
            (Some(lhs_ty), Some(rhs_ty)) => Type::are_types_disjoint(lhs_ty, rhs_ty),
            _ => false,
        };
        if disjoint_types {
            Type::False
        } else if let (ExprKind::Lit(lhs_lit), ExprKind::Lit(rhs_lit)) = (
            self.replace_action_var_with_euid(lhs_expr).expr_kind(),
            self.replace_action_var_with_euid(rhs_expr).expr_kind(),
        ) {
            // The types are not disjoint. If both expressions are literals,
            // we evaluate the equality between literals and return that as a
            // singleton boolean.
            Type::singleton_boolean(lhs_lit == rhs_lit)
        } else {
            // When the left and right expressions are not both literals, we
            // do not attempt to give a more specific type than boolean.
            Type::primitive_boolean()
        }
    }

    /// Checks if `lhs_ety` may be a descendant of `rhs_ety` in the action
    /// hierarchy. We assume that `lhs_ety` is an action entity type, but
    /// `rhs_ety` can be any entity type.
    fn check_action_in_entity_type(&self, lhs_ety: &EntityType, rhs_ety: &EntityType) -> bool {
        lhs_ety == rhs_ety
            || self.schema.action_ids().any(|action| {
                action.name().entity_type() == rhs_ety
                    && action.descendants().any(|desc| desc.entity_type() == lhs_ety)
            })
    }

    /// Check if the `lhs` entity type may be a descendant of the `rhs` entity
    /// type, either in the entity or action hierarchy. If this function
    /// returns `false`, then `lhs in rhs` cannot possibly evaluate to `true`,
    /// meaning that the expression can have type `False`.
    fn entity_type_descendant_of(&self, lhs: &EntityType, rhs: &EntityType) -> bool {
        self.schema.get_entity_types_in(rhs).contains(&lhs)
            || (lhs.is_action() && self.check_action_in_entity_type(lhs, rhs))
    }

    /// Handles typechecking of `in` expressions. This is complicated because
    /// it requires searching the schema to determine if an `in` expression
    /// consisting of variables and literals can ever be true. When we find
    /// that an `in` expression is always false, this function returns the
    /// singleton type false, allowing for short circuiting in `if` and `and`
    /// expressions.
    fn typecheck_in<'b>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        lhs: &'b Expr,
        rhs: &'b Expr,
        type_errors: &mut Vec<TypeError>,
    ) -> TypecheckAnswer<'b> {
        // First, the basic typechecking rules for `in` that apply regardless
        // of the syntactic special cases that follow.
        let ty_lhs = self.expect_type(
            prior_capability,
            lhs,
            Type::any_entity_reference(),
            type_errors,
            |_| Some(UnexpectedTypeHelp::TryUsingContains),
        );
        let ty_rhs = self.expect_one_of_types(
            prior_capability,
            rhs,
            &[
                Type::set(Type::any_entity_reference()),
                Type::any_entity_reference(),
            ],
            type_errors,
            |actual| match actual {
                Type::Set { .. } => Some(UnexpectedTypeHelp::TryUsingContains),
                _ => None,
            },
        );

        let lhs_typechecked = ty_lhs.typechecked();
        let rhs_typechecked = ty_rhs.typechecked();

        ty_lhs.then_typecheck(|lhs_expr, _lhs_capability| {
            ty_rhs.then_typecheck(|rhs_expr, _rhs_capability| {
                // If either failed to typecheck, then the whole expression
                // fails to typecheck.
                if !lhs_typechecked || !rhs_typechecked {
                    return TypecheckAnswer::fail(
                        ExprBuilder::with_data(Some(Type::primitive_boolean()))
                            .is_in(lhs_expr, rhs_expr),
                    );
                }
                let lhs_as_euid_lit = self.euid_from_euid_literal_or_action(lhs);
                let rhs_as_euid_lits = self.euids_from_euid_literals_or_actions(rhs);
                match (lhs_as_euid_lit, rhs_as_euid_lits) {
                    // Syntactic special case for an action literal or
                    // variable `in` an entity literal or set of entity
                    // literals. By examining the action hierarchy in the
                    // schema, we'll be able to give this a singleton boolean
                    // type.
                    (Some(lhs_euid), Some(rhs_euids)) if lhs_euid.is_action() => self
                        .type_of_action_in_entity_literals(
                            &lhs_euid,
                            rhs_euids.iter().map(AsRef::as_ref),
                            lhs_expr,
                            rhs_expr,
                        ),
                    _ => {
                        let lhs_ety = lhs_expr
                            .data()
                            .as_ref()
                            .and_then(|ty| match ty {
                                Type::EntityOrRecord(rk) => rk.as_entity_type(),
                                _ => None,
                            })
                            .map(|(ety, _)| ety);
                        let rhs_ety = rhs_expr.data().as_ref().and_then(|ty| match ty {
                            Type::EntityOrRecord(rk) => rk.as_entity_type().map(|(ety, _)| ety),
                            Type::Set {
                                element_type: Some(element_type),
                            } => match element_type.as_ref() {
                                Type::EntityOrRecord(rk) => {
                                    rk.as_entity_type().map(|(ety, _)| ety)
                                }
                                _ => None,
                            },
                            _ => None,
                        });
                        match (lhs_ety, rhs_ety) {
                            (Some(lhs_ety), Some(rhs_ety))
                                if !self.entity_type_descendant_of(lhs_ety, rhs_ety) =>
                            {
                                // The hierarchy declared in the schema rules
                                // out this membership entirely.
                                TypecheckAnswer::success(
                                    ExprBuilder::with_data(Some(Type::False))
                                        .is_in(lhs_expr, rhs_expr),
                                )
                            }
                            // If none of the cases apply, then all we know is
                            // that `in` has type boolean.
                            _ => TypecheckAnswer::success(
                                ExprBuilder::with_data(Some(Type::primitive_boolean()))
                                    .is_in(lhs_expr, rhs_expr),
                            ),
                        }
                    }
                }
            })
        })
    }

    // Given an expression, if that expression is a literal or the `action`
    // variable, return it as an `EntityUID`. Return `None` otherwise.
    fn euid_from_euid_literal_or_action(&self, e: &Expr) -> Option<Arc<EntityUID>> {
        match self.replace_action_var_with_euid(e).expr_kind() {
            ExprKind::Lit(Literal::EntityUID(euid)) => Some(Arc::clone(euid)),
            _ => None,
        }
    }

    /// If the expression is a literal, the `action` variable, or a set of
    /// exclusively literals/actions, then return all the `EntityUID`s.
    /// Return `None` otherwise.
    fn euids_from_euid_literals_or_actions(&self, e: &Expr) -> Option<Vec<Arc<EntityUID>>> {
        if let Some(euid) = self.euid_from_euid_literal_or_action(e) {
            Some(vec![euid])
        } else if let ExprKind::Set(exprs) = e.expr_kind() {
            exprs
                .iter()
                .map(|e| self.euid_from_euid_literal_or_action(e))
                .collect::<Option<Vec<_>>>()
        } else {
            None
        }
    }

    // Get the type for `in` when it is applied to an action EUID literal on
    // the left and one or more EUID literals on the right, which may or may
    // not be actions. If they're not actions, then we assume the LHS action
    // can never be in a non-action entity. If there is at least one RHS
    // action entity, then we can precisely evaluate the `in`, giving the
    // expression a singleton boolean type resolved entirely from the schema's
    // action hierarchy, without consulting the runtime store.
    fn type_of_action_in_entity_literals<'b, 'c>(
        &self,
        lhs_euid: &EntityUID,
        rhs_elems: impl IntoIterator<Item = &'b EntityUID>,
        lhs_expr: Expr<Option<Type>>,
        rhs_expr: Expr<Option<Type>>,
    ) -> TypecheckAnswer<'c> {
        debug_assert!(
            lhs_euid.is_action(),
            "this function is called only when an action entity is on the LHS"
        );
        // If there's at least one action on the right, check if that action
        // is an ancestor of the LHS action. We can ignore any non-actions
        // because we assume an action cannot be `in` a non-action.
        let rhs_actions: Vec<_> = rhs_elems
            .into_iter()
            .filter(|e| e.entity_type().is_action())
            .collect();
        if rhs_actions.is_empty() {
            // There are no actions on the right, so the LHS action cannot be
            // `in` any of them.
            return TypecheckAnswer::success(
                ExprBuilder::with_data(Some(Type::False)).is_in(lhs_expr, rhs_expr),
            );
        }
        match self.schema.get_actions_in_set(rhs_actions.iter().copied()) {
            Some(rhs_descendants) => {
                // We have literal actions on the LHS and RHS of the `in` so we
                // can precisely evaluate the expression by checking if the
                // LHS action is a descendant of anything on the RHS.
                let is_action_in_descendants =
                    rhs_descendants.into_iter().any(|e| e == lhs_euid);
                TypecheckAnswer::success(
                    ExprBuilder::with_data(Some(Type::singleton_boolean(
                        is_action_in_descendants,
                    )))
                    .is_in(lhs_expr, rhs_expr),
                )
            }
            // Some RHS action is not declared in the schema. The literal
            // typing rule has already reported this for RHS literals, so we
            // leave the type as boolean without a new error.
            None => TypecheckAnswer::fail(
                ExprBuilder::with_data(Some(Type::primitive_boolean()))
                    .is_in(lhs_expr, rhs_expr),
            ),
        }
    }

    /// If the `maybe_action_var` expression is `Expr::Var(Var::Action)`,
    /// return an expression for the entity uid for the action variable in the
    /// request environment. Otherwise, return the expression unchanged.
    fn replace_action_var_with_euid<'c>(&self, maybe_action_var: &'c Expr) -> Cow<'c, Expr> {
        match maybe_action_var.expr_kind() {
            ExprKind::Var(Var::Action) => {
                Cow::Owned(Expr::val(self.request_env.action_entity_uid().clone()))
            }
            _ => Cow::Borrowed(maybe_action_var),
        }
    }

    /// Utility called by the main typecheck method to handle extension
    /// function application.
    /// INVARIANT: `ext_expr` must be an `ExtensionFunctionApp`
    fn typecheck_extension<'b>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        ext_expr: &'b Expr,
        type_errors: &mut Vec<TypeError>,
    ) -> TypecheckAnswer<'b> {
        // PANIC SAFETY maintained by invariant on this function
        #[allow(clippy::panic)]
        let ExprKind::ExtensionFunctionApp { fn_name, args } = ext_expr.expr_kind() else {
            panic!("`typecheck_extension` called with an expression kind other than `ExtensionFunctionApp`");
        };

        // Typechecks all arguments without any expected type, then annotates
        // the call node as failed. Used when the call itself is malformed.
        let fail_with_all_args =
            |slf: &Self, type_errors: &mut Vec<TypeError>| -> TypecheckAnswer<'b> {
                let arg_answers = args
                    .iter()
                    .map(|arg| slf.typecheck(prior_capability, arg, type_errors))
                    .collect::<Vec<_>>();
                TypecheckAnswer::sequence_all_then_typecheck(arg_answers, |args_capabilities| {
                    let (typed_args, _): (Vec<Expr<Option<Type>>>, Vec<_>) =
                        args_capabilities.into_iter().unzip();
                    TypecheckAnswer::fail(
                        ExprBuilder::new().call_extension_fn(fn_name.clone(), typed_args),
                    )
                })
                .into_fail()
            };

        let efunc = match self.extensions.func(fn_name) {
            Ok(efunc) => efunc,
            Err(_) => {
                type_errors.push(TypeError::UndefinedFunction {
                    name: fn_name.clone(),
                });
                return fail_with_all_args(self, type_errors);
            }
        };

        if args.len() != efunc.arg_types().len() {
            type_errors.push(TypeError::WrongNumberArguments {
                expected: efunc.arg_types().len(),
                actual: args.len(),
            });
            return fail_with_all_args(self, type_errors);
        }

        let ret_ty = validator_type_of_ext_type(efunc.return_type());

        // Check each argument against the declared argument type, when one is
        // declared.
        let arg_answers = args
            .iter()
            .zip(efunc.arg_types().iter())
            .map(|(arg, expected)| match expected.as_ref().and_then(validator_type_of_ext_type) {
                Some(expected_ty) => self.expect_type(
                    prior_capability,
                    arg,
                    expected_ty,
                    type_errors,
                    |_| None,
                ),
                None => self.typecheck(prior_capability, arg, type_errors),
            })
            .collect::<Vec<_>>();

        // Extension constructors are validated eagerly: a constructor applied
        // to literal arguments either produces a value or is a static error.
        let constructor_validation_failure = if efunc.is_constructor() {
            let lit_args = args
                .iter()
                .map(|arg| match arg.expr_kind() {
                    ExprKind::Lit(lit) => Some(crate::ast::Value::Lit(lit.clone())),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>();
            match lit_args {
                Some(lit_args) => match efunc.call(&lit_args) {
                    Ok(_) => false,
                    Err(e) => {
                        type_errors.push(TypeError::FunctionArgumentValidation {
                            msg: e.to_string(),
                        });
                        true
                    }
                },
                None => {
                    type_errors.push(TypeError::NonLitExtConstructor);
                    true
                }
            }
        } else {
            false
        };

        TypecheckAnswer::sequence_all_then_typecheck(arg_answers, |arg_exprs_capabilities| {
            let (typed_arg_exprs, _): (Vec<Expr<Option<Type>>>, Vec<_>) =
                arg_exprs_capabilities.into_iter().unzip();
            let annot_expr = ExprBuilder::with_data(ret_ty)
                .call_extension_fn(fn_name.clone(), typed_arg_exprs);
            if constructor_validation_failure {
                TypecheckAnswer::fail(annot_expr)
            } else {
                TypecheckAnswer::success(annot_expr)
            }
        })
    }

    /// Check that an expression has a type that is a subtype of one of the
    /// given types. If not, generate a type error and return `TypecheckFail`.
    /// Return `TypecheckSuccess` with the type otherwise.
    fn expect_one_of_types<'b, F>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        expr: &'b Expr,
        expected: &[Type],
        type_errors: &mut Vec<TypeError>,
        type_error_help: F,
    ) -> TypecheckAnswer<'b>
    where
        F: FnOnce(&Type) -> Option<UnexpectedTypeHelp>,
    {
        let actual = self.typecheck(prior_capability, expr, type_errors);
        actual.then_typecheck(|mut typ_actual, capability| match typ_actual.data() {
            Some(actual_ty) => {
                if !expected
                    .iter()
                    .any(|expected_ty| Type::is_subtype(actual_ty, expected_ty))
                {
                    type_errors.push(TypeError::UnexpectedType {
                        expected: expected.to_vec(),
                        actual: actual_ty.clone(),
                        help: type_error_help(actual_ty),
                    });
                    // Some code (e.g., typechecking And) depends on
                    // `expect_type` not returning an expression with a type
                    // other than one of the expected types. At the same time,
                    // we need to return an Expr with the children and kind of
                    // the original expression. The easiest way to do this is
                    // to mutate `typ_actual`.
                    typ_actual.set_data(None);
                    TypecheckAnswer::fail(typ_actual)
                } else {
                    TypecheckAnswer::success_with_capability(typ_actual, capability)
                }
            }
            None => {
                typ_actual.set_data(None);
                TypecheckAnswer::fail(typ_actual)
            }
        })
    }

    /// Check that an expression has a type that is a subtype of a given type.
    /// If not, generate a type error and return `TypecheckFail`. Otherwise,
    /// return the type.
    fn expect_type<'b, F>(
        &self,
        prior_capability: &CapabilitySet<'b>,
        expr: &'b Expr,
        expected: Type,
        type_errors: &mut Vec<TypeError>,
        type_error_help: F,
    ) -> TypecheckAnswer<'b>
    where
        F: FnOnce(&Type) -> Option<UnexpectedTypeHelp>,
    {
        self.expect_one_of_types(
            prior_capability,
            expr,
            &[expected],
            type_errors,
            type_error_help,
        )
    }

    /// Return the least upper bound of all types in the `answers` iterator.
    /// If there isn't a least upper bound, then a type error is reported and
    /// `None` is returned.
    fn least_upper_bound_or_error(
        &self,
        answers: impl IntoIterator<Item = Option<Type>>,
        type_errors: &mut Vec<TypeError>,
        context: LubContext,
    ) -> Option<Type> {
        answers
            .into_iter()
            // Inverting this to `Option<Vec<_>>` will cause this to fail to
            // find a least upper bound if any of the input types were not
            // defined.
            .collect::<Option<Vec<_>>>()
            .and_then(|typechecked_types| {
                match Type::reduce_to_least_upper_bound(&typechecked_types) {
                    Err(lub_hint) => {
                        type_errors.push(TypeError::IncompatibleTypes {
                            types: typechecked_types,
                            hint: lub_hint,
                            context,
                        });
                        None
                    }
                    Ok(lub) => Some(lub),
                }
            })
    }
}

/// Convert an extension function signature type (a runtime type tag) into a
/// validator type. Returns `None` for tags that do not identify a single
/// validator type; no extension function in this crate declares one of those.
fn validator_type_of_ext_type(ty: &crate::ast::Type) -> Option<Type> {
    match ty {
        crate::ast::Type::Bool => Some(Type::primitive_boolean()),
        crate::ast::Type::Long => Some(Type::primitive_long()),
        crate::ast::Type::String => Some(Type::primitive_string()),
        crate::ast::Type::Extension { name } => Some(Type::extension(name.clone())),
        crate::ast::Type::Entity { ty } => Some(Type::named_entity_reference(ty.clone())),
        crate::ast::Type::Set | crate::ast::Type::Record => None,
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;
    use crate::ast::Name;
    use crate::validator::test_utils::test_schema;
    use cool_asserts::assert_matches;

    /// Typecheck `e` in the first (only) request env of the test schema.
    fn typecheck(e: &Expr) -> Result<Type, Vec<TypeError>> {
        let schema = test_schema();
        let typechecker = Typechecker::new(&schema);
        let env = schema.request_envs().next().expect("at least one env");
        typechecker
            .typecheck_expr(e, &env)
            .map(|(typed, _)| typed.data().clone().expect("success implies a type"))
    }

    #[track_caller]
    fn assert_types_to(e: Expr, expected: Type) {
        assert_eq!(typecheck(&e), Ok(expected), "{e:?}");
    }

    #[track_caller]
    fn assert_type_error(e: Expr, check: impl FnOnce(&TypeError)) {
        assert_matches!(typecheck(&e), Err(errs) => {
            assert!(!errs.is_empty());
            check(&errs[0]);
        });
    }

    fn user_attr(attr: &str) -> Expr {
        Expr::get_attr(Expr::var(Var::Principal), attr)
    }

    #[test]
    fn variables_type_from_env() {
        assert_types_to(
            Expr::var(Var::Principal),
            Type::named_entity_reference("User".parse().expect("valid")),
        );
        assert_types_to(
            Expr::var(Var::Resource),
            Type::named_entity_reference("Photo".parse().expect("valid")),
        );
        assert_types_to(
            Expr::var(Var::Action),
            Type::named_entity_reference("Action".parse().expect("valid")),
        );
    }

    #[test]
    fn literals_get_singleton_bools() {
        assert_types_to(Expr::val(true), Type::True);
        assert_types_to(Expr::val(false), Type::False);
        assert_types_to(Expr::val(3), Type::primitive_long());
        assert_types_to(Expr::val("str"), Type::primitive_string());
    }

    #[test]
    fn required_attr_access() {
        assert_types_to(user_attr("age"), Type::primitive_long());
        // chained through a required record attribute and a required
        // entity-valued attribute
        assert_types_to(
            Expr::get_attr(Expr::get_attr(user_attr("nested"), "user"), "age"),
            Type::primitive_long(),
        );
    }

    #[test]
    fn optional_attr_requires_capability() {
        // `manager` is optional on the schema, so a naked access is unsafe...
        assert_type_error(user_attr("manager"), |err| {
            assert_matches!(err, TypeError::UnsafeOptionalAttributeAccess { attr } => {
                assert_eq!(attr, "manager");
            })
        });
        // ...a `has` guard upstream of `&&` makes it safe...
        assert_types_to(
            Expr::and(
                Expr::has_attr(Expr::var(Var::Principal), "manager"),
                Expr::is_eq(user_attr("manager"), Expr::var(Var::Principal)),
            ),
            Type::primitive_boolean(),
        );
        // ...but `||` provides no such guarantee.
        assert_type_error(
            Expr::or(
                Expr::has_attr(Expr::var(Var::Principal), "manager"),
                Expr::is_eq(user_attr("manager"), Expr::var(Var::Principal)),
            ),
            |err| assert_matches!(err, TypeError::UnsafeOptionalAttributeAccess { .. }),
        );
        // an `if` guard works for the then branch
        assert_types_to(
            Expr::ite(
                Expr::has_attr(Expr::var(Var::Principal), "manager"),
                Expr::is_eq(user_attr("manager"), Expr::var(Var::Principal)),
                Expr::val(false),
            ),
            Type::primitive_boolean(),
        );
    }

    #[test]
    fn undeclared_attr_is_error_for_get_but_false_for_has() {
        assert_type_error(user_attr("ssn"), |err| {
            assert_matches!(err, TypeError::UnsafeAttributeAccess { attr, .. } => {
                assert_eq!(attr, "ssn");
            })
        });
        assert_types_to(
            Expr::has_attr(Expr::var(Var::Principal), "ssn"),
            Type::False,
        );
    }

    #[test]
    fn and_collapses_statically_false_lhs() {
        // `false && <anything>`: the rhs is not even typechecked, so an
        // otherwise ill-typed rhs is fine and the whole `&&` is False
        assert_types_to(
            Expr::and(Expr::val(false), user_attr("ssn")),
            Type::False,
        );
        // `principal has ssn` is statically False, so the unsafe access on
        // the rhs is unreachable
        assert_types_to(
            Expr::and(
                Expr::has_attr(Expr::var(Var::Principal), "ssn"),
                user_attr("ssn"),
            ),
            Type::False,
        );
    }

    #[test]
    fn eq_on_disjoint_entity_types_is_false() {
        assert_types_to(
            Expr::is_eq(Expr::var(Var::Principal), Expr::var(Var::Resource)),
            Type::False,
        );
        // the same entity type is not statically decidable
        assert_types_to(
            Expr::is_eq(Expr::var(Var::Principal), user_attr("manager")),
            Type::primitive_boolean(),
        );
    }

    #[test]
    fn eq_on_incompatible_non_entity_types_is_error() {
        assert_type_error(Expr::is_eq(user_attr("age"), Expr::val("one")), |err| {
            assert_matches!(err, TypeError::IncompatibleTypes { context: LubContext::Equality, .. })
        });
        // between literals, equality is decided outright instead
        assert_types_to(Expr::is_eq(Expr::val(1), Expr::val("one")), Type::False);
    }

    #[test]
    fn eq_between_literals_is_statically_decided() {
        assert_types_to(Expr::is_eq(Expr::val(1), Expr::val(1)), Type::True);
        assert_types_to(Expr::is_eq(Expr::val(1), Expr::val(2)), Type::False);
    }

    #[test]
    fn conditional_lub() {
        assert_types_to(
            Expr::ite(
                Expr::is_eq(user_attr("age"), Expr::val(0)),
                Expr::val(true),
                Expr::val(false),
            ),
            Type::primitive_boolean(),
        );
        // statically-true guard collapses to the then branch type
        assert_types_to(
            Expr::ite(Expr::val(true), Expr::val(1), Expr::val("two")),
            Type::primitive_long(),
        );
        // incompatible branch types with an unknown guard have no LUB
        assert_type_error(
            Expr::ite(
                Expr::is_eq(user_attr("age"), Expr::val(0)),
                Expr::val(1),
                Expr::val("two"),
            ),
            |err| {
                assert_matches!(
                    err,
                    TypeError::IncompatibleTypes { context: LubContext::Conditional, .. }
                )
            },
        );
    }

    #[test]
    fn set_literal_types() {
        assert_types_to(
            Expr::set([Expr::val(1), Expr::val(2)]),
            Type::set(Type::primitive_long()),
        );
        assert_types_to(
            Expr::set([Expr::val(true), Expr::val(false)]),
            Type::set(Type::primitive_boolean()),
        );
        assert_type_error(Expr::set([Expr::val(1), Expr::val("two")]), |err| {
            assert_matches!(err, TypeError::IncompatibleTypes { context: LubContext::Set, .. })
        });
        assert_type_error(Expr::set([]), |err| {
            assert_matches!(err, TypeError::EmptySetForbidden)
        });
    }

    #[test]
    fn contains_requires_compatible_element() {
        assert_types_to(
            Expr::contains(Expr::set([Expr::val(1), Expr::val(2)]), Expr::val(3)),
            Type::primitive_boolean(),
        );
        assert_type_error(
            Expr::contains(Expr::set([Expr::val(1)]), Expr::val("one")),
            |err| {
                assert_matches!(err, TypeError::IncompatibleTypes { context: LubContext::Contains, .. })
            },
        );
        assert_type_error(
            Expr::contains_any(
                Expr::set([Expr::val(1)]),
                Expr::set([Expr::val("one")]),
            ),
            |err| {
                assert_matches!(
                    err,
                    TypeError::IncompatibleTypes { context: LubContext::ContainsAnyAll, .. }
                )
            },
        );
    }

    #[test]
    fn record_literal_types() {
        assert_types_to(
            Expr::record([("a", Expr::val(1))]),
            Type::record_with_required_attributes(
                [("a".into(), Type::primitive_long())],
                crate::validator::types::OpenTag::ClosedAttributes,
            ),
        );
        assert_types_to(
            Expr::get_attr(Expr::record([("a", Expr::val(1))]), "a"),
            Type::primitive_long(),
        );
    }

    #[test]
    fn entity_hierarchy_membership_types() {
        // User is a member of Group in the schema, so this is only known to
        // be boolean
        assert_types_to(
            Expr::is_in(
                Expr::var(Var::Principal),
                Expr::val(EntityUID::with_eid_and_type("Group", "admins").expect("valid")),
            ),
            Type::primitive_boolean(),
        );
        // Photos are never members of Groups
        assert_types_to(
            Expr::is_in(
                Expr::var(Var::Resource),
                Expr::val(EntityUID::with_eid_and_type("Group", "admins").expect("valid")),
            ),
            Type::False,
        );
    }

    #[test]
    fn action_hierarchy_resolved_statically() {
        let view = EntityUID::with_eid_and_type("Action", "view").expect("valid");
        let read_only = EntityUID::with_eid_and_type("Action", "readOnly").expect("valid");
        // view is a member of readOnly in the schema
        assert_types_to(
            Expr::is_in(Expr::val(view.clone()), Expr::val(read_only.clone())),
            Type::True,
        );
        assert_types_to(
            Expr::is_in(Expr::val(read_only.clone()), Expr::val(view.clone())),
            Type::False,
        );
        // the `action` variable is resolved the same way (the env action is
        // `view`)
        assert_types_to(
            Expr::is_in(Expr::var(Var::Action), Expr::val(read_only.clone())),
            Type::True,
        );
        // also when the rhs is a set of literals
        assert_types_to(
            Expr::is_in(
                Expr::var(Var::Action),
                Expr::set([Expr::val(read_only), Expr::val(view)]),
            ),
            Type::True,
        );
        // an action is never in a non-action entity
        assert_types_to(
            Expr::is_in(
                Expr::var(Var::Action),
                Expr::val(EntityUID::with_eid_and_type("Group", "admins").expect("valid")),
            ),
            Type::False,
        );
    }

    #[test]
    fn is_entity_type_statically_resolved() {
        assert_types_to(
            Expr::is_entity_type(
                Expr::var(Var::Principal),
                "User".parse().expect("valid"),
            ),
            Type::True,
        );
        assert_types_to(
            Expr::is_entity_type(
                Expr::var(Var::Principal),
                "Photo".parse().expect("valid"),
            ),
            Type::False,
        );
    }

    #[test]
    fn tags_require_has_tag_guard() {
        let get_tag = Expr::get_tag(Expr::var(Var::Principal), Expr::val("dept"));
        assert_type_error(get_tag.clone(), |err| {
            assert_matches!(err, TypeError::UnsafeTagAccess)
        });
        assert_types_to(
            Expr::and(
                Expr::has_tag(Expr::var(Var::Principal), Expr::val("dept")),
                Expr::is_eq(get_tag, Expr::val("eng")),
            ),
            Type::primitive_boolean(),
        );
        // Photo declares no tags, so hasTag on it is statically false
        assert_types_to(
            Expr::has_tag(Expr::var(Var::Resource), Expr::val("dept")),
            Type::False,
        );
        assert_type_error(
            Expr::get_tag(Expr::var(Var::Resource), Expr::val("dept")),
            |err| assert_matches!(err, TypeError::NoTagsAllowed { .. }),
        );
    }

    #[test]
    #[cfg(feature = "decimal")]
    fn extension_functions() {
        let decimal = Name::parse_unqualified_name("decimal").expect("valid");
        assert_types_to(
            Expr::call_extension_fn(decimal.clone(), vec![Expr::val("1.23")]),
            Type::extension(decimal.clone()),
        );
        // bad literal arguments to a constructor are static errors
        assert_type_error(
            Expr::call_extension_fn(decimal.clone(), vec![Expr::val("bogus")]),
            |err| assert_matches!(err, TypeError::FunctionArgumentValidation { .. }),
        );
        // wrong arity
        assert_type_error(
            Expr::call_extension_fn(decimal.clone(), vec![Expr::val("1.0"), Expr::val("2.0")]),
            |err| assert_matches!(err, TypeError::WrongNumberArguments { expected: 1, actual: 2 }),
        );
        // non-literal constructor arguments are rejected, even when they have
        // the right type
        assert_type_error(
            Expr::call_extension_fn(decimal, vec![user_attr("email")]),
            |err| assert_matches!(err, TypeError::NonLitExtConstructor),
        );
        // undefined function
        assert_type_error(
            Expr::call_extension_fn(
                Name::parse_unqualified_name("frobnicate").expect("valid"),
                vec![],
            ),
            |err| assert_matches!(err, TypeError::UndefinedFunction { .. }),
        );
    }

    #[test]
    fn arithmetic_and_comparison_types() {
        assert_types_to(
            Expr::add(user_attr("age"), Expr::val(1)),
            Type::primitive_long(),
        );
        assert_types_to(
            Expr::less(user_attr("age"), Expr::val(21)),
            Type::primitive_boolean(),
        );
        assert_type_error(Expr::add(Expr::val(1), Expr::val("two")), |err| {
            assert_matches!(err, TypeError::UnexpectedType { .. })
        });
        assert_type_error(Expr::not(Expr::val(1)), |err| {
            assert_matches!(err, TypeError::UnexpectedType { .. })
        });
        assert_types_to(Expr::not(Expr::val(true)), Type::False);
        assert_types_to(Expr::neg(Expr::val(7)), Type::primitive_long());
    }

    #[test]
    fn attribute_levels_decrement_through_derefs() {
        use crate::validator::types::Level;
        let schema = test_schema();
        let typechecker = Typechecker::new(&schema);
        let env = schema.request_envs().next().expect("at least one env");
        // walk into the typed AST for `principal.manager` (guarded, so it
        // typechecks) and check the level on the attribute type
        let guarded = Expr::and(
            Expr::has_attr(Expr::var(Var::Principal), "manager"),
            Expr::is_entity_type(user_attr("manager"), "User".parse().expect("valid")),
        );
        let (typed, _) = typechecker
            .typecheck_expr(&guarded, &env)
            .expect("typechecks");
        // find the `is` node's operand type
        let ExprKind::And { right, .. } = typed.expr_kind() else {
            panic!("expected and");
        };
        let ExprKind::Is { expr, .. } = right.expr_kind() else {
            panic!("expected is");
        };
        // the principal root is Infinite, so one dereference stays Infinite
        assert_eq!(
            expr.data(),
            &Some(Type::entity_reference_with_level(
                "User".parse().expect("valid"),
                Level::Infinite
            ))
        );
    }
}
