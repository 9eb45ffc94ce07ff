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

//! Validator for expressions against a schema: typechecking with capability
//! tracking, and level validation of the resulting typed AST.

pub mod level_validate;
pub mod schema;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod typecheck;
pub mod types;
pub mod validation_errors;

use crate::ast::Expr;
use miette::Diagnostic;
use thiserror::Error;

pub use level_validate::{level_satisfied, validate_level, EntityDerefLevel};
pub use schema::{SchemaError, SchemaFragment, ValidatorSchema};
pub use typecheck::Typechecker;
pub use types::{CapabilitySet, Level, RequestEnv, Type};
pub use validation_errors::{LevelValidationError, TypeError};

/// An error found during validation: either a static type error or a level
/// violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Diagnostic, Error)]
pub enum ValidationError {
    /// A static type error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Type(#[from] TypeError),
    /// A level violation
    #[error(transparent)]
    #[diagnostic(transparent)]
    Level(#[from] LevelValidationError),
}

/// Validator for expressions, wrapping a schema.
#[derive(Debug)]
pub struct Validator {
    schema: ValidatorSchema,
}

impl Validator {
    /// Construct a new `Validator` with a schema.
    pub fn new(schema: ValidatorSchema) -> Self {
        Self { schema }
    }

    /// The wrapped schema
    pub fn schema(&self) -> &ValidatorSchema {
        &self.schema
    }

    /// Typecheck `e` against every request environment the schema declares,
    /// collecting all errors.
    pub fn validate_expr(&self, e: &Expr) -> Result<(), Vec<ValidationError>> {
        let typechecker = Typechecker::new(&self.schema);
        let mut errors = Vec::new();
        for env in self.schema.request_envs() {
            if let Err(errs) = typechecker.typecheck_expr(e, &env) {
                errors.extend(errs.into_iter().map(ValidationError::from));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Typecheck `e` against every request environment, and additionally
    /// check that every entity-dereference chain stays within `max_level`
    /// hops. Level validation only runs for environments where typechecking
    /// passed, since it walks the type-annotated AST.
    pub fn validate_expr_with_level(
        &self,
        e: &Expr,
        max_level: u32,
    ) -> Result<(), Vec<ValidationError>> {
        let typechecker = Typechecker::new(&self.schema);
        let mut errors = Vec::new();
        for env in self.schema.request_envs() {
            match typechecker.typecheck_expr(e, &env) {
                Ok((typed, _)) => {
                    if let Err(errs) = validate_level(&typed, &env, max_level) {
                        errors.extend(errs.into_iter().map(ValidationError::from));
                    }
                }
                Err(errs) => {
                    errors.extend(errs.into_iter().map(ValidationError::from));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
// PANIC SAFETY: Unit Test Code
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod test {
    use super::*;
    use crate::ast::Var;
    use cool_asserts::assert_matches;

    #[test]
    fn validator_runs_both_phases() {
        let validator = Validator::new(test_utils::test_schema());
        let age_check = Expr::less(
            Expr::get_attr(Expr::var(Var::Principal), "age"),
            Expr::val(21),
        );
        assert_eq!(validator.validate_expr(&age_check), Ok(()));
        assert_eq!(validator.validate_expr_with_level(&age_check, 1), Ok(()));
        assert_matches!(
            validator.validate_expr_with_level(&age_check, 0),
            Err(errs) => assert_matches!(errs[0], ValidationError::Level(_))
        );
        let bad = Expr::get_attr(Expr::var(Var::Principal), "ssn");
        assert_matches!(
            validator.validate_expr(&bad),
            Err(errs) => assert_matches!(errs[0], ValidationError::Type(_))
        );
    }
}
