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

use crate::ast::{BinaryOp, EntityUID, Name, Type, UnaryOp, Value};
use miette::Diagnostic;
use smol_str::SmolStr;
use std::sync::Arc;
use thiserror::Error;

/// An error generated while evaluating an expression
#[derive(Debug, PartialEq, Eq, Clone, Diagnostic, Error)]
pub struct EvaluationError {
    /// The kind of error that occurred
    error_kind: EvaluationErrorKind,
    /// Optional advice on how to fix the error
    advice: Option<String>,
}

impl std::fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(help_msg) = &self.advice {
            write!(f, "{}. {}", self.error_kind, help_msg)
        } else {
            self.error_kind.fmt(f)
        }
    }
}

impl EvaluationError {
    /// Extract the kind of issue detected during evaluation
    pub fn error_kind(&self) -> &EvaluationErrorKind {
        &self.error_kind
    }

    /// Extract the advice attached to the error, if any
    pub fn advice(&self) -> Option<&str> {
        self.advice.as_deref()
    }

    /// Set the advice field of an error
    pub fn set_advice(&mut self, advice: String) {
        self.advice = Some(advice);
    }

    /// Construct a [`EvaluationErrorKind::EntityDoesNotExist`] error
    pub(crate) fn entity_does_not_exist(euid: Arc<EntityUID>) -> Self {
        Self {
            error_kind: EvaluationErrorKind::EntityDoesNotExist(euid),
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::EntityAttrDoesNotExist`] error
    pub(crate) fn entity_attr_does_not_exist(entity: Arc<EntityUID>, attr: SmolStr) -> Self {
        Self {
            error_kind: EvaluationErrorKind::EntityAttrDoesNotExist { entity, attr },
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::EntityTagDoesNotExist`] error
    pub(crate) fn entity_tag_does_not_exist(entity: Arc<EntityUID>, tag: SmolStr) -> Self {
        Self {
            error_kind: EvaluationErrorKind::EntityTagDoesNotExist { entity, tag },
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::RecordAttrDoesNotExist`] error
    pub(crate) fn record_attr_does_not_exist(attr: SmolStr, alternatives: Vec<SmolStr>) -> Self {
        Self {
            error_kind: EvaluationErrorKind::RecordAttrDoesNotExist(attr, alternatives),
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::TypeError`] error
    pub(crate) fn type_error(expected: Vec<Type>, actual: Type) -> Self {
        Self {
            error_kind: EvaluationErrorKind::TypeError { expected, actual },
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::TypeError`] error with the advice field set
    pub(crate) fn type_error_with_advice(
        expected: Vec<Type>,
        actual: Type,
        advice: String,
    ) -> Self {
        Self {
            error_kind: EvaluationErrorKind::TypeError { expected, actual },
            advice: Some(advice),
        }
    }

    /// Construct a [`EvaluationErrorKind::WrongNumArguments`] error
    pub(crate) fn wrong_num_arguments(function_name: Name, expected: usize, actual: usize) -> Self {
        Self {
            error_kind: EvaluationErrorKind::WrongNumArguments {
                function_name,
                expected,
                actual,
            },
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::FailedExtensionFunctionApplication`] error
    pub(crate) fn failed_extension_function_application(extension_name: Name, msg: String) -> Self {
        Self {
            error_kind: EvaluationErrorKind::FailedExtensionFunctionApplication {
                extension_name,
                msg,
            },
            advice: None,
        }
    }

    /// Construct a [`EvaluationErrorKind::RecursionLimit`] error
    pub(crate) fn recursion_limit() -> Self {
        Self {
            error_kind: EvaluationErrorKind::RecursionLimit,
            advice: None,
        }
    }
}

impl From<crate::extensions::ExtensionFunctionLookupError> for EvaluationError {
    fn from(err: crate::extensions::ExtensionFunctionLookupError) -> Self {
        Self {
            error_kind: err.into(),
            advice: None,
        }
    }
}

impl From<IntegerOverflowError> for EvaluationError {
    fn from(err: IntegerOverflowError) -> Self {
        Self {
            error_kind: err.into(),
            advice: None,
        }
    }
}

/// Enumeration of the possible errors that can occur during evaluation
#[derive(Debug, PartialEq, Eq, Clone, Diagnostic, Error)]
pub enum EvaluationErrorKind {
    /// Tried to lookup this entity UID, but it didn't exist in the provided
    /// entities
    #[error("entity does not exist: {0}")]
    EntityDoesNotExist(Arc<EntityUID>),

    /// Tried to get this attribute, but the specified entity didn't
    /// have that attribute
    #[error("`{}` does not have the attribute: {}", &.entity, &.attr)]
    EntityAttrDoesNotExist {
        /// Entity that didn't have the attribute
        entity: Arc<EntityUID>,
        /// Name of the attribute it didn't have
        attr: SmolStr,
    },

    /// Tried to get this tag, but the specified entity didn't have that tag
    #[error("`{}` does not have the tag: {}", &.entity, &.tag)]
    EntityTagDoesNotExist {
        /// Entity that didn't have the tag
        entity: Arc<EntityUID>,
        /// Name of the tag it didn't have
        tag: SmolStr,
    },

    /// Tried to get an attribute of a (first-class) record, but that record
    /// didn't have that attribute
    #[error("record does not have the attribute: {0}; available attributes: {1:?}")]
    RecordAttrDoesNotExist(SmolStr, Vec<SmolStr>),

    /// An error occurred when looking up an extension function
    #[error(transparent)]
    #[diagnostic(transparent)]
    FailedExtensionFunctionLookup(#[from] crate::extensions::ExtensionFunctionLookupError),

    /// Tried to evaluate an operation on values with incorrect types for that
    /// operation
    // INVARIANT `expected` must be non-empty
    #[error("{}", pretty_type_error(.expected, .actual))]
    TypeError {
        /// Expected one of these types
        expected: Vec<Type>,
        /// Encountered this type instead
        actual: Type,
    },

    /// Wrong number of arguments provided to an extension function
    #[error("wrong number of arguments provided to extension function {function_name}: expected {expected}, got {actual}")]
    WrongNumArguments {
        /// arguments to this function
        function_name: Name,
        /// expected number of arguments
        expected: usize,
        /// actual number of arguments
        actual: usize,
    },

    /// Overflow during an integer operation
    #[error(transparent)]
    #[diagnostic(transparent)]
    IntegerOverflow(#[from] IntegerOverflowError),

    /// Error with the use of "restricted" expressions -- in particular,
    /// an extension function failed during evaluation
    #[error("extension function `{extension_name}` failed: {msg}")]
    FailedExtensionFunctionApplication {
        /// Name of the extension whose function failed
        extension_name: Name,
        /// Error message from the extension
        msg: String,
    },

    /// Maximum recursion limit reached for expression evaluation
    #[error("recursion limit reached")]
    RecursionLimit,
}

/// helper function for pretty-printing type errors
fn pretty_type_error(expected: &[Type], actual: &Type) -> String {
    match expected {
        [single] => format!("type error: expected {single}, got {actual}"),
        _ => {
            use itertools::Itertools;
            format!(
                "type error: expected one of [{}], got {actual}",
                expected.iter().join(", ")
            )
        }
    }
}

/// Error thrown when a checked integer operation overflows
#[derive(Debug, PartialEq, Eq, Clone, Diagnostic, Error)]
pub enum IntegerOverflowError {
    /// Overflow during a binary operation
    #[error("integer overflow while attempting to {} the values `{arg1}` and `{arg2}`", binary_op_verb(.op))]
    BinaryOp {
        /// overflowing operation
        op: BinaryOp,
        /// first argument to that operation
        arg1: Value,
        /// second argument to that operation
        arg2: Value,
    },

    /// Overflow during a unary operation
    #[error("integer overflow while attempting to {} the value `{arg}`", unary_op_verb(.op))]
    UnaryOp {
        /// overflowing operation
        op: UnaryOp,
        /// argument to that operation
        arg: Value,
    },
}

fn binary_op_verb(op: &BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "subtract",
        BinaryOp::Mul => "multiply",
        _ => "apply an operator to",
    }
}

fn unary_op_verb(op: &UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "negate",
        UnaryOp::Not => "apply an operator to",
    }
}

/// Type alias for convenience
pub type Result<T> = std::result::Result<T, EvaluationError>;
