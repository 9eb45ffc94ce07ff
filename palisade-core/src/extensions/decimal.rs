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

//! This module contains the 'decimal' extension.

use crate::ast::{
    CallStyle, Extension, ExtensionFunction, ExtensionValue, Literal, Name, StaticallyTyped, Type,
    Value,
};
use crate::evaluator;
use miette::Diagnostic;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Number of digits supported after the decimal
const NUM_DIGITS: u32 = 4;

/// Decimal value, represented internally as an integer.
/// `Decimal{value}` represents `value / 10^NUM_DIGITS`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
struct Decimal {
    value: i64,
}

// PANIC SAFETY The `Name`s and `Regex` here are valid
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod constants {
    use super::{Name, EXTENSION_NAME};
    use regex::Regex;

    // PANIC SAFETY all of the names here are valid names
    lazy_static::lazy_static! {
        pub static ref DECIMAL_FROM_STR_NAME : Name = Name::parse_unqualified_name(EXTENSION_NAME).expect("should be a valid identifier");
        pub static ref LESS_THAN : Name = Name::parse_unqualified_name("lessThan").expect("should be a valid identifier");
        pub static ref LESS_THAN_OR_EQUAL : Name = Name::parse_unqualified_name("lessThanOrEqual").expect("should be a valid identifier");
        pub static ref GREATER_THAN : Name = Name::parse_unqualified_name("greaterThan").expect("should be a valid identifier");
        pub static ref GREATER_THAN_OR_EQUAL : Name = Name::parse_unqualified_name("greaterThanOrEqual").expect("should be a valid identifier");
    }

    // Global regex, initialized at first use
    // PANIC SAFETY This is a valid `Regex`
    lazy_static::lazy_static! {
        pub static ref DECIMAL_REGEX : Regex = Regex::new(r"^(-?\d+)\.(\d+)$").unwrap();
    }
}

/// Help message to display when a String was provided where a decimal value
/// was expected. This error is likely due to confusion between "1.23" and
/// decimal("1.23").
const ADVICE_MSG: &str = "maybe you forgot to apply the `decimal` constructor?";

/// Potential errors when working with decimal values. Note that these are
/// converted to an extension-function evaluation error (which takes a string
/// argument) before being reported to users.
#[derive(Debug, Diagnostic, Error)]
enum Error {
    /// Error parsing the input string as a decimal value
    #[error("`{0}` is not a well-formed decimal value")]
    FailedParse(String),

    /// Too many digits after the decimal point
    #[error("too many digits after the decimal in `{0}`")]
    #[diagnostic(help("at most {NUM_DIGITS} digits are supported"))]
    TooManyDigits(String),

    /// Overflow occurred when converting to a decimal value
    #[error("overflow when converting to decimal")]
    Overflow,
}

/// Computes x * 10 ^ y while checking for overflows
fn checked_mul_pow(x: i64, y: u32) -> Result<i64, Error> {
    if let Some(z) = i64::checked_pow(10, y) {
        if let Some(w) = i64::checked_mul(x, z) {
            return Ok(w);
        }
    };
    Err(Error::Overflow)
}

impl Decimal {
    /// The typename of decimal values
    fn typename() -> Name {
        constants::DECIMAL_FROM_STR_NAME.clone()
    }

    /// Convert a string into a `Decimal` value.
    ///
    /// Matches against the regular expression `-?[0-9]+.[0-9]+`, which
    /// requires a decimal point and at least one digit before and after the
    /// decimal. We also enforce at most NUM_DIGITS digits after the decimal.
    ///
    /// Our representation stores the decimal number `d` as the 64-bit integer
    /// `d * 10 ^ NUM_DIGITS`; this function will error on overflow.
    fn from_str(str: impl AsRef<str>) -> Result<Self, Error> {
        // check that the string matches the regex
        if !constants::DECIMAL_REGEX.is_match(str.as_ref()) {
            return Err(Error::FailedParse(str.as_ref().to_owned()));
        }

        // pull out the components before and after the decimal point
        // (the check above should ensure that .captures() and .get() succeed,
        // but we include proper error handling for posterity)
        let caps = constants::DECIMAL_REGEX
            .captures(str.as_ref())
            .ok_or_else(|| Error::FailedParse(str.as_ref().to_owned()))?;
        let l = caps
            .get(1)
            .ok_or_else(|| Error::FailedParse(str.as_ref().to_owned()))?
            .as_str();
        let r = caps
            .get(2)
            .ok_or_else(|| Error::FailedParse(str.as_ref().to_owned()))?
            .as_str();

        // convert the left component to i64 and multiply by `10 ^ NUM_DIGITS`
        let l = i64::from_str(l).map_err(|_| Error::Overflow)?;
        let l = checked_mul_pow(l, NUM_DIGITS)?;

        // convert the right component to i64 and multiply by `10 ^ (NUM_DIGITS - len)`
        let len: u32 = r.len().try_into().map_err(|_| Error::Overflow)?;
        if NUM_DIGITS < len {
            return Err(Error::TooManyDigits(str.as_ref().to_string()));
        }
        let r = i64::from_str(r).map_err(|_| Error::Overflow)?;
        let r = checked_mul_pow(r, NUM_DIGITS - len)?;

        // compute the value
        if l >= 0 {
            l.checked_add(r)
        } else {
            l.checked_sub(r)
        }
        .map(|value| Self { value })
        .ok_or(Error::Overflow)
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}",
            self.value / i64::pow(10, NUM_DIGITS),
            (self.value % i64::pow(10, NUM_DIGITS)).abs()
        )
    }
}

impl ExtensionValue for Decimal {
    fn typename(&self) -> Name {
        Self::typename()
    }
}

const EXTENSION_NAME: &str = "decimal";

fn extension_err(msg: impl Into<String>) -> evaluator::EvaluationError {
    evaluator::EvaluationError::failed_extension_function_application(
        constants::DECIMAL_FROM_STR_NAME.clone(),
        msg.into(),
    )
}

/// Extension function that constructs a `decimal` value from a string
fn decimal_from_str(arg: &Value) -> evaluator::Result<Value> {
    let str = arg.get_as_string()?;
    let decimal = Decimal::from_str(str.as_str()).map_err(|e| extension_err(e.to_string()))?;
    Ok(Value::ExtensionValue(Arc::new(decimal)))
}

/// Check that `v` is a decimal type and, if it is, return the wrapped value
fn as_decimal(v: &Value) -> Result<&Decimal, evaluator::EvaluationError> {
    match v {
        Value::ExtensionValue(ev) if ev.typename() == Decimal::typename() => {
            // PANIC SAFETY Conditional above performs a typecheck
            #[allow(clippy::expect_used)]
            let d = ev
                .as_any()
                .downcast_ref::<Decimal>()
                .expect("already typechecked, so this downcast should succeed");
            Ok(d)
        }
        Value::Lit(Literal::String(_)) => Err(evaluator::EvaluationError::type_error_with_advice(
            vec![Type::Extension {
                name: Decimal::typename(),
            }],
            v.type_of(),
            ADVICE_MSG.into(),
        )),
        _ => Err(evaluator::EvaluationError::type_error(
            vec![Type::Extension {
                name: Decimal::typename(),
            }],
            v.type_of(),
        )),
    }
}

/// Extension function that tests whether the first `decimal` value is less
/// than the second `decimal` value, returning a bool
fn decimal_lt(left: &Value, right: &Value) -> evaluator::Result<Value> {
    let left = as_decimal(left)?;
    let right = as_decimal(right)?;
    Ok(Value::from(left < right))
}

/// Extension function that tests whether the first `decimal` value is less
/// than or equal to the second `decimal` value, returning a bool
fn decimal_le(left: &Value, right: &Value) -> evaluator::Result<Value> {
    let left = as_decimal(left)?;
    let right = as_decimal(right)?;
    Ok(Value::from(left <= right))
}

/// Extension function that tests whether the first `decimal` value is greater
/// than the second `decimal` value, returning a bool
fn decimal_gt(left: &Value, right: &Value) -> evaluator::Result<Value> {
    let left = as_decimal(left)?;
    let right = as_decimal(right)?;
    Ok(Value::from(left > right))
}

/// Extension function that tests whether the first `decimal` value is greater
/// than or equal to the second `decimal` value, returning a bool
fn decimal_ge(left: &Value, right: &Value) -> evaluator::Result<Value> {
    let left = as_decimal(left)?;
    let right = as_decimal(right)?;
    Ok(Value::from(left >= right))
}

/// Construct the extension
pub fn extension() -> Extension {
    let decimal_type = Type::Extension {
        name: Decimal::typename(),
    };
    Extension::new(
        constants::DECIMAL_FROM_STR_NAME.clone(),
        vec![
            ExtensionFunction::unary(
                constants::DECIMAL_FROM_STR_NAME.clone(),
                CallStyle::FunctionStyle,
                Box::new(decimal_from_str),
                decimal_type.clone(),
                Some(Type::String),
            ),
            ExtensionFunction::binary(
                constants::LESS_THAN.clone(),
                CallStyle::MethodStyle,
                Box::new(decimal_lt),
                Type::Bool,
                (Some(decimal_type.clone()), Some(decimal_type.clone())),
            ),
            ExtensionFunction::binary(
                constants::LESS_THAN_OR_EQUAL.clone(),
                CallStyle::MethodStyle,
                Box::new(decimal_le),
                Type::Bool,
                (Some(decimal_type.clone()), Some(decimal_type.clone())),
            ),
            ExtensionFunction::binary(
                constants::GREATER_THAN.clone(),
                CallStyle::MethodStyle,
                Box::new(decimal_gt),
                Type::Bool,
                (Some(decimal_type.clone()), Some(decimal_type.clone())),
            ),
            ExtensionFunction::binary(
                constants::GREATER_THAN_OR_EQUAL.clone(),
                CallStyle::MethodStyle,
                Box::new(decimal_ge),
                Type::Bool,
                (Some(decimal_type.clone()), Some(decimal_type)),
            ),
        ],
    )
}
