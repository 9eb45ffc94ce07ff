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

use crate::ast::{Name, StaticallyTyped, Type, Value};
use crate::evaluator;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Display};

/// Extension, which can define new types and functions on those types.
pub struct Extension {
    /// Name of the extension
    name: Name,
    /// Extension functions. These are legal to call in expressions.
    functions: HashMap<Name, ExtensionFunction>,
}

impl Extension {
    /// Create a new `Extension` with the given name and extension functions
    pub fn new(name: Name, functions: impl IntoIterator<Item = ExtensionFunction>) -> Self {
        Self {
            name,
            functions: functions.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    /// Get the name of the extension
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Look up a function by name, or return `None` if the extension doesn't
    /// provide a function with that name
    pub fn get_func(&self, name: &Name) -> Option<&ExtensionFunction> {
        self.functions.get(name)
    }

    /// Get an iterator over the functions
    pub fn funcs(&self) -> impl Iterator<Item = &ExtensionFunction> {
        self.functions.values()
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<extension {}>", self.name())
    }
}

/// Which "style" is a function call
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum CallStyle {
    /// Function-style, eg foo(a, b)
    FunctionStyle,
    /// Method-style, eg a.foo(b)
    MethodStyle,
}

/// Trait object that implements the extension function call.
pub type ExtensionFunctionObject =
    Box<dyn Fn(&[Value]) -> evaluator::Result<Value> + Sync + Send + 'static>;

/// Extension function. These can be called by the given `name` in expressions.
pub struct ExtensionFunction {
    /// Name of the function
    name: Name,
    /// Which `CallStyle` should be used when calling this function
    style: CallStyle,
    /// The actual function, which takes an `&[Value]` and returns a `Value`,
    /// or an evaluation error
    func: ExtensionFunctionObject,
    /// The return type of this function. We require that this be constant --
    /// any given extension function must always return a value of this type.
    return_type: Type,
    /// The argument types that this function expects. If any given argument
    /// type is not constant (function works with multiple types) then this
    /// will be `None` for that argument.
    arg_types: Vec<Option<Type>>,
}

impl ExtensionFunction {
    /// Create a new `ExtensionFunction` taking any number of arguments
    fn new(
        name: Name,
        style: CallStyle,
        func: ExtensionFunctionObject,
        return_type: Type,
        arg_types: Vec<Option<Type>>,
    ) -> Self {
        Self {
            name,
            func,
            style,
            return_type,
            arg_types,
        }
    }

    /// Create a new `ExtensionFunction` taking one argument
    pub fn unary(
        name: Name,
        style: CallStyle,
        func: Box<dyn Fn(&Value) -> evaluator::Result<Value> + Sync + Send + 'static>,
        return_type: Type,
        arg_type: Option<Type>,
    ) -> Self {
        Self::new(
            name.clone(),
            style,
            Box::new(move |args: &[Value]| match args {
                [arg] => func(arg),
                _ => Err(evaluator::EvaluationError::wrong_num_arguments(
                    name.clone(),
                    1,
                    args.len(),
                )),
            }),
            return_type,
            vec![arg_type],
        )
    }

    /// Create a new `ExtensionFunction` taking two arguments
    pub fn binary(
        name: Name,
        style: CallStyle,
        func: Box<dyn Fn(&Value, &Value) -> evaluator::Result<Value> + Sync + Send + 'static>,
        return_type: Type,
        arg_types: (Option<Type>, Option<Type>),
    ) -> Self {
        Self::new(
            name.clone(),
            style,
            Box::new(move |args: &[Value]| match args {
                [first, second] => func(first, second),
                _ => Err(evaluator::EvaluationError::wrong_num_arguments(
                    name.clone(),
                    2,
                    args.len(),
                )),
            }),
            return_type,
            vec![arg_types.0, arg_types.1],
        )
    }

    /// Get the `Name` of the `ExtensionFunction`
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Get the `CallStyle` of the `ExtensionFunction`
    pub fn style(&self) -> CallStyle {
        self.style
    }

    /// Get the return type of the `ExtensionFunction`
    pub fn return_type(&self) -> &Type {
        &self.return_type
    }

    /// Get the argument types of the `ExtensionFunction`.
    ///
    /// If any given argument type is not constant (function works with
    /// multiple types) then this will be `None` for that argument.
    pub fn arg_types(&self) -> &[Option<Type>] {
        &self.arg_types
    }

    /// Returns `true` if this function is considered a "constructor": it
    /// returns an extension value, and takes only non-extension arguments of
    /// known type.
    pub fn is_constructor(&self) -> bool {
        matches!(self.return_type(), Type::Extension { .. })
            && self.arg_types().iter().all(Option::is_some)
            && !self
                .arg_types()
                .iter()
                .any(|ty| matches!(ty, Some(Type::Extension { .. })))
    }

    /// Call the `ExtensionFunction` with the given args
    pub fn call(&self, args: &[Value]) -> evaluator::Result<Value> {
        (self.func)(args)
    }
}

impl std::fmt::Debug for ExtensionFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<extension function {}>", self.name())
    }
}

/// Extension value.
///
/// Anything implementing this trait can be used as a first-class value in the
/// language. For instance, the `ipaddr` extension uses this mechanism to
/// implement IP addresses as first-class values.
pub trait ExtensionValue: Debug + Display + Send + Sync {
    /// Get the name of the type of this value.
    ///
    /// The language has nominal typing, so two values have the same type iff
    /// they return the same typename here.
    fn typename(&self) -> Name;
}

impl<V: ExtensionValue> StaticallyTyped for V {
    fn type_of(&self) -> Type {
        Type::Extension {
            name: self.typename(),
        }
    }
}

/// Extensions provide a type implementing `ExtensionValue`, `Eq`, and `Ord`.
/// We automatically implement `InternalExtensionValue` for that type, which
/// erases the concrete type so that heterogeneous extension values can live in
/// one `Value` variant while still supporting equality and total ordering.
pub trait InternalExtensionValue: ExtensionValue {
    /// Convert `self` into `Any`
    fn as_any(&self) -> &dyn Any;
    /// Equality between (dynamically typed) extension values. Values of
    /// different concrete types are simply unequal.
    fn equals_extvalue(&self, other: &dyn InternalExtensionValue) -> bool;
    /// Compare two (dynamically typed) extension values. Values of different
    /// concrete types are ordered by their typenames.
    fn cmp_extvalue(&self, other: &dyn InternalExtensionValue) -> std::cmp::Ordering;
}

impl<V: 'static + Eq + Ord + ExtensionValue> InternalExtensionValue for V {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals_extvalue(&self, other: &dyn InternalExtensionValue) -> bool {
        other
            .as_any()
            .downcast_ref::<V>()
            .is_some_and(|other| self == other)
    }

    fn cmp_extvalue(&self, other: &dyn InternalExtensionValue) -> std::cmp::Ordering {
        match other.as_any().downcast_ref::<V>() {
            Some(other) => self.cmp(other),
            // downcast failed, so the two values have different concrete
            // types; typenames are distinct for distinct types
            None => self.typename().cmp(&other.typename()),
        }
    }
}
