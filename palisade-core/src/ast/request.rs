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

use crate::ast::{EntityType, EntityUID, StaticallyTyped, Type, Value};
use miette::Diagnostic;
use thiserror::Error;

/// An authorization request: the three request entities plus the context
/// record. The context is an evaluated `Value`, not an expression; building a
/// `Request` cannot itself error at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Principal associated with the request
    principal: EntityUID,
    /// Action associated with the request
    action: EntityUID,
    /// Resource associated with the request
    resource: EntityUID,
    /// Context associated with the request; always a `Value::Record`
    context: Value,
}

/// Error constructing a `Request` whose context is not a record.
#[derive(Debug, Clone, PartialEq, Eq, Diagnostic, Error)]
#[error("expected context to be a record, got {actual}")]
pub struct BadContextError {
    /// The runtime type the context actually had
    actual: Type,
}

impl Request {
    /// Construct a new `Request`. Errors if `context` is not a record value.
    pub fn new(
        principal: EntityUID,
        action: EntityUID,
        resource: EntityUID,
        context: Value,
    ) -> Result<Self, BadContextError> {
        match context {
            Value::Record(_) => Ok(Self {
                principal,
                action,
                resource,
                context,
            }),
            v => Err(BadContextError {
                actual: v.type_of(),
            }),
        }
    }

    /// Construct a new `Request` with an empty context.
    pub fn with_empty_context(
        principal: EntityUID,
        action: EntityUID,
        resource: EntityUID,
    ) -> Self {
        Self {
            principal,
            action,
            resource,
            context: Value::empty_record(),
        }
    }

    /// Get the principal associated with the request
    pub fn principal(&self) -> &EntityUID {
        &self.principal
    }

    /// Get the action associated with the request
    pub fn action(&self) -> &EntityUID {
        &self.action
    }

    /// Get the resource associated with the request
    pub fn resource(&self) -> &EntityUID {
        &self.resource
    }

    /// Get the context of the request
    pub fn context(&self) -> &Value {
        &self.context
    }

    /// The `RequestType` this request belongs to
    pub fn request_type(&self) -> RequestType {
        RequestType {
            principal: self.principal.entity_type().clone(),
            action: self.action.clone(),
            resource: self.resource.entity_type().clone(),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "request with principal {}, action {}, resource {}, and context {}",
            self.principal, self.action, self.resource, self.context
        )
    }
}

/// The type of an authorization request: concrete types for the three request
/// entities. (The action is a UID rather than a type, because the schema
/// declares behavior per-action.)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestType {
    /// Principal type
    pub principal: EntityType,
    /// Action
    pub action: EntityUID,
    /// Resource type
    pub resource: EntityType,
}
