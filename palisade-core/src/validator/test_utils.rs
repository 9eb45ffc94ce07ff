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

//! Schema fixtures shared by validator, level-checker, and slicer tests.

use crate::validator::schema::ValidatorSchema;

/// A schema exercising every feature the validator cares about: entity and
/// action hierarchies, required and optional attributes, entity-valued and
/// record-valued attributes, and tags. Only the `view` action declares request
/// environments, so `request_envs()` yields exactly one env
/// (`User`, `Action::"view"`, `Photo`).
pub(crate) fn test_schema() -> ValidatorSchema {
    ValidatorSchema::from_json_value(serde_json::json!(
        {
            "entityTypes": {
                "User": {
                    "memberOfTypes": ["Group"],
                    "shape": {
                        "type": "Record",
                        "attributes": {
                            "age": { "type": "Long" },
                            "email": { "type": "String" },
                            "manager": { "type": "Entity", "name": "User", "required": false },
                            "suffix": { "type": "String", "required": false },
                            "nested": {
                                "type": "Record",
                                "attributes": {
                                    "user": { "type": "Entity", "name": "User" }
                                }
                            }
                        }
                    },
                    "tags": { "type": "String" }
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
                            "attributes": {
                                "mfa": { "type": "Boolean" },
                                "requester": { "type": "Entity", "name": "User", "required": false }
                            }
                        }
                    }
                }
            }
        }
    ))
    .expect("test schema is valid")
}
