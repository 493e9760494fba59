// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! OpenAPI document descriptors published by the server.
//!
//! The descriptors are opaque to option application: they are attached to
//! the server configuration as-is and never inspected.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::server_config::ServerConfig;

/// The `info` section of an OpenAPI document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiInfo {
    pub title: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// OpenAPI v2 document configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiConfig {
    pub info: OpenApiInfo,
    /// Path prefixes left out of the document.
    #[serde(default)]
    pub ignore_prefixes: Vec<String>,
    #[serde(default)]
    pub security_definitions: BTreeMap<String, serde_json::Value>,
    /// Schema definitions keyed by their fully qualified name.
    #[serde(default)]
    pub definitions: BTreeMap<String, serde_json::Value>,
}

impl OpenApiConfig {
    /// Creates a document configuration with the given title and version.
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: OpenApiInfo {
                title: title.into(),
                version: version.into(),
                description: None,
            },
            ..Default::default()
        }
    }
}

/// OpenAPI v3 document configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiV3Config {
    pub info: OpenApiInfo,
    #[serde(default)]
    pub security_schemes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub schemas: BTreeMap<String, serde_json::Value>,
}

impl OpenApiV3Config {
    /// Creates a document configuration with the given title and version.
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: OpenApiInfo {
                title: title.into(),
                version: version.into(),
                description: None,
            },
            ..Default::default()
        }
    }
}

/// Publishes the v2 document on `config` when one is given.
pub fn attach_openapi(config: &mut ServerConfig, openapi: Option<&Arc<OpenApiConfig>>) {
    if let Some(openapi) = openapi {
        config.openapi_config = Some(Arc::clone(openapi));
    }
}

/// Publishes the v3 document on `config` when one is given.
pub fn attach_openapi_v3(config: &mut ServerConfig, openapi: Option<&Arc<OpenApiV3Config>>) {
    if let Some(openapi) = openapi {
        config.openapi_v3_config = Some(Arc::clone(openapi));
    }
}
