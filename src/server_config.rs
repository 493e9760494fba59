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

//! Runtime configuration of the API server.
//!
//! This is the record option application writes into. It is owned by the
//! caller and handed to the server engine afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::audit::AuditConfig;
use crate::authentication::AuthenticationInfo;
use crate::authorization::AuthorizationInfo;
use crate::feature::{FlowControlConfig, MemoryFeatureGate};
use crate::informer::SharedInformerFactory;
use crate::openapi::{OpenApiConfig, OpenApiV3Config};
use crate::serving::{LoopbackClientConfig, SecureServingInfo, TlsVersion};

/// Default limit of non-mutating requests in flight.
pub const DEFAULT_MAX_REQUESTS_IN_FLIGHT: u32 = 400;

/// Default limit of mutating requests in flight.
pub const DEFAULT_MAX_MUTATING_REQUESTS_IN_FLIGHT: u32 = 200;

/// Runtime configuration of the API server.
#[derive(Debug)]
pub struct ServerConfig {
    pub secure_serving: Option<SecureServingInfo>,
    pub loopback_client_config: Option<LoopbackClientConfig>,
    pub authentication: AuthenticationInfo,
    pub authorization: AuthorizationInfo,
    pub audit: Option<AuditConfig>,

    pub feature_gate: Arc<MemoryFeatureGate>,
    pub enable_profiling: bool,
    pub enable_contention_profiling: bool,
    pub debug_socket_path: Option<PathBuf>,

    pub max_requests_in_flight: u32,
    pub max_mutating_requests_in_flight: u32,
    /// Set when priority and fairness is enabled.
    pub flow_control: Option<FlowControlConfig>,
    /// Informers for the server runtime to start.
    pub shared_informer_factory: Option<Arc<SharedInformerFactory>>,

    pub openapi_config: Option<Arc<OpenApiConfig>>,
    pub openapi_v3_config: Option<Arc<OpenApiV3Config>>,
    pub enable_metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            secure_serving: None,
            loopback_client_config: None,
            authentication: AuthenticationInfo::default(),
            authorization: AuthorizationInfo::default(),
            audit: None,
            feature_gate: Arc::new(MemoryFeatureGate::apiserver()),
            enable_profiling: true,
            enable_contention_profiling: false,
            debug_socket_path: None,
            max_requests_in_flight: DEFAULT_MAX_REQUESTS_IN_FLIGHT,
            max_mutating_requests_in_flight: DEFAULT_MAX_MUTATING_REQUESTS_IN_FLIGHT,
            flow_control: None,
            shared_informer_factory: None,
            openapi_config: None,
            openapi_v3_config: None,
            enable_metrics: false,
        }
    }
}

impl ServerConfig {
    /// Returns a printable summary of the resolved configuration.
    ///
    /// Keys, tokens and certificate bodies are left out.
    pub fn summary(&self) -> ServerConfigSummary {
        let secure_serving = self.secure_serving.as_ref().map(|info| ServingSummary {
            listen_addr: info.listen_addr.to_string(),
            sni_names: info
                .sni_certs
                .iter()
                .flat_map(|sni| sni.names.iter().cloned())
                .collect(),
            client_ca_file: info.client_ca.as_ref().map(|ca| ca.path.clone()),
            cipher_suites: info.cipher_suites.clone(),
            min_tls_version: info.min_tls_version,
        });

        let authentication_methods = self
            .authentication
            .authenticator
            .as_ref()
            .map(|a| a.methods.iter().map(ToString::to_string).collect())
            .unwrap_or_default();

        let authorization = self.authorization.authorizer.as_ref().map(|a| AuthorizationSummary {
            always_allow_paths: a.always_allow_paths.clone(),
            always_allow_groups: a.always_allow_groups.clone(),
            delegated: a.subject_access_review.is_some(),
        });

        ServerConfigSummary {
            secure_serving,
            loopback_host: self.loopback_client_config.as_ref().map(|c| c.host.clone()),
            authentication_methods,
            api_audiences: self.authentication.api_audiences.clone(),
            authorization,
            audit_backends: self
                .audit
                .as_ref()
                .map(|a| a.backends.iter().map(ToString::to_string).collect())
                .unwrap_or_default(),
            enable_profiling: self.enable_profiling,
            enable_contention_profiling: self.enable_contention_profiling,
            debug_socket_path: self.debug_socket_path.clone(),
            max_requests_in_flight: self.max_requests_in_flight,
            max_mutating_requests_in_flight: self.max_mutating_requests_in_flight,
            priority_and_fairness: self.flow_control.is_some(),
            feature_gates: self.feature_gate.overrides().into_iter().collect(),
            informers: self
                .shared_informer_factory
                .as_ref()
                .map(|f| f.registered_kinds())
                .unwrap_or_default(),
            openapi: self.openapi_config.as_ref().map(|c| c.info.title.clone()),
            openapi_v3: self.openapi_v3_config.as_ref().map(|c| c.info.title.clone()),
            enable_metrics: self.enable_metrics,
        }
    }
}

/// Serving part of [`ServerConfigSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingSummary {
    pub listen_addr: String,
    pub sni_names: Vec<String>,
    pub client_ca_file: Option<PathBuf>,
    pub cipher_suites: Vec<String>,
    pub min_tls_version: Option<TlsVersion>,
}

/// Authorization part of [`ServerConfigSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSummary {
    pub always_allow_paths: Vec<String>,
    pub always_allow_groups: Vec<String>,
    pub delegated: bool,
}

/// Printable view of a [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigSummary {
    pub secure_serving: Option<ServingSummary>,
    pub loopback_host: Option<String>,
    pub authentication_methods: Vec<String>,
    pub api_audiences: Vec<String>,
    pub authorization: Option<AuthorizationSummary>,
    pub audit_backends: Vec<String>,
    pub enable_profiling: bool,
    pub enable_contention_profiling: bool,
    pub debug_socket_path: Option<PathBuf>,
    pub max_requests_in_flight: u32,
    pub max_mutating_requests_in_flight: u32,
    pub priority_and_fairness: bool,
    pub feature_gates: BTreeMap<String, bool>,
    pub informers: Vec<String>,
    pub openapi: Option<String>,
    pub openapi_v3: Option<String>,
    pub enable_metrics: bool,
}
