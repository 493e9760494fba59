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

//! Options of the custom metrics API server.
//!
//! [`ServerOptions`] bundles one option component per server concern and
//! applies them onto a [`ServerConfig`] in dependency order:
//!
//! 1. default a self-signed serving certificate,
//! 2. secure serving (and the loopback client),
//! 3. authentication, which needs the serving result,
//! 4. authorization,
//! 5. audit,
//! 6. the external client and its shared informer factory,
//! 7. features, which need the client and the informers,
//! 8. OpenAPI documents,
//! 9. metrics.
//!
//! The first failing step aborts application. Steps that already ran are
//! not undone.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use clap::{ArgMatches, Command};
use serde::Deserialize;
use thiserror::Error;

use crate::audit::{AuditError, AuditOptions};
use crate::authentication::{AuthenticationError, DelegatingAuthenticationOptions};
use crate::authorization::{AuthorizationError, DelegatingAuthorizationOptions};
use crate::cert::CertError;
use crate::client::{ClientError, ClientFactory, KubeClientFactory, DEFAULT_RESYNC_PERIOD};
use crate::component::{ComponentOptions, OptionsError};
use crate::feature::{FeatureError, FeatureOptions};
use crate::openapi::{attach_openapi, attach_openapi_v3, OpenApiConfig, OpenApiV3Config};
use crate::server_config::ServerConfig;
use crate::serving::{SecureServingOptions, ServingError};

/// A step of [`ServerOptions::apply_to`] that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    SelfSignedCert,
    SecureServing,
    Authentication,
    Authorization,
    Audit,
    ClientConstruction,
    Features,
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplyStep::SelfSignedCert => "self-signed-cert",
            ApplyStep::SecureServing => "secure-serving",
            ApplyStep::Authentication => "authentication",
            ApplyStep::Authorization => "authorization",
            ApplyStep::Audit => "audit",
            ApplyStep::ClientConstruction => "client-construction",
            ApplyStep::Features => "features",
        };
        f.write_str(name)
    }
}

/// Error returned by [`ServerOptions::apply_to`].
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("error creating self-signed certificates: {0}")]
    SelfSignedCert(#[source] CertError),

    #[error("failed to apply secure serving options: {0}")]
    SecureServing(#[source] ServingError),

    #[error("failed to apply authentication options: {0}")]
    Authentication(#[source] AuthenticationError),

    #[error("failed to apply authorization options: {0}")]
    Authorization(#[source] AuthorizationError),

    #[error("failed to apply audit options: {0}")]
    Audit(#[source] AuditError),

    #[error("failed to create real external clientset: {0}")]
    ClientConstruction(#[source] ClientError),

    #[error("failed to apply feature options: {0}")]
    Features(#[source] FeatureError),
}

impl ApplyError {
    /// Returns the step that failed.
    pub fn step(&self) -> ApplyStep {
        match self {
            ApplyError::SelfSignedCert(_) => ApplyStep::SelfSignedCert,
            ApplyError::SecureServing(_) => ApplyStep::SecureServing,
            ApplyError::Authentication(_) => ApplyStep::Authentication,
            ApplyError::Authorization(_) => ApplyStep::Authorization,
            ApplyError::Audit(_) => ApplyStep::Audit,
            ApplyError::ClientConstruction(_) => ApplyStep::ClientConstruction,
            ApplyError::Features(_) => ApplyStep::Features,
        }
    }

    /// Returns true when the failure came from building a derived resource
    /// rather than from one of the option components.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ApplyError::ClientConstruction(_))
    }
}

/// Options of the custom metrics API server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    pub secure_serving: SecureServingOptions,
    pub authentication: DelegatingAuthenticationOptions,
    pub authorization: DelegatingAuthorizationOptions,
    pub audit: AuditOptions,
    pub features: FeatureOptions,

    /// OpenAPI v2 document to publish, if any.
    pub openapi_config: Option<Arc<OpenApiConfig>>,
    /// OpenAPI v3 document to publish, if any.
    pub openapi_v3_config: Option<Arc<OpenApiV3Config>>,
    pub enable_metrics: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerOptions {
    /// Creates options with every component at its default.
    pub fn new() -> Self {
        Self {
            secure_serving: SecureServingOptions::new().with_loopback(),
            authentication: DelegatingAuthenticationOptions::new(),
            authorization: DelegatingAuthorizationOptions::new(),
            audit: AuditOptions::new(),
            features: FeatureOptions::new(),
            openapi_config: None,
            openapi_v3_config: None,
            enable_metrics: true,
        }
    }

    /// Validates every component and returns all errors found.
    pub fn validate(&self) -> Vec<OptionsError> {
        let mut errors = Vec::new();
        errors.extend(self.secure_serving.validate());
        errors.extend(self.authentication.validate());
        errors.extend(self.authorization.validate());
        errors.extend(self.audit.validate());
        errors.extend(self.features.validate());
        errors
    }

    /// Registers the flags of every component on `cmd`.
    pub fn add_flags(cmd: Command) -> Command {
        let cmd = SecureServingOptions::add_flags(cmd);
        let cmd = DelegatingAuthenticationOptions::add_flags(cmd);
        let cmd = DelegatingAuthorizationOptions::add_flags(cmd);
        let cmd = AuditOptions::add_flags(cmd);
        FeatureOptions::add_flags(cmd)
    }

    /// Copies flag values parsed by a command built with
    /// [`ServerOptions::add_flags`].
    pub fn apply_flags(&mut self, matches: &ArgMatches) -> Result<(), clap::Error> {
        self.secure_serving.apply_flags(matches)?;
        self.authentication.apply_flags(matches)?;
        self.authorization.apply_flags(matches)?;
        self.audit.apply_flags(matches)?;
        self.features.apply_flags(matches)?;
        Ok(())
    }

    /// Applies the options onto `config`, building the external client from
    /// `client_config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn apply_to(
        &mut self,
        config: &mut ServerConfig,
        client_config: &kube::Config,
    ) -> Result<(), ApplyError> {
        self.apply_to_with(config, client_config, &KubeClientFactory)
    }

    /// Like [`ServerOptions::apply_to`], with an explicit client factory.
    pub fn apply_to_with(
        &mut self,
        config: &mut ServerConfig,
        client_config: &kube::Config,
        clients: &dyn ClientFactory,
    ) -> Result<(), ApplyError> {
        // TODO: generate for a real external address once an advertise
        // address option exists.
        run_step(
            ApplyStep::SelfSignedCert,
            || {
                self.secure_serving.maybe_default_with_self_signed_certs(
                    "localhost",
                    &[],
                    &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
                )
            },
            ApplyError::SelfSignedCert,
        )?;

        run_step(
            ApplyStep::SecureServing,
            || {
                self.secure_serving
                    .apply_to(&mut config.secure_serving, &mut config.loopback_client_config)
            },
            ApplyError::SecureServing,
        )?;

        run_step(
            ApplyStep::Authentication,
            || {
                self.authentication.apply_to(
                    &mut config.authentication,
                    config.secure_serving.as_mut(),
                    None,
                )
            },
            ApplyError::Authentication,
        )?;

        run_step(
            ApplyStep::Authorization,
            || self.authorization.apply_to(&mut config.authorization),
            ApplyError::Authorization,
        )?;

        run_step(ApplyStep::Audit, || self.audit.apply_to(config), ApplyError::Audit)?;

        tracing::info!(cluster_url = %client_config.cluster_url, "creating external client");
        let client = run_step(
            ApplyStep::ClientConstruction,
            || clients.new_client(client_config),
            ApplyError::ClientConstruction,
        )?;
        let informers =
            Arc::new(clients.new_informer_factory(client.clone(), DEFAULT_RESYNC_PERIOD));

        run_step(
            ApplyStep::Features,
            || self.features.apply_to(config, &client, &informers),
            ApplyError::Features,
        )?;

        attach_openapi(config, self.openapi_config.as_ref());
        attach_openapi_v3(config, self.openapi_v3_config.as_ref());

        config.enable_metrics = self.enable_metrics;
        Ok(())
    }
}

fn run_step<T, E>(
    step: ApplyStep,
    apply: impl FnOnce() -> Result<T, E>,
    wrap: impl FnOnce(E) -> ApplyError,
) -> Result<T, ApplyError> {
    let _span = tracing::info_span!("apply", step = %step).entered();
    match apply() {
        Ok(value) => {
            tracing::debug!("applied");
            Ok(value)
        }
        Err(e) => {
            let err = wrap(e);
            tracing::error!(error = %err, "apply failed");
            Err(err)
        }
    }
}

/// Adapter settings read from a YAML file.
///
/// These have no flags: the OpenAPI documents are structured data and the
/// metrics switch is a deployment decision.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionsFile {
    pub openapi: Option<OpenApiConfig>,
    #[serde(rename = "openapiV3")]
    pub openapi_v3: Option<OpenApiV3Config>,
    pub enable_metrics: Option<bool>,
}

impl OptionsFile {
    /// Parses an options file.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Copies the settings present in the file onto `options`.
    pub fn apply(self, options: &mut ServerOptions) {
        if let Some(openapi) = self.openapi {
            options.openapi_config = Some(Arc::new(openapi));
        }
        if let Some(openapi_v3) = self.openapi_v3 {
            options.openapi_v3_config = Some(Arc::new(openapi_v3));
        }
        if let Some(enable_metrics) = self.enable_metrics {
            options.enable_metrics = enable_metrics;
        }
    }
}
