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

//! Delegating authentication options.
//!
//! Inbound requests are authenticated by client certificate, by trusted
//! front-proxy request headers, or by forwarding bearer tokens to a remote
//! TokenReview endpoint.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::cert::{self, CaBundle, CertError};
use crate::component::{
    check_blank_entries, parse_duration, ComponentOptions, OptionsError, WebhookRetryBackoff,
};
use crate::kubeconfig::{DelegationTarget, RemoteKubeconfigError};
use crate::serving::SecureServingInfo;

const COMPONENT: &str = "authentication";

/// Returns the audiences tokens must be issued for.
pub type AudienceGetter<'a> = &'a dyn Fn() -> Vec<String>;

/// Errors produced while applying authentication options.
#[derive(Error, Debug)]
pub enum AuthenticationError {
    #[error("unable to load client CA file: {0}")]
    ClientCa(#[source] CertError),

    #[error("unable to load request-header client CA file: {0}")]
    RequestHeaderCa(#[source] CertError),

    #[error("failed to get delegated authentication kubeconfig: {0}")]
    Kubeconfig(#[source] RemoteKubeconfigError),
}

/// Client certificate authentication options.
#[derive(Debug, Clone, Default, PartialEq, Args)]
pub struct ClientCertAuthenticationOptions {
    /// If set, any request presenting a client certificate signed by one of
    /// the authorities in the client-ca-file is authenticated with an identity
    /// corresponding to the CommonName of the client certificate.
    #[arg(id = "client-ca-file", long = "client-ca-file")]
    pub client_ca_file: Option<PathBuf>,
}

/// Front-proxy request header authentication options.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct RequestHeaderAuthenticationOptions {
    /// Root certificate bundle to use to verify client certificates on
    /// incoming requests before trusting usernames in headers.
    #[arg(id = "requestheader-client-ca-file", long = "requestheader-client-ca-file")]
    pub client_ca_file: Option<PathBuf>,

    /// List of request headers to inspect for usernames.
    #[arg(
        long = "requestheader-username-headers",
        value_delimiter = ',',
        default_values_t = [String::from("x-remote-user")]
    )]
    pub username_headers: Vec<String>,

    /// List of request headers to inspect for UIDs.
    #[arg(long = "requestheader-uid-headers", value_delimiter = ',')]
    pub uid_headers: Vec<String>,

    /// List of request headers to inspect for groups.
    #[arg(
        long = "requestheader-group-headers",
        value_delimiter = ',',
        default_values_t = [String::from("x-remote-group")]
    )]
    pub group_headers: Vec<String>,

    /// List of request header prefixes to inspect.
    #[arg(
        long = "requestheader-extra-headers-prefix",
        value_delimiter = ',',
        default_values_t = [String::from("x-remote-extra-")]
    )]
    pub extra_header_prefixes: Vec<String>,

    /// List of client certificate common names to allow to provide usernames
    /// in headers. If empty, any client certificate validated by the
    /// authorities in --requestheader-client-ca-file is allowed.
    #[arg(long = "requestheader-allowed-names", value_delimiter = ',')]
    pub allowed_names: Vec<String>,
}

impl Default for RequestHeaderAuthenticationOptions {
    fn default() -> Self {
        Self {
            client_ca_file: None,
            username_headers: vec!["x-remote-user".to_string()],
            uid_headers: Vec::new(),
            group_headers: vec!["x-remote-group".to_string()],
            extra_header_prefixes: vec!["x-remote-extra-".to_string()],
            allowed_names: Vec::new(),
        }
    }
}

impl RequestHeaderAuthenticationOptions {
    fn validate(&self) -> Vec<OptionsError> {
        let mut errors = Vec::new();
        let lists: [(&'static str, &Vec<String>); 4] = [
            ("requestheader-username-headers", &self.username_headers),
            ("requestheader-uid-headers", &self.uid_headers),
            ("requestheader-group-headers", &self.group_headers),
            ("requestheader-extra-headers-prefix", &self.extra_header_prefixes),
        ];
        for (flag, values) in lists {
            errors.extend(check_blank_entries(COMPONENT, flag, values));
        }
        errors.extend(check_blank_entries(
            COMPONENT,
            "requestheader-allowed-names",
            &self.allowed_names,
        ));

        if !self.username_headers.is_empty()
            && !self
                .username_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case("x-remote-user"))
        {
            tracing::warn!(
                headers = ?self.username_headers,
                "--requestheader-username-headers is set without X-Remote-User; \
                 front proxies sending it will not be recognized"
            );
        }
        errors
    }
}

/// Delegating authentication options.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct DelegatingAuthenticationOptions {
    /// Kubeconfig file pointing at the 'core' kubernetes server with enough
    /// rights to create tokenreviews.authentication.k8s.io.
    #[arg(id = "authentication-kubeconfig", long = "authentication-kubeconfig")]
    pub remote_kubeconfig_file: Option<PathBuf>,

    /// The duration to cache responses from the webhook token authenticator.
    #[arg(
        long = "authentication-token-webhook-cache-ttl",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub cache_ttl: Duration,

    /// If false, the authentication-kubeconfig will be used to lookup missing
    /// authentication configuration from the cluster.
    #[arg(long = "authentication-skip-lookup")]
    pub skip_in_cluster_lookup: bool,

    /// If true, failures to look up missing authentication configuration from
    /// the cluster are not considered fatal.
    #[arg(long = "authentication-tolerate-lookup-failure")]
    pub tolerate_in_cluster_lookup_failure: bool,

    #[command(flatten)]
    pub client_cert: ClientCertAuthenticationOptions,

    #[command(flatten)]
    pub request_header: RequestHeaderAuthenticationOptions,

    /// Timeout for TokenReview requests.
    #[arg(skip = Duration::from_secs(10))]
    pub token_request_timeout: Duration,

    /// Retry policy for TokenReview requests.
    #[arg(skip)]
    pub webhook_retry_backoff: WebhookRetryBackoff,

    /// Whether requests without credentials are rejected.
    #[arg(skip)]
    pub disable_anonymous: bool,
}

impl Default for DelegatingAuthenticationOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DelegatingAuthenticationOptions {
    /// Creates authentication options with their defaults.
    pub fn new() -> Self {
        Self {
            remote_kubeconfig_file: None,
            cache_ttl: Duration::from_secs(10),
            skip_in_cluster_lookup: false,
            tolerate_in_cluster_lookup_failure: false,
            client_cert: ClientCertAuthenticationOptions::default(),
            request_header: RequestHeaderAuthenticationOptions::default(),
            token_request_timeout: Duration::from_secs(10),
            webhook_retry_backoff: WebhookRetryBackoff::default(),
            disable_anonymous: false,
        }
    }

    /// Applies the options onto `info`.
    ///
    /// The client CA, when configured, is attached to `serving` so that the
    /// listener requests and verifies client certificates. `audiences`
    /// restricts accepted token audiences; `None` leaves them unrestricted.
    pub fn apply_to(
        &self,
        info: &mut AuthenticationInfo,
        serving: Option<&mut SecureServingInfo>,
        audiences: Option<AudienceGetter<'_>>,
    ) -> Result<(), AuthenticationError> {
        let mut methods = Vec::new();

        let client_ca = match &self.client_cert.client_ca_file {
            Some(path) => Some(cert::load_ca_bundle(path).map_err(AuthenticationError::ClientCa)?),
            None => None,
        };
        if let Some(ca) = &client_ca {
            methods.push(AuthenticationMethod::X509ClientCert);
            match serving {
                Some(serving) => serving.client_ca = Some(ca.clone()),
                None => tracing::warn!("client CA configured but secure serving is disabled"),
            }
        }

        let request_header = match &self.request_header.client_ca_file {
            Some(path) => {
                let ca = cert::load_ca_bundle(path).map_err(AuthenticationError::RequestHeaderCa)?;
                methods.push(AuthenticationMethod::RequestHeader);
                Some(RequestHeaderConfig {
                    username_headers: self.request_header.username_headers.clone(),
                    uid_headers: self.request_header.uid_headers.clone(),
                    group_headers: self.request_header.group_headers.clone(),
                    extra_header_prefixes: self.request_header.extra_header_prefixes.clone(),
                    allowed_names: self.request_header.allowed_names.clone(),
                    client_ca: ca,
                })
            }
            None => None,
        };

        let token_review = DelegationTarget::resolve(self.remote_kubeconfig_file.as_deref())
            .map_err(AuthenticationError::Kubeconfig)?;
        match &token_review {
            Some(_) => methods.push(AuthenticationMethod::TokenReview),
            None => tracing::warn!(
                "no authentication-kubeconfig provided and not running in a cluster; \
                 token authentication won't work"
            ),
        }

        let in_cluster_lookup = if self.skip_in_cluster_lookup || token_review.is_none() {
            None
        } else {
            Some(InClusterLookup {
                tolerate_failure: self.tolerate_in_cluster_lookup_failure,
                fill_client_ca: client_ca.is_none(),
                fill_request_header: request_header.is_none(),
            })
        };

        if !self.disable_anonymous {
            methods.push(AuthenticationMethod::Anonymous);
        }

        if let Some(getter) = audiences {
            info.api_audiences = getter();
        }

        info.request_header = request_header;
        info.authenticator = Some(AuthenticatorConfig {
            methods,
            client_ca,
            token_review,
            in_cluster_lookup,
            cache_ttl: self.cache_ttl,
            token_request_timeout: self.token_request_timeout,
            webhook_retry_backoff: self.webhook_retry_backoff.clone(),
        });
        Ok(())
    }
}

impl ComponentOptions for DelegatingAuthenticationOptions {
    fn validate(&self) -> Vec<OptionsError> {
        let mut errors = self.webhook_retry_backoff.validate(COMPONENT);
        if self.token_request_timeout.is_zero() {
            errors.push(OptionsError::Invalid {
                component: COMPONENT,
                reason: "token request timeout must be greater than 0".to_string(),
            });
        }
        errors.extend(self.request_header.validate());
        errors
    }
}

/// An authentication method enabled on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// Client certificates signed by the client CA.
    X509ClientCert,
    /// Identity headers set by a trusted front proxy.
    RequestHeader,
    /// Bearer tokens checked with a remote TokenReview.
    TokenReview,
    /// Requests without credentials.
    Anonymous,
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthenticationMethod::X509ClientCert => "x509",
            AuthenticationMethod::RequestHeader => "request-header",
            AuthenticationMethod::TokenReview => "token-review",
            AuthenticationMethod::Anonymous => "anonymous",
        };
        f.write_str(name)
    }
}

/// Deferred lookup of the `extension-apiserver-authentication` ConfigMap.
///
/// The server runtime performs the lookup once it can reach the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InClusterLookup {
    /// Whether a failed lookup is logged instead of aborting startup.
    pub tolerate_failure: bool,
    /// Whether the client CA should be taken from the ConfigMap.
    pub fill_client_ca: bool,
    /// Whether request-header settings should be taken from the ConfigMap.
    pub fill_request_header: bool,
}

/// Resolved front-proxy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaderConfig {
    pub username_headers: Vec<String>,
    pub uid_headers: Vec<String>,
    pub group_headers: Vec<String>,
    pub extra_header_prefixes: Vec<String>,
    pub allowed_names: Vec<String>,
    /// CA that must have signed the front proxy's client certificate.
    pub client_ca: CaBundle,
}

/// Resolved authenticator chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorConfig {
    /// Enabled methods, in evaluation order.
    pub methods: Vec<AuthenticationMethod>,
    pub client_ca: Option<CaBundle>,
    /// Remote TokenReview endpoint.
    pub token_review: Option<DelegationTarget>,
    pub in_cluster_lookup: Option<InClusterLookup>,
    pub cache_ttl: Duration,
    pub token_request_timeout: Duration,
    pub webhook_retry_backoff: WebhookRetryBackoff,
}

/// The authentication slot of the server configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthenticationInfo {
    /// Resolved authenticator; `None` until authentication is applied.
    pub authenticator: Option<AuthenticatorConfig>,
    pub request_header: Option<RequestHeaderConfig>,
    /// Accepted token audiences; empty means unrestricted.
    pub api_audiences: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeconfig::tests::write_kubeconfig;
    use std::path::Path;

    fn write_ca(dir: &Path, name: &str) -> PathBuf {
        let pair = cert::generate_self_signed(name, &[], &[]).unwrap();
        let path = dir.join(format!("{}.crt", name));
        std::fs::write(&path, pair.cert_pem).unwrap();
        path
    }

    fn serving_info() -> SecureServingInfo {
        SecureServingInfo {
            listen_addr: "127.0.0.1:6443".parse().unwrap(),
            cert: cert::generate_self_signed("localhost", &[], &[]).unwrap(),
            sni_certs: Vec::new(),
            client_ca: None,
            cipher_suites: Vec::new(),
            min_tls_version: None,
            http2_max_streams_per_connection: 0,
            permit_port_sharing: false,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(DelegatingAuthenticationOptions::new().validate().is_empty());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut options = DelegatingAuthenticationOptions::new();
        options.webhook_retry_backoff.steps = 0;
        options.token_request_timeout = Duration::ZERO;
        options.request_header.group_headers = vec![" ".to_string()];
        assert_eq!(options.validate().len(), 3);
    }

    #[test]
    fn test_apply_with_client_ca_attaches_to_serving() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DelegatingAuthenticationOptions::new();
        options.skip_in_cluster_lookup = true;
        options.client_cert.client_ca_file = Some(write_ca(dir.path(), "client-ca"));

        let mut info = AuthenticationInfo::default();
        let mut serving = serving_info();
        options.apply_to(&mut info, Some(&mut serving), None).unwrap();

        assert!(serving.client_ca.is_some());
        let authenticator = info.authenticator.unwrap();
        assert_eq!(authenticator.methods[0], AuthenticationMethod::X509ClientCert);
        assert_eq!(authenticator.methods.last(), Some(&AuthenticationMethod::Anonymous));
        assert!(info.api_audiences.is_empty());
    }

    #[test]
    fn test_apply_with_request_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DelegatingAuthenticationOptions::new();
        options.request_header.client_ca_file = Some(write_ca(dir.path(), "front-proxy-ca"));
        options.request_header.allowed_names = vec!["front-proxy-client".to_string()];

        let mut info = AuthenticationInfo::default();
        options.apply_to(&mut info, None, None).unwrap();

        let request_header = info.request_header.unwrap();
        assert_eq!(request_header.allowed_names, vec!["front-proxy-client".to_string()]);
        assert_eq!(request_header.username_headers, vec!["x-remote-user".to_string()]);
        assert!(info
            .authenticator
            .unwrap()
            .methods
            .contains(&AuthenticationMethod::RequestHeader));
    }

    #[test]
    fn test_apply_with_remote_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DelegatingAuthenticationOptions::new();
        options.remote_kubeconfig_file = Some(write_kubeconfig(dir.path()));
        options.tolerate_in_cluster_lookup_failure = true;

        let mut info = AuthenticationInfo::default();
        options.apply_to(&mut info, None, None).unwrap();

        let authenticator = info.authenticator.unwrap();
        assert!(matches!(authenticator.token_review, Some(DelegationTarget::Kubeconfig(_))));
        assert!(authenticator.methods.contains(&AuthenticationMethod::TokenReview));
        let lookup = authenticator.in_cluster_lookup.unwrap();
        assert!(lookup.tolerate_failure);
        assert!(lookup.fill_client_ca);
    }

    #[test]
    fn test_apply_with_audiences() {
        let mut options = DelegatingAuthenticationOptions::new();
        options.skip_in_cluster_lookup = true;
        let audiences = || vec!["metrics".to_string()];

        let mut info = AuthenticationInfo::default();
        options.apply_to(&mut info, None, Some(&audiences)).unwrap();
        assert_eq!(info.api_audiences, vec!["metrics".to_string()]);
    }

    #[test]
    fn test_apply_missing_client_ca() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DelegatingAuthenticationOptions::new();
        options.client_cert.client_ca_file = Some(dir.path().join("missing.crt"));

        let mut info = AuthenticationInfo::default();
        let mut serving = serving_info();
        let err = options.apply_to(&mut info, Some(&mut serving), None).unwrap_err();
        assert!(matches!(err, AuthenticationError::ClientCa(_)));
        assert!(info.authenticator.is_none());
        assert!(serving.client_ca.is_none());
    }
}
