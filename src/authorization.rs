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

//! Delegating authorization options.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::component::{parse_duration, ComponentOptions, OptionsError, WebhookRetryBackoff};
use crate::kubeconfig::{DelegationTarget, RemoteKubeconfigError};

const COMPONENT: &str = "authorization";

/// Errors produced while applying authorization options.
#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("failed to get delegated authorization kubeconfig: {0}")]
    Kubeconfig(#[source] RemoteKubeconfigError),
}

/// Delegating authorization options.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct DelegatingAuthorizationOptions {
    /// Kubeconfig file pointing at the 'core' kubernetes server with enough
    /// rights to create subjectaccessreviews.authorization.k8s.io.
    #[arg(id = "authorization-kubeconfig", long = "authorization-kubeconfig")]
    pub remote_kubeconfig_file: Option<PathBuf>,

    /// The duration to cache 'authorized' responses from the webhook authorizer.
    #[arg(
        long = "authorization-webhook-cache-authorized-ttl",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub allow_cache_ttl: Duration,

    /// The duration to cache 'unauthorized' responses from the webhook authorizer.
    #[arg(
        long = "authorization-webhook-cache-unauthorized-ttl",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub deny_cache_ttl: Duration,

    /// A list of HTTP paths to skip during authorization, i.e. these are
    /// authorized without contacting the 'core' kubernetes server.
    #[arg(
        long = "authorization-always-allow-paths",
        value_delimiter = ',',
        default_values_t = default_always_allow_paths()
    )]
    pub always_allow_paths: Vec<String>,

    /// Groups that are authorized without contacting the remote authority.
    #[arg(skip = vec!["system:masters".to_string()])]
    pub always_allow_groups: Vec<String>,

    /// Timeout for SubjectAccessReview requests.
    #[arg(skip = Duration::from_secs(10))]
    pub client_timeout: Duration,

    /// Retry policy for SubjectAccessReview requests.
    #[arg(skip)]
    pub webhook_retry_backoff: WebhookRetryBackoff,
}

fn default_always_allow_paths() -> Vec<String> {
    ["/healthz", "/readyz", "/livez"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for DelegatingAuthorizationOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DelegatingAuthorizationOptions {
    /// Creates authorization options with their defaults.
    pub fn new() -> Self {
        Self {
            remote_kubeconfig_file: None,
            allow_cache_ttl: Duration::from_secs(10),
            deny_cache_ttl: Duration::from_secs(10),
            always_allow_paths: default_always_allow_paths(),
            always_allow_groups: vec!["system:masters".to_string()],
            client_timeout: Duration::from_secs(10),
            webhook_retry_backoff: WebhookRetryBackoff::default(),
        }
    }

    /// Applies the options onto `info`.
    pub fn apply_to(&self, info: &mut AuthorizationInfo) -> Result<(), AuthorizationError> {
        let target = DelegationTarget::resolve(self.remote_kubeconfig_file.as_deref())
            .map_err(AuthorizationError::Kubeconfig)?;

        let subject_access_review = match target {
            Some(target) => Some(SubjectAccessReviewConfig {
                target,
                allow_cache_ttl: self.allow_cache_ttl,
                deny_cache_ttl: self.deny_cache_ttl,
                timeout: self.client_timeout,
                retry_backoff: self.webhook_retry_backoff.clone(),
            }),
            None => {
                tracing::warn!(
                    "no authorization-kubeconfig provided, so SubjectAccessReview of \
                     authorization tokens won't work"
                );
                None
            }
        };

        info.authorizer = Some(AuthorizerConfig {
            always_allow_paths: self.always_allow_paths.clone(),
            always_allow_groups: self.always_allow_groups.clone(),
            subject_access_review,
        });
        Ok(())
    }
}

impl ComponentOptions for DelegatingAuthorizationOptions {
    fn validate(&self) -> Vec<OptionsError> {
        let mut errors = self.webhook_retry_backoff.validate(COMPONENT);
        for path in &self.always_allow_paths {
            if let Some(reason) = invalid_path_reason(path) {
                errors.push(OptionsError::invalid_flag(
                    COMPONENT,
                    "authorization-always-allow-paths",
                    format!("entry {:?} {}", path, reason),
                ));
            }
        }
        errors
    }
}

fn invalid_path_reason(path: &str) -> Option<&'static str> {
    if !path.starts_with('/') {
        return Some("must start with '/'");
    }
    match path.find('*') {
        Some(index) if index != path.len() - 1 => {
            Some("may only contain '*' as the final character")
        }
        _ => None,
    }
}

/// Delegated SubjectAccessReview settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectAccessReviewConfig {
    pub target: DelegationTarget,
    pub allow_cache_ttl: Duration,
    pub deny_cache_ttl: Duration,
    pub timeout: Duration,
    pub retry_backoff: WebhookRetryBackoff,
}

/// Resolved authorizer chain: always-allow rules first, then the remote
/// authority.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizerConfig {
    pub always_allow_paths: Vec<String>,
    pub always_allow_groups: Vec<String>,
    pub subject_access_review: Option<SubjectAccessReviewConfig>,
}

/// The authorization slot of the server configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationInfo {
    /// Resolved authorizer; `None` until authorization is applied.
    pub authorizer: Option<AuthorizerConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeconfig::tests::write_kubeconfig;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DelegatingAuthorizationOptions::new().validate().is_empty());
    }

    #[test]
    fn test_validate_paths() {
        let mut options = DelegatingAuthorizationOptions::new();
        options.always_allow_paths = vec![
            "/healthz".to_string(),
            "/metrics/*".to_string(),
            "readyz".to_string(),
            "/api/*/status".to_string(),
        ];
        assert_eq!(options.validate().len(), 2);
    }

    #[test]
    fn test_validate_backoff() {
        let mut options = DelegatingAuthorizationOptions::new();
        options.webhook_retry_backoff.steps = 0;
        assert_eq!(options.validate().len(), 1);
    }

    #[test]
    fn test_apply_with_remote_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DelegatingAuthorizationOptions::new();
        options.remote_kubeconfig_file = Some(write_kubeconfig(dir.path()));
        options.deny_cache_ttl = Duration::from_secs(3);

        let mut info = AuthorizationInfo::default();
        options.apply_to(&mut info).unwrap();

        let authorizer = info.authorizer.unwrap();
        assert_eq!(authorizer.always_allow_paths, default_always_allow_paths());
        assert_eq!(authorizer.always_allow_groups, vec!["system:masters".to_string()]);
        let sar = authorizer.subject_access_review.unwrap();
        assert_eq!(sar.deny_cache_ttl, Duration::from_secs(3));
        assert!(matches!(sar.target, DelegationTarget::Kubeconfig(_)));
    }

    #[test]
    fn test_apply_missing_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = DelegatingAuthorizationOptions::new();
        options.remote_kubeconfig_file = Some(dir.path().join("missing"));

        let mut info = AuthorizationInfo::default();
        assert!(options.apply_to(&mut info).is_err());
        assert!(info.authorizer.is_none());
    }
}
