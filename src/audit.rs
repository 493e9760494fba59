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

//! Audit options.
//!
//! Audit events are filtered by a policy file and sent to a log file, a
//! webhook, or both.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::{parse_duration, ComponentOptions, OptionsError};
use crate::kubeconfig::{RemoteKubeconfig, RemoteKubeconfigError};
use crate::server_config::ServerConfig;

const COMPONENT: &str = "audit";

const LOG_FORMATS: &[&str] = &["json", "legacy"];
const BACKEND_MODES: &[&str] = &["batch", "blocking", "blocking-strict"];

/// Errors produced while applying audit options.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("failed to read audit policy file {path:?}: {source}")]
    ReadPolicy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse audit policy file {path:?}: {source}")]
    ParsePolicy {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid audit policy {path:?}: {reason}")]
    InvalidPolicy { path: PathBuf, reason: String },

    #[error("failed to open audit log file {path:?}: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load audit webhook kubeconfig: {0}")]
    Webhook(#[source] RemoteKubeconfigError),
}

/// Options for the log file backend.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct AuditLogOptions {
    /// If set, all requests coming to the apiserver will be logged to this
    /// file. '-' means standard out.
    #[arg(id = "audit-log-path", long = "audit-log-path")]
    pub path: Option<String>,

    /// The maximum number of days to retain old audit log files.
    #[arg(id = "audit-log-maxage", long = "audit-log-maxage", default_value_t = 0)]
    pub max_age: u32,

    /// The maximum number of old audit log files to retain.
    #[arg(id = "audit-log-maxbackup", long = "audit-log-maxbackup", default_value_t = 0)]
    pub max_backups: u32,

    /// The maximum size in megabytes of the audit log file before it gets rotated.
    #[arg(id = "audit-log-maxsize", long = "audit-log-maxsize", default_value_t = 0)]
    pub max_size: u32,

    /// Format of saved audits. "legacy" is one line per event, "json" is
    /// structured json.
    #[arg(id = "audit-log-format", long = "audit-log-format", default_value = "json")]
    pub format: String,

    /// Strategy for sending audit events: batch, blocking or blocking-strict.
    #[arg(id = "audit-log-mode", long = "audit-log-mode", default_value = "blocking")]
    pub mode: String,
}

impl Default for AuditLogOptions {
    fn default() -> Self {
        Self {
            path: None,
            max_age: 0,
            max_backups: 0,
            max_size: 0,
            format: "json".to_string(),
            mode: "blocking".to_string(),
        }
    }
}

/// Options for the webhook backend.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct AuditWebhookOptions {
    /// Path to a kubeconfig formatted file that defines the audit webhook
    /// configuration.
    #[arg(id = "audit-webhook-config-file", long = "audit-webhook-config-file")]
    pub config_file: Option<PathBuf>,

    /// The amount of time to wait before retrying the first failed request.
    #[arg(
        id = "audit-webhook-initial-backoff",
        long = "audit-webhook-initial-backoff",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub initial_backoff: Duration,

    /// Strategy for sending audit events: batch, blocking or blocking-strict.
    #[arg(id = "audit-webhook-mode", long = "audit-webhook-mode", default_value = "batch")]
    pub mode: String,

    /// The maximum size of a batch. Only used in batch mode.
    #[arg(
        id = "audit-webhook-batch-max-size",
        long = "audit-webhook-batch-max-size",
        default_value_t = 400
    )]
    pub batch_max_size: u32,
}

impl Default for AuditWebhookOptions {
    fn default() -> Self {
        Self {
            config_file: None,
            initial_backoff: Duration::from_secs(10),
            mode: "batch".to_string(),
            batch_max_size: 400,
        }
    }
}

/// Audit options.
#[derive(Debug, Clone, Default, PartialEq, Args)]
pub struct AuditOptions {
    /// Path to the file that defines the audit policy configuration.
    #[arg(id = "audit-policy-file", long = "audit-policy-file")]
    pub policy_file: Option<PathBuf>,

    #[command(flatten)]
    pub log: AuditLogOptions,

    #[command(flatten)]
    pub webhook: AuditWebhookOptions,
}

impl AuditOptions {
    /// Creates audit options with their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    fn backends_enabled(&self) -> bool {
        self.log.path.is_some() || self.webhook.config_file.is_some()
    }

    /// Applies the options onto `config`.
    ///
    /// Without any backend, or with backends but no policy, auditing stays
    /// off and `config.audit` is left untouched.
    pub fn apply_to(&self, config: &mut ServerConfig) -> Result<(), AuditError> {
        if !self.backends_enabled() {
            return Ok(());
        }
        let Some(policy_file) = &self.policy_file else {
            tracing::warn!("no audit policy file provided, no events will be recorded");
            return Ok(());
        };

        let policy = AuditPolicy::load(policy_file)?;

        let mut backends = Vec::new();
        if let Some(path) = &self.log.path {
            let target = if path == "-" {
                LogTarget::Stdout
            } else {
                let path = PathBuf::from(path);
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|source| AuditError::OpenLog {
                        path: path.clone(),
                        source,
                    })?;
                LogTarget::File(path)
            };
            backends.push(AuditBackend::Log {
                target,
                format: self.log.format.clone(),
                mode: self.log.mode.clone(),
                max_age_days: self.log.max_age,
                max_backups: self.log.max_backups,
                max_size_mb: self.log.max_size,
            });
        }
        if let Some(config_file) = &self.webhook.config_file {
            let kubeconfig = RemoteKubeconfig::load(config_file).map_err(AuditError::Webhook)?;
            backends.push(AuditBackend::Webhook {
                kubeconfig,
                mode: self.webhook.mode.clone(),
                initial_backoff: self.webhook.initial_backoff,
                batch_max_size: self.webhook.batch_max_size,
            });
        }

        tracing::info!(
            rules = policy.rules.len(),
            backends = backends.len(),
            "audit configured"
        );
        config.audit = Some(AuditConfig { policy, backends });
        Ok(())
    }
}

impl ComponentOptions for AuditOptions {
    fn validate(&self) -> Vec<OptionsError> {
        let mut errors = Vec::new();

        if !LOG_FORMATS.contains(&self.log.format.as_str()) {
            errors.push(OptionsError::invalid_flag(
                COMPONENT,
                "audit-log-format",
                format!(
                    "has invalid value {:?}; allowed formats: {}",
                    self.log.format,
                    LOG_FORMATS.join(", ")
                ),
            ));
        }
        for (flag, mode) in [
            ("audit-log-mode", &self.log.mode),
            ("audit-webhook-mode", &self.webhook.mode),
        ] {
            if !BACKEND_MODES.contains(&mode.as_str()) {
                errors.push(OptionsError::invalid_flag(
                    COMPONENT,
                    flag,
                    format!(
                        "has invalid value {:?}; allowed modes: {}",
                        mode,
                        BACKEND_MODES.join(", ")
                    ),
                ));
            }
        }
        if self.webhook.initial_backoff.is_zero() {
            errors.push(OptionsError::invalid_flag(
                COMPONENT,
                "audit-webhook-initial-backoff",
                "must be greater than 0",
            ));
        }
        if self.webhook.mode == "batch" && self.webhook.batch_max_size == 0 {
            errors.push(OptionsError::invalid_flag(
                COMPONENT,
                "audit-webhook-batch-max-size",
                "must be greater than 0 in batch mode",
            ));
        }
        errors
    }
}

/// How much of a request is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    None,
    Metadata,
    Request,
    RequestResponse,
}

/// Request processing stages at which events are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    RequestReceived,
    ResponseStarted,
    ResponseComplete,
    Panic,
}

/// Resources matched by a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResources {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
}

/// One audit policy rule. Empty match lists match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub level: Level,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub user_groups: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub resources: Vec<GroupResources>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default, rename = "nonResourceURLs")]
    pub non_resource_urls: Vec<String>,
    #[serde(default)]
    pub omit_stages: Vec<Stage>,
}

/// An `audit.k8s.io/v1` Policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPolicy {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub omit_stages: Vec<Stage>,
}

impl AuditPolicy {
    /// Loads and checks a policy file.
    pub fn load(path: &Path) -> Result<Self, AuditError> {
        let content = std::fs::read_to_string(path).map_err(|source| AuditError::ReadPolicy {
            path: path.to_path_buf(),
            source,
        })?;
        let policy: AuditPolicy =
            serde_yaml::from_str(&content).map_err(|source| AuditError::ParsePolicy {
                path: path.to_path_buf(),
                source,
            })?;

        let invalid = |reason: String| AuditError::InvalidPolicy {
            path: path.to_path_buf(),
            reason,
        };
        if policy.api_version != "audit.k8s.io/v1" {
            return Err(invalid(format!("unsupported apiVersion {:?}", policy.api_version)));
        }
        if policy.kind != "Policy" {
            return Err(invalid(format!("unexpected kind {:?}", policy.kind)));
        }
        if policy.rules.is_empty() {
            return Err(invalid("policy must have at least one rule".to_string()));
        }
        Ok(policy)
    }
}

/// Destination of the log backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    File(PathBuf),
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTarget::Stdout => f.write_str("-"),
            LogTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A configured audit backend.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditBackend {
    Log {
        target: LogTarget,
        format: String,
        mode: String,
        max_age_days: u32,
        max_backups: u32,
        max_size_mb: u32,
    },
    Webhook {
        kubeconfig: RemoteKubeconfig,
        mode: String,
        initial_backoff: Duration,
        batch_max_size: u32,
    },
}

impl fmt::Display for AuditBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditBackend::Log { target, mode, .. } => write!(f, "log({}, {})", target, mode),
            AuditBackend::Webhook { kubeconfig, mode, .. } => {
                write!(f, "webhook({}, {})", kubeconfig.path.display(), mode)
            }
        }
    }
}

/// The audit slot of the server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditConfig {
    pub policy: AuditPolicy,
    pub backends: Vec<AuditBackend>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kubeconfig::tests::write_kubeconfig;

    pub(crate) const POLICY: &str = r#"
apiVersion: audit.k8s.io/v1
kind: Policy
omitStages:
- RequestReceived
rules:
- level: None
  nonResourceURLs: ["/healthz*"]
- level: Metadata
  resources:
  - group: custom.metrics.k8s.io
    resources: ["*"]
"#;

    pub(crate) fn write_policy(dir: &Path) -> PathBuf {
        let path = dir.join("policy.yaml");
        std::fs::write(&path, POLICY).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(AuditOptions::new().validate().is_empty());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut options = AuditOptions::new();
        options.log.format = "xml".to_string();
        options.log.mode = "async".to_string();
        options.webhook.batch_max_size = 0;
        assert_eq!(options.validate().len(), 3);
    }

    #[test]
    fn test_load_policy() {
        let dir = tempfile::tempdir().unwrap();
        let policy = AuditPolicy::load(&write_policy(dir.path())).unwrap();
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].level, Level::None);
        assert_eq!(policy.rules[0].non_resource_urls, vec!["/healthz*".to_string()]);
        assert_eq!(policy.omit_stages, vec![Stage::RequestReceived]);
    }

    #[test]
    fn test_load_policy_without_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "apiVersion: audit.k8s.io/v1\nkind: Policy\n").unwrap();
        assert!(matches!(AuditPolicy::load(&path), Err(AuditError::InvalidPolicy { .. })));
    }

    #[test]
    fn test_apply_without_backends() {
        let mut config = ServerConfig::default();
        AuditOptions::new().apply_to(&mut config).unwrap();
        assert!(config.audit.is_none());
    }

    #[test]
    fn test_apply_without_policy() {
        let mut options = AuditOptions::new();
        options.log.path = Some("-".to_string());

        let mut config = ServerConfig::default();
        options.apply_to(&mut config).unwrap();
        assert!(config.audit.is_none());
    }

    #[test]
    fn test_apply_with_log_and_webhook() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("audit.log");

        let mut options = AuditOptions::new();
        options.policy_file = Some(write_policy(dir.path()));
        options.log.path = Some(log_path.to_string_lossy().into_owned());
        options.webhook.config_file = Some(write_kubeconfig(dir.path()));

        let mut config = ServerConfig::default();
        options.apply_to(&mut config).unwrap();

        assert!(log_path.exists());
        let audit = config.audit.unwrap();
        assert_eq!(audit.backends.len(), 2);
        assert!(matches!(
            &audit.backends[0],
            AuditBackend::Log { target: LogTarget::File(p), .. } if p == &log_path
        ));
        assert!(matches!(&audit.backends[1], AuditBackend::Webhook { batch_max_size: 400, .. }));
    }

    #[test]
    fn test_apply_with_invalid_policy() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.yaml");
        std::fs::write(&policy, "rules: [").unwrap();

        let mut options = AuditOptions::new();
        options.policy_file = Some(policy);
        options.log.path = Some("-".to_string());

        let mut config = ServerConfig::default();
        assert!(matches!(
            options.apply_to(&mut config),
            Err(AuditError::ParsePolicy { .. })
        ));
        assert!(config.audit.is_none());
    }
}
