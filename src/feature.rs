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

//! Feature gate support and the generic server feature options.
//!
//! Feature gates allow the API server to incrementally roll out new features.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use clap::{ArgAction, Args};
use k8s_openapi::api::flowcontrol::v1::{FlowSchema, PriorityLevelConfiguration};
use kube::runtime::reflector::Store;
use kube::Client;
use thiserror::Error;

use crate::component::{ComponentOptions, OptionsError};
use crate::informer::SharedInformerFactory;
use crate::server_config::ServerConfig;

const COMPONENT: &str = "features";

/// Error type for feature gate operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureGateError {
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),

    #[error("feature gate {0} is locked to its default and cannot be modified")]
    ReadOnly(String),

    #[error("invalid value for feature gate {0}: expected bool, got {1}")]
    InvalidValue(String, String),
}

/// Result type for feature gate operations.
pub type Result<T> = std::result::Result<T, FeatureGateError>;

/// A trait for types that can check and manipulate feature gates.
pub trait FeatureGate: Send + Sync {
    /// Returns true if the given feature gate is enabled.
    fn enabled(&self, feature: &str) -> bool;

    /// Sets a feature gate to the given value.
    ///
    /// Returns an error if the feature gate doesn't exist or is locked.
    fn set(&self, feature: &str, enabled: bool) -> Result<()>;

    /// Returns all known feature gates and their current values.
    fn all_features(&self) -> HashMap<String, bool>;

    /// Checks if a feature gate exists.
    fn contains(&self, feature: &str) -> bool;
}

/// Maturity of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Alpha,
    Beta,
    Ga,
    Deprecated,
}

/// Static description of a feature gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    pub default: bool,
    pub stage: Stage,
    pub lock_to_default: bool,
}

impl FeatureSpec {
    const fn new(default: bool, stage: Stage) -> Self {
        Self {
            default,
            stage,
            lock_to_default: false,
        }
    }

    const fn locked(default: bool, stage: Stage) -> Self {
        Self {
            default,
            stage,
            lock_to_default: true,
        }
    }
}

const ALL_ALPHA: &str = "AllAlpha";
const ALL_BETA: &str = "AllBeta";

/// In-memory feature gate.
///
/// Explicitly set gates win; otherwise a set `AllAlpha` or `AllBeta`
/// decides every alpha or beta gate, and the remaining gates keep their
/// default.
#[derive(Debug, Clone)]
pub struct MemoryFeatureGate {
    known: Arc<HashMap<String, FeatureSpec>>,
    overrides: Arc<RwLock<HashMap<String, bool>>>,
}

impl MemoryFeatureGate {
    /// Creates a new feature gate with the given known features.
    pub fn new(features: impl IntoIterator<Item = (&'static str, FeatureSpec)>) -> Self {
        let mut known: HashMap<String, FeatureSpec> = features
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect();
        known
            .entry(ALL_ALPHA.to_string())
            .or_insert(FeatureSpec::new(false, Stage::Alpha));
        known
            .entry(ALL_BETA.to_string())
            .or_insert(FeatureSpec::new(false, Stage::Beta));

        Self {
            known: Arc::new(known),
            overrides: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a feature gate with the API server's known features.
    pub fn apiserver() -> Self {
        Self::new(apiserver::default_features().iter().copied())
    }

    /// Sets feature gates from `Name=bool` entries.
    ///
    /// Entries are applied in order; the first bad entry stops processing.
    pub fn set_from_entries<'a>(&self, entries: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for entry in entries {
            let (name, enabled) = parse_entry(entry)?;
            self.set(name, enabled)?;
        }
        Ok(())
    }

    /// Returns the spec of a known feature.
    pub fn spec(&self, feature: &str) -> Option<FeatureSpec> {
        self.known.get(feature).copied()
    }

    /// Returns the explicitly set gates, sorted by name.
    pub fn overrides(&self) -> Vec<(String, bool)> {
        let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
        let mut set: Vec<(String, bool)> = overrides.iter().map(|(k, v)| (k.clone(), *v)).collect();
        set.sort();
        set
    }
}

impl Default for MemoryFeatureGate {
    fn default() -> Self {
        Self::apiserver()
    }
}

fn parse_entry(entry: &str) -> Result<(&str, bool)> {
    let (name, value) = entry
        .split_once('=')
        .ok_or_else(|| FeatureGateError::InvalidValue(entry.to_string(), "missing =".to_string()))?;
    let enabled = value
        .trim()
        .parse::<bool>()
        .map_err(|_| FeatureGateError::InvalidValue(name.to_string(), value.to_string()))?;
    Ok((name.trim(), enabled))
}

impl FeatureGate for MemoryFeatureGate {
    fn enabled(&self, feature: &str) -> bool {
        let Some(spec) = self.known.get(feature) else {
            return false;
        };
        let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(enabled) = overrides.get(feature) {
            return *enabled;
        }
        let umbrella = match spec.stage {
            Stage::Alpha if feature != ALL_ALPHA => overrides.get(ALL_ALPHA),
            Stage::Beta if feature != ALL_BETA => overrides.get(ALL_BETA),
            _ => None,
        };
        umbrella.copied().unwrap_or(spec.default)
    }

    fn set(&self, feature: &str, enabled: bool) -> Result<()> {
        let spec = self
            .known
            .get(feature)
            .ok_or_else(|| FeatureGateError::UnknownFeature(feature.to_string()))?;

        if spec.lock_to_default && spec.default != enabled {
            return Err(FeatureGateError::ReadOnly(feature.to_string()));
        }

        let mut overrides = self.overrides.write().unwrap_or_else(PoisonError::into_inner);
        overrides.insert(feature.to_string(), enabled);
        Ok(())
    }

    fn all_features(&self) -> HashMap<String, bool> {
        self.known
            .keys()
            .map(|name| (name.clone(), self.enabled(name)))
            .collect()
    }

    fn contains(&self, feature: &str) -> bool {
        self.known.contains_key(feature)
    }
}

/// API server feature gates.
pub mod apiserver {
    use super::{FeatureSpec, Stage};

    /// Returns the known API server feature gates.
    pub fn default_features() -> &'static [(&'static str, FeatureSpec)] {
        const FEATURES: &[(&str, FeatureSpec)] = &[
            ("AggregatedDiscoveryEndpoint", FeatureSpec::locked(true, Stage::Ga)),
            ("AnonymousAuthConfigurableEndpoints", FeatureSpec::new(true, Stage::Beta)),
            ("APIListChunking", FeatureSpec::locked(true, Stage::Ga)),
            ("APIResponseCompression", FeatureSpec::new(true, Stage::Beta)),
            ("APIServerIdentity", FeatureSpec::new(true, Stage::Beta)),
            ("APIServerTracing", FeatureSpec::new(true, Stage::Beta)),
            ("ComponentSLIs", FeatureSpec::locked(true, Stage::Ga)),
            ("ConsistentListFromCache", FeatureSpec::new(true, Stage::Beta)),
            ("OpenAPIEnums", FeatureSpec::new(true, Stage::Beta)),
            ("RemainingItemCount", FeatureSpec::locked(true, Stage::Ga)),
            ("StorageVersionAPI", FeatureSpec::new(false, Stage::Alpha)),
            ("StorageVersionHash", FeatureSpec::new(true, Stage::Beta)),
            ("StructuredAuthenticationConfiguration", FeatureSpec::new(true, Stage::Beta)),
            ("StructuredAuthorizationConfiguration", FeatureSpec::new(true, Stage::Beta)),
            ("UnauthenticatedHTTP2DOSMitigation", FeatureSpec::new(true, Stage::Beta)),
            ("WatchList", FeatureSpec::new(false, Stage::Alpha)),
        ];
        FEATURES
    }
}

/// Errors produced while applying feature options.
#[derive(Error, Debug)]
pub enum FeatureError {
    #[error(
        "invalid configuration: MaxRequestsInFlight={max_requests_in_flight} and \
         MaxMutatingRequestsInFlight={max_mutating_requests_in_flight}; parallelism \
         must be at least one"
    )]
    InFlightLimits {
        max_requests_in_flight: u32,
        max_mutating_requests_in_flight: u32,
    },

    #[error("failed to set feature gates: {0}")]
    FeatureGate(#[from] FeatureGateError),
}

/// Generic server feature options.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct FeatureOptions {
    /// Enable profiling via web interface host:port/debug/pprof/.
    #[arg(long = "profiling", default_value_t = true, action = ArgAction::Set)]
    pub enable_profiling: bool,

    /// Serve profiling on a unix domain socket at this path instead.
    #[arg(long = "debug-socket-path")]
    pub debug_socket_path: Option<PathBuf>,

    /// Enable block profiling, if profiling is enabled.
    #[arg(long = "contention-profiling")]
    pub enable_contention_profiling: bool,

    /// Enable priority and fairness.
    #[arg(long = "enable-priority-and-fairness", default_value_t = true, action = ArgAction::Set)]
    pub enable_priority_and_fairness: bool,

    /// A set of key=value pairs that describe feature gates for alpha or
    /// experimental features.
    #[arg(long = "feature-gates", value_delimiter = ',')]
    pub feature_gates: Vec<String>,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            enable_profiling: true,
            debug_socket_path: None,
            enable_contention_profiling: false,
            enable_priority_and_fairness: true,
            feature_gates: Vec::new(),
        }
    }
}

impl FeatureOptions {
    /// Creates feature options with their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    fn feature_gate(&self) -> Result<MemoryFeatureGate> {
        let gate = MemoryFeatureGate::apiserver();
        gate.set_from_entries(self.feature_gates.iter().map(String::as_str))?;
        Ok(gate)
    }

    /// Applies the options onto `config`.
    ///
    /// With priority and fairness enabled the flowcontrol informers are
    /// registered on `informers`; they start with the rest of the factory.
    pub fn apply_to(
        &self,
        config: &mut ServerConfig,
        client: &Client,
        informers: &Arc<SharedInformerFactory>,
    ) -> std::result::Result<(), FeatureError> {
        let gate = self.feature_gate()?;

        config.enable_profiling = self.enable_profiling;
        config.debug_socket_path = self.debug_socket_path.clone();
        config.enable_contention_profiling = self.enable_contention_profiling;
        config.feature_gate = Arc::new(gate);

        if self.enable_priority_and_fairness {
            let server_concurrency_limit = config
                .max_requests_in_flight
                .saturating_add(config.max_mutating_requests_in_flight);
            if server_concurrency_limit == 0 {
                return Err(FeatureError::InFlightLimits {
                    max_requests_in_flight: config.max_requests_in_flight,
                    max_mutating_requests_in_flight: config.max_mutating_requests_in_flight,
                });
            }
            config.flow_control = Some(FlowControlConfig {
                client: client.clone(),
                flow_schemas: informers.informer_for::<FlowSchema>(),
                priority_levels: informers.informer_for::<PriorityLevelConfiguration>(),
                server_concurrency_limit,
                request_wait_limit: DEFAULT_REQUEST_WAIT_LIMIT,
            });
            tracing::info!(server_concurrency_limit, "priority and fairness enabled");
        }

        config.shared_informer_factory = Some(Arc::clone(informers));
        Ok(())
    }
}

impl ComponentOptions for FeatureOptions {
    fn validate(&self) -> Vec<OptionsError> {
        let mut errors = Vec::new();
        let gate = MemoryFeatureGate::apiserver();
        for entry in &self.feature_gates {
            if let Err(e) = parse_entry(entry).and_then(|(name, enabled)| gate.set(name, enabled)) {
                errors.push(OptionsError::invalid_flag(COMPONENT, "feature-gates", e.to_string()));
            }
        }
        if self.enable_contention_profiling && !self.enable_profiling {
            errors.push(OptionsError::invalid_flag(
                COMPONENT,
                "contention-profiling",
                "requires --profiling",
            ));
        }
        errors
    }
}

/// How long a request may wait in a priority level queue.
pub const DEFAULT_REQUEST_WAIT_LIMIT: Duration = Duration::from_secs(15);

/// Priority and fairness settings handed to the request filter.
#[derive(Clone)]
pub struct FlowControlConfig {
    /// Client used to write flow schema status.
    pub client: Client,
    pub flow_schemas: Store<FlowSchema>,
    pub priority_levels: Store<PriorityLevelConfiguration>,
    /// Total seats shared by all priority levels.
    pub server_concurrency_limit: u32,
    pub request_wait_limit: Duration,
}

impl fmt::Debug for FlowControlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowControlConfig")
            .field("server_concurrency_limit", &self.server_concurrency_limit)
            .field("request_wait_limit", &self.request_wait_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> MemoryFeatureGate {
        MemoryFeatureGate::new([
            ("alpha", FeatureSpec::new(false, Stage::Alpha)),
            ("beta", FeatureSpec::new(true, Stage::Beta)),
            ("ga", FeatureSpec::locked(true, Stage::Ga)),
        ])
    }

    fn client() -> Client {
        let config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[test]
    fn test_feature_gate_enable_disable() {
        let fg = gate();

        assert!(!fg.enabled("alpha"));
        fg.set("alpha", true).unwrap();
        assert!(fg.enabled("alpha"));
        fg.set("alpha", false).unwrap();
        assert!(!fg.enabled("alpha"));
    }

    #[test]
    fn test_feature_gate_locked() {
        let fg = gate();

        assert!(fg.spec("ga").unwrap().lock_to_default);
        assert!(fg.set("ga", true).is_ok());
        assert_eq!(fg.set("ga", false), Err(FeatureGateError::ReadOnly("ga".to_string())));
        assert!(fg.enabled("ga"));
    }

    #[test]
    fn test_feature_gate_unknown() {
        let fg = gate();

        assert!(!fg.enabled("unknown"));
        assert!(fg.set("unknown", true).is_err());
        assert!(fg.spec("unknown").is_none());
        assert_eq!(fg.all_features().len(), 5);
    }

    #[test]
    fn test_feature_gate_all_alpha() {
        let fg = gate();
        fg.set_from_entries(["AllAlpha=true"]).unwrap();
        assert!(fg.enabled("alpha"));

        fg.set_from_entries(["alpha=false"]).unwrap();
        assert!(!fg.enabled("alpha"));
        assert!(fg.enabled("beta"));

        fg.set_from_entries(["AllBeta=false"]).unwrap();
        assert!(!fg.enabled("beta"));
        assert!(fg.enabled("ga"));
    }

    #[test]
    fn test_feature_gate_from_entries() {
        let fg = gate();

        fg.set_from_entries(["alpha=true", "beta=false"]).unwrap();
        assert!(fg.enabled("alpha"));
        assert!(!fg.enabled("beta"));
        assert_eq!(
            fg.overrides(),
            vec![("alpha".to_string(), true), ("beta".to_string(), false)]
        );
        assert!(fg.set_from_entries(["alpha=yes"]).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(FeatureOptions::new().validate().is_empty());
    }

    #[test]
    fn test_validate() {
        let options = FeatureOptions {
            enable_profiling: false,
            enable_contention_profiling: true,
            feature_gates: vec![
                "WatchList=true".to_string(),
                "NoSuchGate=true".to_string(),
                "APIListChunking=false".to_string(),
                "OpenAPIEnums".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(options.validate().len(), 4);
    }

    #[tokio::test]
    async fn test_apply_with_priority_and_fairness() {
        let client = client();
        let informers = informers(&client);
        let options = FeatureOptions {
            enable_contention_profiling: true,
            feature_gates: vec!["WatchList=true".to_string()],
            ..Default::default()
        };

        let mut config = ServerConfig::default();
        options.apply_to(&mut config, &client, &informers).unwrap();

        assert!(config.enable_profiling);
        assert!(config.enable_contention_profiling);
        assert!(config.feature_gate.enabled("WatchList"));
        assert_eq!(config.flow_control.as_ref().unwrap().server_concurrency_limit, 600);
        assert_eq!(
            informers.registered_kinds(),
            vec!["FlowSchema", "PriorityLevelConfiguration"]
        );
        assert!(config.shared_informer_factory.is_some());
    }

    fn informers(client: &Client) -> Arc<SharedInformerFactory> {
        Arc::new(SharedInformerFactory::new(client.clone(), Duration::from_secs(600)))
    }

    #[tokio::test]
    async fn test_apply_without_in_flight_capacity() {
        let client = client();
        let informers = informers(&client);

        let mut config = ServerConfig::default();
        config.max_requests_in_flight = 0;
        config.max_mutating_requests_in_flight = 0;

        let err = FeatureOptions::new()
            .apply_to(&mut config, &client, &informers)
            .unwrap_err();
        assert!(matches!(err, FeatureError::InFlightLimits { .. }));
        assert!(config.flow_control.is_none());
        assert!(informers.registered_kinds().is_empty());
    }

    #[tokio::test]
    async fn test_apply_with_saturated_in_flight_limits() {
        let client = client();
        let informers = informers(&client);

        let mut config = ServerConfig::default();
        config.max_requests_in_flight = u32::MAX;
        config.max_mutating_requests_in_flight = 1;

        FeatureOptions::new()
            .apply_to(&mut config, &client, &informers)
            .unwrap();
        let flow_control = config.flow_control.as_ref().unwrap();
        assert_eq!(flow_control.server_concurrency_limit, u32::MAX);
    }

    #[tokio::test]
    async fn test_apply_without_priority_and_fairness() {
        let client = client();
        let informers = informers(&client);
        let options = FeatureOptions {
            enable_priority_and_fairness: false,
            ..Default::default()
        };

        let mut config = ServerConfig::default();
        config.max_requests_in_flight = 0;
        config.max_mutating_requests_in_flight = 0;
        options.apply_to(&mut config, &client, &informers).unwrap();

        assert!(config.flow_control.is_none());
        assert!(config.shared_informer_factory.is_some());
    }
}
