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

//! The contract shared by every server option component.
//!
//! Each concern (secure serving, authentication, authorization, audit,
//! features) is a clap [`Args`] struct that can validate itself, register its
//! flags on a [`Command`] and pick its values back up from parsed
//! [`ArgMatches`]. Applying a component is concern-specific and lives on the
//! component type itself.

use std::time::Duration;

use clap::{ArgMatches, Args, Command};
use thiserror::Error;

/// A validation failure reported by one option component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("{component}: --{flag} {reason}")]
    InvalidFlag {
        component: &'static str,
        flag: &'static str,
        reason: String,
    },

    #[error("{component}: --{first} and --{second} must be specified together")]
    RequiredTogether {
        component: &'static str,
        first: &'static str,
        second: &'static str,
    },

    #[error("{component}: {reason}")]
    Invalid {
        component: &'static str,
        reason: String,
    },
}

impl OptionsError {
    /// Builds an [`OptionsError::InvalidFlag`].
    pub fn invalid_flag(
        component: &'static str,
        flag: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        OptionsError::InvalidFlag {
            component,
            flag,
            reason: reason.into(),
        }
    }

    /// Returns the name of the component that reported this error.
    pub fn component(&self) -> &'static str {
        match self {
            OptionsError::InvalidFlag { component, .. }
            | OptionsError::RequiredTogether { component, .. }
            | OptionsError::Invalid { component, .. } => component,
        }
    }
}

/// The validate / add-flags / apply-flags contract of a server option
/// component.
pub trait ComponentOptions: Args {
    /// Checks the component's settings.
    ///
    /// Every problem found is returned; an empty vector means the component
    /// is valid.
    fn validate(&self) -> Vec<OptionsError>;

    /// Registers the component's flags on `cmd`.
    fn add_flags(cmd: Command) -> Command {
        Self::augment_args(cmd)
    }

    /// Copies flag values parsed by a command built with
    /// [`ComponentOptions::add_flags`] into `self`.
    ///
    /// Fields that are not backed by a flag are left untouched.
    fn apply_flags(&mut self, matches: &ArgMatches) -> Result<(), clap::Error> {
        self.update_from_arg_matches(matches)
    }
}

/// Parses a human readable duration such as `10s` or `1m30s`.
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Retry policy for calls to delegated webhooks.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRetryBackoff {
    /// Initial wait between attempts.
    pub duration: Duration,
    /// Multiplier applied to the wait after each attempt.
    pub factor: f64,
    /// Random jitter fraction added to each wait.
    pub jitter: f64,
    /// Number of attempts.
    pub steps: u32,
}

impl Default for WebhookRetryBackoff {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(500),
            factor: 1.5,
            jitter: 0.2,
            steps: 5,
        }
    }
}

impl WebhookRetryBackoff {
    /// Validates the backoff on behalf of `component`.
    pub fn validate(&self, component: &'static str) -> Vec<OptionsError> {
        let mut errors = Vec::new();
        if self.steps == 0 {
            errors.push(OptionsError::Invalid {
                component,
                reason: "number of webhook retry attempts must be greater than 0".to_string(),
            });
        }
        if self.duration.is_zero() {
            errors.push(OptionsError::Invalid {
                component,
                reason: "webhook retry backoff duration must be greater than 0".to_string(),
            });
        }
        errors
    }
}

/// Reports blank entries in a list-valued flag.
pub(crate) fn check_blank_entries(
    component: &'static str,
    flag: &'static str,
    values: &[String],
) -> Option<OptionsError> {
    if values.iter().any(|v| v.trim().is_empty()) {
        Some(OptionsError::invalid_flag(component, flag, "must not contain blank entries"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("ten seconds").is_err());
    }

    #[test]
    fn test_default_backoff_is_valid() {
        assert!(WebhookRetryBackoff::default().validate("test").is_empty());
    }

    #[test]
    fn test_backoff_reports_every_problem() {
        let backoff = WebhookRetryBackoff {
            duration: Duration::ZERO,
            steps: 0,
            ..Default::default()
        };
        let errors = backoff.validate("authentication");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.component() == "authentication"));
    }

    #[test]
    fn test_blank_entries() {
        let values = vec!["x-remote-user".to_string(), "  ".to_string()];
        let err = check_blank_entries("authentication", "requestheader-username-headers", &values);
        assert!(err.is_some());
        assert!(check_blank_entries("authentication", "x", &values[..1]).is_none());
    }
}
