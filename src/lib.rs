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

//! custom-metrics-apiserver-rust - server options for a custom metrics API server
//!
//! This library composes the generic API server option components and
//! applies them onto a runtime configuration:
//! - Secure serving with a loopback client and self-signed defaults
//! - Delegated authentication and authorization
//! - Audit policy and backends
//! - Feature gates, profiling and priority and fairness
//! - The external client and its shared informer factory
//! - OpenAPI documents and metrics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod authentication;
pub mod authorization;
pub mod cert;
pub mod client;
pub mod component;
pub mod feature;
pub mod informer;
pub mod kubeconfig;
pub mod openapi;
pub mod options;
pub mod server_config;
pub mod serving;

// Re-export commonly used types
pub use client::{ClientFactory, KubeClientFactory};
pub use component::{ComponentOptions, OptionsError};
pub use feature::{FeatureGate, MemoryFeatureGate};
pub use informer::SharedInformerFactory;
pub use options::{ApplyError, ApplyStep, ServerOptions};
pub use server_config::ServerConfig;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
