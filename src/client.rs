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

//! Construction of the external Kubernetes client.

use std::time::Duration;

use kube::Client;
use thiserror::Error;

use crate::informer::SharedInformerFactory;

/// Resync period of the informer factory built during option application.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Errors produced while building a client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("unsupported scheme {scheme:?} in cluster url {url}")]
    UnsupportedScheme { scheme: String, url: String },

    #[error("cluster url {0} has no host")]
    MissingHost(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Builds clients and informer factories from an external client
/// configuration.
pub trait ClientFactory {
    /// Creates a client for `config`.
    fn new_client(&self, config: &kube::Config) -> Result<Client, ClientError>;

    /// Creates an informer factory bound to `client`.
    fn new_informer_factory(&self, client: Client, resync: Duration) -> SharedInformerFactory {
        SharedInformerFactory::new(client, resync)
    }
}

/// The default [`ClientFactory`], backed by `kube::Client`.
///
/// Clients must be created from within a Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeClientFactory;

impl ClientFactory for KubeClientFactory {
    fn new_client(&self, config: &kube::Config) -> Result<Client, ClientError> {
        let url = &config.cluster_url;
        match url.scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(ClientError::UnsupportedScheme {
                    scheme: other.unwrap_or_default().to_string(),
                    url: url.to_string(),
                })
            }
        }
        if url.host().map_or(true, str::is_empty) {
            return Err(ClientError::MissingHost(url.to_string()));
        }
        Ok(Client::try_from(config.clone())?)
    }
}
