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

//! Kubeconfig resolution for delegated webhooks.
//!
//! Authentication, authorization and the audit webhook all talk to a remote
//! authority described either by a kubeconfig file or by the in-cluster
//! service account.

use std::path::{Path, PathBuf};

use kube::config::{Kubeconfig, KubeconfigError};
use thiserror::Error;

/// Errors produced while loading a remote kubeconfig.
#[derive(Error, Debug)]
pub enum RemoteKubeconfigError {
    #[error("failed to load kubeconfig {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },

    #[error("kubeconfig {0:?} contains no clusters")]
    NoClusters(PathBuf),
}

/// A parsed kubeconfig file used to reach a remote authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKubeconfig {
    /// File the kubeconfig was read from.
    pub path: PathBuf,
    /// The kubeconfig's current context, if any.
    pub current_context: Option<String>,
    /// Number of clusters declared in the file.
    pub clusters: usize,
}

impl RemoteKubeconfig {
    /// Reads and parses the kubeconfig at `path`.
    pub fn load(path: &Path) -> Result<Self, RemoteKubeconfigError> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|source| RemoteKubeconfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        if kubeconfig.clusters.is_empty() {
            return Err(RemoteKubeconfigError::NoClusters(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            current_context: kubeconfig.current_context,
            clusters: kubeconfig.clusters.len(),
        })
    }
}

/// Where a delegated check is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationTarget {
    /// The cluster described by a kubeconfig file.
    Kubeconfig(RemoteKubeconfig),
    /// The cluster this process runs in, through its service account.
    InCluster,
}

impl DelegationTarget {
    /// Resolves the target for a delegating component.
    ///
    /// An explicit kubeconfig wins and must load. Otherwise the in-cluster
    /// service account is used when available. `Ok(None)` means no remote
    /// authority is reachable.
    pub fn resolve(kubeconfig: Option<&Path>) -> Result<Option<Self>, RemoteKubeconfigError> {
        if let Some(path) = kubeconfig {
            return RemoteKubeconfig::load(path).map(|k| Some(DelegationTarget::Kubeconfig(k)));
        }
        match kube::Config::incluster() {
            Ok(_) => Ok(Some(DelegationTarget::InCluster)),
            Err(e) => {
                tracing::debug!(error = %e, "in-cluster configuration unavailable");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example:6443
contexts:
- name: remote
  context:
    cluster: remote
    user: webhook
current-context: remote
users:
- name: webhook
  user:
    token: abc
"#;

    /// Writes a valid kubeconfig into `dir` and returns its path.
    pub(crate) fn write_kubeconfig(dir: &Path) -> PathBuf {
        let path = dir.join("kubeconfig");
        std::fs::write(&path, KUBECONFIG).unwrap();
        path
    }

    #[test]
    fn test_load_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_kubeconfig(dir.path());

        let loaded = RemoteKubeconfig::load(&path).unwrap();
        assert_eq!(loaded.current_context.as_deref(), Some("remote"));
        assert_eq!(loaded.clusters, 1);
    }

    #[test]
    fn test_load_kubeconfig_without_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, "apiVersion: v1\nkind: Config\n").unwrap();

        assert!(matches!(
            RemoteKubeconfig::load(&path),
            Err(RemoteKubeconfigError::NoClusters(_))
        ));
    }

    #[test]
    fn test_resolve_missing_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(DelegationTarget::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_resolve_explicit_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_kubeconfig(dir.path());

        match DelegationTarget::resolve(Some(&path)).unwrap() {
            Some(DelegationTarget::Kubeconfig(k)) => assert_eq!(k.path, path),
            other => panic!("unexpected target: {:?}", other),
        }
    }
}
