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

//! Secure serving options.
//!
//! Resolves the HTTPS listener settings and, with loopback enabled, the
//! client configuration the server uses to call itself.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Args;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::cert::{self, CaBundle, CertError, CertKeyPair};
use crate::component::{ComponentOptions, OptionsError};

/// Default HTTPS port.
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Default directory for generated serving certificates.
pub const DEFAULT_CERT_DIR: &str = "apiserver.local.config/certificates";

/// Default file name stem for generated serving certificates.
pub const DEFAULT_PAIR_NAME: &str = "apiserver";

/// Server name the loopback client verifies.
pub const LOOPBACK_SERVER_NAME: &str = "apiserver-loopback-client";

const COMPONENT: &str = "secure-serving";

/// TLS protocol versions accepted by `--tls-min-version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TlsVersion {
    /// TLS 1.2.
    #[serde(rename = "VersionTLS12")]
    Tls12,
    /// TLS 1.3.
    #[serde(rename = "VersionTLS13")]
    Tls13,
}

impl TlsVersion {
    /// Parses a flag value such as `VersionTLS12`.
    pub fn from_flag(value: &str) -> Option<Self> {
        match value {
            "VersionTLS12" => Some(TlsVersion::Tls12),
            "VersionTLS13" => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => f.write_str("VersionTLS12"),
            TlsVersion::Tls13 => f.write_str("VersionTLS13"),
        }
    }
}

/// Cipher suite names accepted by `--tls-cipher-suites`.
pub const SUPPORTED_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
];

/// Errors produced while applying secure serving options.
#[derive(Error, Debug)]
pub enum ServingError {
    #[error("failed to load serving certificate: {0}")]
    Certificate(#[source] CertError),

    #[error(
        "no serving certificate configured; \
         set --tls-cert-file and --tls-private-key-file or --cert-dir"
    )]
    MissingCertificate,

    #[error("unknown cipher suite {0:?}")]
    UnknownCipherSuite(String),

    #[error("unknown TLS version {0:?}")]
    UnknownTlsVersion(String),

    #[error("cipher suites may not be specified when --tls-min-version is 'VersionTLS13'")]
    CipherSuitesWithTls13,

    #[error("failed to generate loopback certificate: {0}")]
    LoopbackCertificate(#[source] CertError),
}

/// Secure serving options.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct SecureServingOptions {
    /// The IP address on which to listen for the --secure-port port.
    #[arg(long = "bind-address", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// The port on which to serve HTTPS with authentication and authorization.
    /// If 0, don't serve HTTPS at all.
    #[arg(long = "secure-port", default_value_t = DEFAULT_SECURE_PORT)]
    pub bind_port: u16,

    /// The directory where the TLS certs are located. If --tls-cert-file and
    /// --tls-private-key-file are provided, this flag will be ignored.
    #[arg(long = "cert-dir", default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: String,

    /// File containing the default x509 certificate for HTTPS.
    #[arg(long = "tls-cert-file")]
    pub cert_file: Option<PathBuf>,

    /// File containing the default x509 private key matching --tls-cert-file.
    #[arg(long = "tls-private-key-file")]
    pub key_file: Option<PathBuf>,

    /// Comma-separated list of cipher suites for the server.
    #[arg(long = "tls-cipher-suites", value_delimiter = ',')]
    pub cipher_suites: Vec<String>,

    /// Minimum TLS version supported. Possible values: VersionTLS12, VersionTLS13.
    #[arg(long = "tls-min-version")]
    pub min_tls_version: Option<String>,

    /// The limit that the server gives to clients for the maximum number of
    /// streams in an HTTP/2 connection. Zero means to use the default.
    #[arg(long = "http2-max-streams-per-connection", default_value_t = 0)]
    pub http2_max_streams_per_connection: u32,

    /// If true, SO_REUSEPORT will be used when binding the port.
    #[arg(long = "permit-port-sharing")]
    pub permit_port_sharing: bool,

    /// File name stem used for certificates written to the cert dir.
    #[arg(skip = DEFAULT_PAIR_NAME.to_string())]
    pub pair_name: String,

    /// In-memory certificate used when no cert dir is configured.
    #[arg(skip)]
    pub generated_cert: Option<CertKeyPair>,

    /// Whether a loopback client configuration is produced.
    #[arg(skip)]
    pub loopback: bool,
}

impl Default for SecureServingOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureServingOptions {
    /// Creates secure serving options with their defaults.
    pub fn new() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_SECURE_PORT,
            cert_dir: DEFAULT_CERT_DIR.to_string(),
            cert_file: None,
            key_file: None,
            cipher_suites: Vec::new(),
            min_tls_version: None,
            http2_max_streams_per_connection: 0,
            permit_port_sharing: false,
            pair_name: DEFAULT_PAIR_NAME.to_string(),
            generated_cert: None,
            loopback: false,
        }
    }

    /// Enables the loopback client configuration.
    pub fn with_loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Returns true if secure serving is turned off.
    pub fn disabled(&self) -> bool {
        self.bind_port == 0
    }

    /// Ensures a serving certificate exists, generating a self-signed one if
    /// neither a cert/key file pair nor an in-memory certificate is set.
    ///
    /// With a cert dir, an existing `<pair_name>.crt` / `<pair_name>.key`
    /// pair is reused and a generated pair is written there. Without one,
    /// the generated pair is kept in memory.
    pub fn maybe_default_with_self_signed_certs(
        &mut self,
        public_address: &str,
        alternate_dns: &[String],
        alternate_ips: &[IpAddr],
    ) -> cert::Result<()> {
        if self.disabled() {
            return Ok(());
        }
        if self.cert_file.is_some() || self.key_file.is_some() || self.generated_cert.is_some() {
            return Ok(());
        }

        let mut alternate_dns = alternate_dns.to_vec();
        let mut alternate_ips = alternate_ips.to_vec();
        if self.bind_address.is_unspecified() {
            alternate_dns.push("localhost".to_string());
        } else {
            alternate_ips.push(self.bind_address);
        }

        if self.cert_dir.is_empty() {
            let pair = cert::generate_self_signed(public_address, &alternate_ips, &alternate_dns)?;
            tracing::info!(host = %public_address, "generated in-memory self-signed certificate");
            self.generated_cert = Some(pair);
            return Ok(());
        }

        let dir = Path::new(&self.cert_dir);
        let cert_path = dir.join(format!("{}.crt", self.pair_name));
        let key_path = dir.join(format!("{}.key", self.pair_name));

        if !cert::can_read_cert_and_key(&cert_path, &key_path) {
            let pair = cert::generate_self_signed(public_address, &alternate_ips, &alternate_dns)?;
            cert::write_cert_and_key(&pair, &cert_path, &key_path)?;
            tracing::info!(
                cert = %cert_path.display(),
                key = %key_path.display(),
                "generated self-signed certificate"
            );
        }

        self.cert_file = Some(cert_path);
        self.key_file = Some(key_path);
        Ok(())
    }

    /// Applies the options onto the serving slot and, with loopback enabled,
    /// the loopback client slot.
    ///
    /// With `--secure-port=0` serving is turned off and both slots are left
    /// untouched.
    pub fn apply_to(
        &self,
        serving: &mut Option<SecureServingInfo>,
        loopback: &mut Option<LoopbackClientConfig>,
    ) -> Result<(), ServingError> {
        if self.disabled() {
            tracing::info!("secure serving disabled");
            return Ok(());
        }

        let cert = match (&self.cert_file, &self.key_file, &self.generated_cert) {
            (Some(cert_file), Some(key_file), _) => {
                cert::load_cert_and_key(cert_file, key_file).map_err(ServingError::Certificate)?
            }
            (None, None, Some(generated)) => generated.clone(),
            _ => return Err(ServingError::MissingCertificate),
        };

        let min_tls_version = match &self.min_tls_version {
            Some(value) => Some(
                TlsVersion::from_flag(value)
                    .ok_or_else(|| ServingError::UnknownTlsVersion(value.clone()))?,
            ),
            None => None,
        };
        if let Some(suite) = self
            .cipher_suites
            .iter()
            .find(|s| !SUPPORTED_CIPHER_SUITES.contains(&s.as_str()))
        {
            return Err(ServingError::UnknownCipherSuite(suite.clone()));
        }
        if min_tls_version == Some(TlsVersion::Tls13) && !self.cipher_suites.is_empty() {
            return Err(ServingError::CipherSuitesWithTls13);
        }

        let mut info = SecureServingInfo {
            listen_addr: SocketAddr::new(self.bind_address, self.bind_port),
            cert,
            sni_certs: Vec::new(),
            client_ca: None,
            cipher_suites: self.cipher_suites.clone(),
            min_tls_version,
            http2_max_streams_per_connection: self.http2_max_streams_per_connection,
            permit_port_sharing: self.permit_port_sharing,
        };

        if self.loopback {
            let loopback_cert = cert::generate_self_signed(LOOPBACK_SERVER_NAME, &[], &[])
                .map_err(ServingError::LoopbackCertificate)?;
            let config = LoopbackClientConfig::new(info.loopback_host_port(), &loopback_cert);
            info.sni_certs.push(SniCert {
                names: vec![LOOPBACK_SERVER_NAME.to_string()],
                pair: loopback_cert,
            });
            *loopback = Some(config);
        }

        tracing::debug!(listen_addr = %info.listen_addr, "secure serving configured");
        *serving = Some(info);
        Ok(())
    }
}

impl ComponentOptions for SecureServingOptions {
    fn validate(&self) -> Vec<OptionsError> {
        let mut errors = Vec::new();

        if self.cert_file.is_some() != self.key_file.is_some() {
            errors.push(OptionsError::RequiredTogether {
                component: COMPONENT,
                first: "tls-cert-file",
                second: "tls-private-key-file",
            });
        }
        if self.cert_file.is_some() && self.generated_cert.is_some() {
            errors.push(OptionsError::Invalid {
                component: COMPONENT,
                reason: "cert/key file and in-memory certificate cannot both be set".to_string(),
            });
        }

        let min_version = match &self.min_tls_version {
            Some(value) => {
                let parsed = TlsVersion::from_flag(value);
                if parsed.is_none() {
                    errors.push(OptionsError::invalid_flag(
                        COMPONENT,
                        "tls-min-version",
                        format!(
                            "has unknown value {:?}; allowed values: VersionTLS12, VersionTLS13",
                            value
                        ),
                    ));
                }
                parsed
            }
            None => None,
        };

        let unknown: Vec<&str> = self
            .cipher_suites
            .iter()
            .map(String::as_str)
            .filter(|s| !SUPPORTED_CIPHER_SUITES.contains(s))
            .collect();
        if !unknown.is_empty() {
            errors.push(OptionsError::invalid_flag(
                COMPONENT,
                "tls-cipher-suites",
                format!("contains unknown cipher suites: {}", unknown.join(", ")),
            ));
        }

        if min_version == Some(TlsVersion::Tls13) && !self.cipher_suites.is_empty() {
            errors.push(OptionsError::invalid_flag(
                COMPONENT,
                "tls-cipher-suites",
                "may not be specified when --tls-min-version is 'VersionTLS13'",
            ));
        }

        errors
    }
}

/// A certificate served for specific SNI names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniCert {
    /// Server names this certificate answers for.
    pub names: Vec<String>,
    /// The certificate and key.
    pub pair: CertKeyPair,
}

/// Resolved HTTPS listener configuration.
#[derive(Debug, Clone)]
pub struct SecureServingInfo {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Default serving certificate.
    pub cert: CertKeyPair,
    /// Additional certificates selected by SNI.
    pub sni_certs: Vec<SniCert>,
    /// CA used to verify client certificates, set by authentication.
    pub client_ca: Option<CaBundle>,
    /// Allowed cipher suites; empty means the TLS library defaults.
    pub cipher_suites: Vec<String>,
    /// Minimum TLS version.
    pub min_tls_version: Option<TlsVersion>,
    /// HTTP/2 stream limit; zero means the default.
    pub http2_max_streams_per_connection: u32,
    /// Whether SO_REUSEPORT is used.
    pub permit_port_sharing: bool,
}

impl SecureServingInfo {
    /// Returns the address a loopback client should dial.
    ///
    /// Unspecified bind addresses are replaced by the loopback address of the
    /// same family.
    pub fn loopback_host_port(&self) -> SocketAddr {
        let ip = match self.listen_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.listen_addr.port())
    }
}

/// Client configuration for calls from the server to itself.
#[derive(Clone, PartialEq)]
pub struct LoopbackClientConfig {
    /// Base URL of the secure listener.
    pub host: String,
    /// Server name presented for SNI and verified against the CA.
    pub server_name: String,
    /// Bearer token authenticating the loopback client.
    pub bearer_token: String,
    /// PEM CA used to verify the loopback certificate.
    pub ca_pem: String,
    /// Client side rate limit.
    pub qps: f32,
    /// Client side burst.
    pub burst: u32,
}

impl LoopbackClientConfig {
    fn new(addr: SocketAddr, loopback_cert: &CertKeyPair) -> Self {
        let bearer_token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        Self {
            host: format!("https://{}", addr),
            server_name: LOOPBACK_SERVER_NAME.to_string(),
            bearer_token,
            ca_pem: loopback_cert.cert_pem.clone(),
            qps: 50.0,
            burst: 100,
        }
    }
}

impl fmt::Debug for LoopbackClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackClientConfig")
            .field("host", &self.host)
            .field("server_name", &self.server_name)
            .field("bearer_token", &"<redacted>")
            .field("qps", &self.qps)
            .field("burst", &self.burst)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory() -> SecureServingOptions {
        SecureServingOptions {
            cert_dir: String::new(),
            ..SecureServingOptions::new().with_loopback()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(SecureServingOptions::new().validate().is_empty());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let options = SecureServingOptions {
            cert_file: Some(PathBuf::from("tls.crt")),
            min_tls_version: Some("VersionTLS10".to_string()),
            cipher_suites: vec!["TLS_RSA_WITH_RC4_128_SHA".to_string()],
            ..SecureServingOptions::new()
        };
        let errors = options.validate();
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_validate_tls13_with_cipher_suites() {
        let options = SecureServingOptions {
            min_tls_version: Some("VersionTLS13".to_string()),
            cipher_suites: vec!["TLS_AES_128_GCM_SHA256".to_string()],
            ..SecureServingOptions::new()
        };
        assert_eq!(options.validate().len(), 1);
    }

    #[test]
    fn test_self_signed_in_memory() {
        let mut options = in_memory();
        options
            .maybe_default_with_self_signed_certs(
                "localhost",
                &[],
                &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
            )
            .unwrap();
        assert!(options.generated_cert.is_some());
        assert!(options.cert_file.is_none());
    }

    #[test]
    fn test_self_signed_written_to_cert_dir_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = SecureServingOptions {
            cert_dir: dir.path().to_string_lossy().into_owned(),
            ..SecureServingOptions::new()
        };
        options.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();

        let cert_path = dir.path().join("apiserver.crt");
        assert_eq!(options.cert_file.as_deref(), Some(cert_path.as_path()));
        let first = std::fs::read_to_string(&cert_path).unwrap();

        let mut again = SecureServingOptions {
            cert_dir: dir.path().to_string_lossy().into_owned(),
            ..SecureServingOptions::new()
        };
        again.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), first);
    }

    #[test]
    fn test_self_signed_skipped_when_disabled_or_configured() {
        let mut disabled = SecureServingOptions {
            bind_port: 0,
            ..in_memory()
        };
        disabled.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();
        assert!(disabled.generated_cert.is_none());

        let mut configured = SecureServingOptions {
            cert_file: Some(PathBuf::from("tls.crt")),
            key_file: Some(PathBuf::from("tls.key")),
            ..in_memory()
        };
        configured.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();
        assert!(configured.generated_cert.is_none());
    }

    #[test]
    fn test_apply_with_loopback() {
        let mut options = in_memory();
        options.bind_port = 6443;
        options.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();

        let mut serving = None;
        let mut loopback = None;
        options.apply_to(&mut serving, &mut loopback).unwrap();

        let serving = serving.unwrap();
        assert_eq!(serving.listen_addr, "0.0.0.0:6443".parse().unwrap());
        assert!(!serving.cert.cert_pem.is_empty());
        assert_eq!(serving.sni_certs.len(), 1);
        assert_eq!(serving.sni_certs[0].names, vec![LOOPBACK_SERVER_NAME.to_string()]);

        let loopback = loopback.unwrap();
        assert_eq!(loopback.host, "https://127.0.0.1:6443");
        assert_eq!(loopback.server_name, LOOPBACK_SERVER_NAME);
        assert_eq!(loopback.bearer_token.len(), 32);
        assert_eq!(loopback.ca_pem, serving.sni_certs[0].pair.cert_pem);
    }

    #[test]
    fn test_apply_without_loopback_leaves_loopback_slot() {
        let mut options = SecureServingOptions {
            cert_dir: String::new(),
            ..SecureServingOptions::new()
        };
        options.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();

        let mut serving = None;
        let mut loopback = None;
        options.apply_to(&mut serving, &mut loopback).unwrap();
        assert!(serving.unwrap().sni_certs.is_empty());
        assert!(loopback.is_none());
    }

    #[test]
    fn test_apply_disabled() {
        let options = SecureServingOptions {
            bind_port: 0,
            ..in_memory()
        };
        let mut serving = None;
        let mut loopback = None;
        options.apply_to(&mut serving, &mut loopback).unwrap();
        assert!(serving.is_none());
        assert!(loopback.is_none());
    }

    #[test]
    fn test_apply_without_certificate() {
        let options = in_memory();
        let mut serving = None;
        let mut loopback = None;
        assert!(matches!(
            options.apply_to(&mut serving, &mut loopback),
            Err(ServingError::MissingCertificate)
        ));
        assert!(serving.is_none());
    }

    #[test]
    fn test_apply_missing_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = SecureServingOptions {
            cert_file: Some(dir.path().join("missing.crt")),
            key_file: Some(dir.path().join("missing.key")),
            ..SecureServingOptions::new()
        };
        let mut serving = None;
        let mut loopback = None;
        assert!(matches!(
            options.apply_to(&mut serving, &mut loopback),
            Err(ServingError::Certificate(_))
        ));
    }

    #[test]
    fn test_loopback_host_port_ipv6() {
        let mut options = in_memory();
        options.bind_address = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        options.maybe_default_with_self_signed_certs("localhost", &[], &[]).unwrap();

        let mut serving = None;
        let mut loopback = None;
        options.apply_to(&mut serving, &mut loopback).unwrap();
        assert_eq!(loopback.unwrap().host, "https://[::1]:443");
    }

    #[test]
    fn test_loopback_debug_redacts_token() {
        let pair = cert::generate_self_signed(LOOPBACK_SERVER_NAME, &[], &[]).unwrap();
        let config = LoopbackClientConfig::new("127.0.0.1:443".parse().unwrap(), &pair);
        assert!(!format!("{:?}", config).contains(&config.bearer_token));
    }
}
