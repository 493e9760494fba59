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

//! TLS material: self-signed certificate generation and PEM loading.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

/// Validity of generated certificates.
const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Errors produced while generating or loading TLS material.
#[derive(Error, Debug)]
pub enum CertError {
    #[error("failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("{0:?} is not a valid DNS name")]
    InvalidDnsName(String),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PEM data in {path:?}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::PemError,
    },

    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
}

/// Result type for certificate operations.
pub type Result<T> = std::result::Result<T, CertError>;

/// A PEM encoded certificate chain and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    /// PEM encoded certificate chain.
    pub cert_pem: String,
    /// PEM encoded private key.
    pub key_pem: String,
}

impl fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertKeyPair")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// A PEM bundle of one or more CA certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaBundle {
    /// File the bundle was loaded from.
    pub path: PathBuf,
    /// PEM encoded certificates.
    pub pem: String,
    /// Number of certificates in the bundle.
    pub certificates: usize,
}

/// Generates a self-signed serving certificate for `host`.
///
/// The certificate carries DNS SANs for `host` and `alternate_dns` and IP
/// SANs for `alternate_ips`. A host that parses as an IP address becomes an
/// IP SAN.
pub fn generate_self_signed(
    host: &str,
    alternate_ips: &[IpAddr],
    alternate_dns: &[String],
) -> Result<CertKeyPair> {
    let now = time::OffsetDateTime::now_utc();

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(format!("{}@{}", host, now.unix_timestamp())),
    );
    params.distinguished_name = dn;
    params.not_before = now;
    params.not_after = now + time::Duration::days(SELF_SIGNED_VALIDITY_DAYS);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut sans = Vec::new();
    match host.parse::<IpAddr>() {
        Ok(ip) => sans.push(SanType::IpAddress(ip)),
        Err(_) => sans.push(dns_san(host)?),
    }
    for ip in alternate_ips {
        let san = SanType::IpAddress(*ip);
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    for name in alternate_dns {
        let san = dns_san(name)?;
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    params.subject_alt_names = sans;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn dns_san(name: &str) -> Result<SanType> {
    Ia5String::try_from(name)
        .map(SanType::DnsName)
        .map_err(|_| CertError::InvalidDnsName(name.to_string()))
}

/// Returns true if both files exist and can be read.
pub fn can_read_cert_and_key(cert_path: &Path, key_path: &Path) -> bool {
    fs::File::open(cert_path).is_ok() && fs::File::open(key_path).is_ok()
}

/// Writes `pair` to `cert_path` and `key_path`, creating parent directories.
pub fn write_cert_and_key(pair: &CertKeyPair, cert_path: &Path, key_path: &Path) -> Result<()> {
    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| CertError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }
    fs::write(cert_path, &pair.cert_pem).map_err(|source| CertError::Io {
        path: cert_path.to_path_buf(),
        source,
    })?;
    fs::write(key_path, &pair.key_pem).map_err(|source| CertError::Io {
        path: key_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Loads and checks a certificate / private key file pair.
pub fn load_cert_and_key(cert_path: &Path, key_path: &Path) -> Result<CertKeyPair> {
    let cert_pem = read_to_string(cert_path)?;
    let key_pem = read_to_string(key_path)?;
    let pair = CertKeyPair { cert_pem, key_pem };
    check_cert_and_key(&pair, cert_path, key_path)?;
    Ok(pair)
}

/// Checks that `pair` holds at least one certificate and a private key.
///
/// The paths are only used for error reporting.
pub fn check_cert_and_key(pair: &CertKeyPair, cert_path: &Path, key_path: &Path) -> Result<()> {
    count_certificates(&pair.cert_pem, cert_path)?;

    let blocks = pem::parse_many(pair.key_pem.as_bytes()).map_err(|source| CertError::Pem {
        path: key_path.to_path_buf(),
        source,
    })?;
    if !blocks.iter().any(|b| b.tag().ends_with("PRIVATE KEY")) {
        return Err(CertError::NoPrivateKey(key_path.to_path_buf()));
    }
    Ok(())
}

/// Loads a CA bundle, requiring at least one certificate.
pub fn load_ca_bundle(path: &Path) -> Result<CaBundle> {
    let pem = read_to_string(path)?;
    let certificates = count_certificates(&pem, path)?;
    Ok(CaBundle {
        path: path.to_path_buf(),
        pem,
        certificates,
    })
}

fn count_certificates(data: &str, path: &Path) -> Result<usize> {
    let blocks = pem::parse_many(data.as_bytes()).map_err(|source| CertError::Pem {
        path: path.to_path_buf(),
        source,
    })?;
    let count = blocks.iter().filter(|b| b.tag() == "CERTIFICATE").count();
    if count == 0 {
        return Err(CertError::NoCertificates(path.to_path_buf()));
    }
    Ok(count)
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use x509_parser::prelude::*;

    fn san_entries(cert_pem: &str) -> (Vec<String>, Vec<Vec<u8>>) {
        let der = ::pem::parse(cert_pem.as_bytes()).unwrap().into_contents();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        let mut dns = Vec::new();
        let mut ips = Vec::new();
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(n) => dns.push(n.to_string()),
                GeneralName::IPAddress(ip) => ips.push(ip.to_vec()),
                _ => {}
            }
        }
        (dns, ips)
    }

    #[test]
    fn test_generate_self_signed_sans() {
        let pair = generate_self_signed(
            "localhost",
            &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
            &["metrics.local".to_string()],
        )
        .unwrap();

        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("PRIVATE KEY"));

        let (dns, ips) = san_entries(&pair.cert_pem);
        assert_eq!(dns, vec!["localhost".to_string(), "metrics.local".to_string()]);
        assert_eq!(ips, vec![vec![127, 0, 0, 1]]);
    }

    #[test]
    fn test_generate_self_signed_validity() {
        let pair = generate_self_signed("localhost", &[], &[]).unwrap();
        let der = ::pem::parse(pair.cert_pem.as_bytes()).unwrap().into_contents();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        let days = (cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp())
            / (24 * 60 * 60);
        assert_eq!(days, SELF_SIGNED_VALIDITY_DAYS);

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap()
            .to_string();
        assert!(cn.starts_with("localhost@"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let pair = CertKeyPair {
            cert_pem: "cert".to_string(),
            key_pem: "secret-key".to_string(),
        };
        let debug = format!("{:?}", pair);
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("nested/apiserver.crt");
        let key_path = dir.path().join("nested/apiserver.key");

        assert!(!can_read_cert_and_key(&cert_path, &key_path));

        let pair = generate_self_signed("localhost", &[], &[]).unwrap();
        write_cert_and_key(&pair, &cert_path, &key_path).unwrap();

        assert!(can_read_cert_and_key(&cert_path, &key_path));
        assert_eq!(load_cert_and_key(&cert_path, &key_path).unwrap(), pair);
    }

    #[test]
    fn test_load_rejects_key_without_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_self_signed("localhost", &[], &[]).unwrap();
        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        fs::write(&cert_path, &pair.cert_pem).unwrap();
        fs::write(&key_path, &pair.cert_pem).unwrap();

        assert!(matches!(
            load_cert_and_key(&cert_path, &key_path),
            Err(CertError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn test_load_ca_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let first = generate_self_signed("ca-one", &[], &[]).unwrap();
        let second = generate_self_signed("ca-two", &[], &[]).unwrap();
        let path = dir.path().join("ca.crt");
        fs::write(&path, format!("{}{}", first.cert_pem, second.cert_pem)).unwrap();

        let bundle = load_ca_bundle(&path).unwrap();
        assert_eq!(bundle.certificates, 2);

        let empty = dir.path().join("empty.crt");
        fs::write(&empty, "").unwrap();
        assert!(matches!(load_ca_bundle(&empty), Err(CertError::NoCertificates(_))));

        assert!(matches!(
            load_ca_bundle(&dir.path().join("missing.crt")),
            Err(CertError::Io { .. })
        ));
    }
}
