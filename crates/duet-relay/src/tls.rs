//! TLS for the relay
//!
//! Serves HTTPS/WSS either from operator-supplied PEM files or from a
//! self-signed certificate persisted under the user's config directory. The
//! certificate fingerprint is logged so devices can pin it.

use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Duration, Utc};
use duet_core::{Error, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CERT_VALIDITY_DAYS: i64 = 365;

/// Regenerate when fewer days than this remain
const CERT_RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// PEM material and fingerprint of the served certificate
#[derive(Clone)]
pub struct ServerCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
}

impl std::fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCertificate")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl ServerCertificate {
    /// Load a certificate and key from PEM files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Ok(Self {
            fingerprint: cert_fingerprint(&cert_pem),
            cert_pem,
            key_pem,
        })
    }

    /// Build the rustls configuration for axum-server
    pub async fn rustls_config(&self) -> Result<RustlsConfig> {
        RustlsConfig::from_pem(
            self.cert_pem.as_bytes().to_vec(),
            self.key_pem.as_bytes().to_vec(),
        )
        .await
        .map_err(Error::from)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CertMetadata {
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    fingerprint: String,
    hostnames: Vec<String>,
}

/// Persistent self-signed certificate store
pub struct CertificateManager {
    dir: PathBuf,
}

impl CertificateManager {
    /// Use `<config dir>/duet`
    pub fn new() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::internal("Could not determine config directory"))?
            .join("duet");
        Self::with_dir(dir)
    }

    pub fn with_dir(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join("relay.crt")
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join("relay.key")
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join("cert_meta.json")
    }

    /// Load the stored certificate, regenerating it when missing, expiring
    /// or issued for different hostnames
    pub fn load_or_generate(&self, hostnames: &[String]) -> Result<ServerCertificate> {
        if self.cert_path().exists() && self.key_path().exists() {
            if let Some(meta) = self.load_metadata() {
                if is_reusable(&meta, hostnames, Utc::now()) {
                    info!("Loading existing certificate (expires {})", meta.expires_at);
                    let mut cert =
                        ServerCertificate::from_files(&self.cert_path(), &self.key_path())?;
                    cert.fingerprint = meta.fingerprint;
                    return Ok(cert);
                }
                info!("Certificate needs regeneration");
            }
        }

        info!("Generating new self-signed certificate...");
        let cert = generate_self_signed_cert(hostnames)?;
        std::fs::write(self.cert_path(), &cert.cert_pem)?;
        std::fs::write(self.key_path(), &cert.key_pem)?;

        let now = Utc::now();
        let meta = CertMetadata {
            created_at: now,
            expires_at: now + Duration::days(CERT_VALIDITY_DAYS),
            fingerprint: cert.fingerprint.clone(),
            hostnames: hostnames.to_vec(),
        };
        std::fs::write(self.metadata_path(), serde_json::to_string_pretty(&meta)?)?;

        info!("Certificate saved to {:?}", self.cert_path());
        Ok(cert)
    }

    fn load_metadata(&self) -> Option<CertMetadata> {
        let contents = std::fs::read_to_string(self.metadata_path()).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

fn is_reusable(meta: &CertMetadata, hostnames: &[String], now: DateTime<Utc>) -> bool {
    if meta.expires_at - now < Duration::days(CERT_RENEWAL_THRESHOLD_DAYS) {
        debug!("Certificate expiring soon");
        return false;
    }

    let mut current = hostnames.to_vec();
    let mut stored = meta.hostnames.clone();
    current.sort();
    stored.sort();
    if current != stored {
        debug!("Hostnames changed");
        return false;
    }
    true
}

/// Generate a self-signed certificate valid for localhost and `hostnames`
pub fn generate_self_signed_cert(hostnames: &[String]) -> Result<ServerCertificate> {
    let tls_err =
        |e: rcgen::Error| Error::internal(format!("Certificate generation failed: {}", e));

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Duet Relay");
    dn.push(DnType::OrganizationName, "Duet");
    params.distinguished_name = dn;

    let mut sans = vec![
        SanType::DnsName("localhost".try_into().map_err(tls_err)?),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    for host in hostnames {
        if let Ok(ip) = host.parse::<IpAddr>() {
            sans.push(SanType::IpAddress(ip));
        } else if let Ok(dns) = host.as_str().try_into() {
            sans.push(SanType::DnsName(dns));
        }
    }
    params.subject_alt_names = sans;

    let key_pair = KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;
    let cert_pem = cert.pem();

    Ok(ServerCertificate {
        fingerprint: cert_fingerprint(&cert_pem),
        cert_pem,
        key_pem: key_pair.serialize_pem(),
    })
}

/// Colon-separated SHA-256 fingerprint of a PEM certificate
pub fn cert_fingerprint(cert_pem: &str) -> String {
    Sha256::digest(cert_pem.as_bytes())
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cert_generation() {
        let cert = generate_self_signed_cert(&["relay.local".to_string()]).unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("BEGIN PRIVATE KEY"));
        assert_eq!(cert.fingerprint, cert_fingerprint(&cert.cert_pem));
        assert!(!format!("{:?}", cert).contains("PRIVATE"));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = cert_fingerprint("-----BEGIN CERTIFICATE-----\nx\n-----END CERTIFICATE-----");
        assert_eq!(fp.len(), 95);
        assert_eq!(fp.split(':').count(), 32);
    }

    #[test]
    fn test_manager_reuses_certificate() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::with_dir(dir.path().to_path_buf()).unwrap();
        let hosts = vec!["192.168.1.20".to_string()];

        let first = manager.load_or_generate(&hosts).unwrap();
        let second = manager.load_or_generate(&hosts).unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.fingerprint, second.fingerprint);

        let third = manager
            .load_or_generate(&["10.0.0.7".to_string()])
            .unwrap();
        assert_ne!(first.fingerprint, third.fingerprint);
    }

    #[test]
    fn test_from_files() {
        let dir = tempdir().unwrap();
        let cert = generate_self_signed_cert(&[]).unwrap();
        let cert_path = dir.path().join("c.pem");
        let key_path = dir.path().join("k.pem");
        std::fs::write(&cert_path, &cert.cert_pem).unwrap();
        std::fs::write(&key_path, &cert.key_pem).unwrap();

        let loaded = ServerCertificate::from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.fingerprint, cert.fingerprint);
    }
}
