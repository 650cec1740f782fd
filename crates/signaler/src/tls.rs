//! TLS identity for the signaler.
//!
//! The server keeps a self-signed Ed25519 key/certificate pair on disk as
//! PEM. Agents pin the certificate by its SHA-1 fingerprint through their
//! known-hosts file, so there is no chain to any CA; the certificate only
//! has to be stable.

use std::path::Path;
use std::sync::Arc;

use protocol::fingerprint::fingerprint;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Default certificate validity.
pub const DEFAULT_VALIDITY_DAYS: i64 = 180;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("could not mint certificate: {0}")]
    Mint(String),

    #[error("could not load identity: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse PEM material: {0}")]
    Pem(String),

    #[error("could not build TLS config: {0}")]
    Config(String),
}

/// A PEM-encoded key/certificate pair.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub key_pem: String,
    pub cert_pem: String,
}

impl TlsIdentity {
    /// Mints a fresh self-signed Ed25519 identity.
    pub fn mint(organization: &str, validity: Duration) -> Result<Self, TlsError> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
            .map_err(|err| TlsError::Mint(err.to_string()))?;

        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::OrganizationName, organization);
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + validity;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|err| TlsError::Mint(err.to_string()))?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }

    /// Loads the identity from disk, minting and persisting a new one if
    /// either file is missing.
    pub fn load_or_mint(
        cert_path: &Path,
        key_path: &Path,
        organization: &str,
    ) -> Result<Self, TlsError> {
        if cert_path.exists() && key_path.exists() {
            return Ok(Self {
                key_pem: std::fs::read_to_string(key_path)?,
                cert_pem: std::fs::read_to_string(cert_path)?,
            });
        }

        let identity = Self::mint(organization, Duration::days(DEFAULT_VALIDITY_DAYS))?;

        for (path, contents) in [(cert_path, &identity.cert_pem), (key_path, &identity.key_pem)] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }

        tracing::info!(cert = %cert_path.display(), "minted new TLS identity");
        Ok(identity)
    }

    /// The DER bytes of the leaf certificate.
    pub fn leaf_der(&self) -> Result<Vec<u8>, TlsError> {
        let mut reader = self.cert_pem.as_bytes();
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| TlsError::Pem("no certificate in PEM".to_string()))?
            .map_err(|err| TlsError::Pem(err.to_string()))?;
        Ok(cert.to_vec())
    }

    /// The SHA-1 fingerprint agents pin in their known-hosts files.
    pub fn fingerprint(&self) -> Result<String, TlsError> {
        Ok(fingerprint(&self.leaf_der()?))
    }

    /// Builds the rustls server configuration for this identity.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let mut cert_reader = self.cert_pem.as_bytes();
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| TlsError::Pem(err.to_string()))?;

        let mut key_reader = self.key_pem.as_bytes();
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|err| TlsError::Pem(err.to_string()))?
            .ok_or_else(|| TlsError::Pem("no private key in PEM".to_string()))?;

        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| TlsError::Config(err.to_string()))?;

        Ok(Arc::new(config))
    }
}
