//! Known-hosts pinning for the signaling server's certificate.
//!
//! The file maps one signaler per line, `<remote-address>
//! <sha1-fingerprint>`. The agent accepts exactly the pinned certificate
//! for a known address; unknown addresses are pinned automatically only
//! when the operator opted into trust-on-first-use, and a mismatch always
//! fails. There is no interactive prompt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use protocol::fingerprint::fingerprint;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnownHostsError {
    #[error("could not access known-hosts file: {0}")]
    Io(#[from] std::io::Error),

    #[error("syntax error in known-hosts file at line {line}")]
    Syntax { line: usize },
}

/// The known-hosts file.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the default location under the user's config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tapmesh")
            .join("known_hosts")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the file (and leading directories) if it does not exist.
    pub fn create_if_missing(&self) -> Result<(), KnownHostsError> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, "")?;
        Ok(())
    }

    /// Looks up the pinned fingerprint for a signaler address.
    pub fn lookup(&self, address: &str) -> Result<Option<String>, KnownHostsError> {
        let contents = std::fs::read_to_string(&self.path)?;

        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (candidate, pinned) = match (parts.next(), parts.next()) {
                (Some(address), Some(fingerprint)) => (address, fingerprint),
                _ => return Err(KnownHostsError::Syntax { line: index + 1 }),
            };

            if candidate == address {
                return Ok(Some(pinned.to_string()));
            }
        }

        Ok(None)
    }

    /// Appends a pin for a signaler address.
    pub fn pin(&self, address: &str, fingerprint: &str) -> Result<(), KnownHostsError> {
        self.create_if_missing()?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{address} {fingerprint}")?;
        Ok(())
    }
}

/// How the verifier judges the presented certificate.
#[derive(Debug, Clone)]
pub enum PinPolicy {
    /// Accept exactly this fingerprint.
    Pinned(String),
    /// Accept whatever is presented and record it for pinning.
    TrustOnFirstUse,
    /// Accept anything, verify nothing. Operator's explicit choice.
    AcceptAny,
}

/// Certificate verifier comparing the presented leaf's SHA-1 fingerprint
/// against the pinned one instead of walking a chain.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    policy: PinPolicy,
    seen: Mutex<Option<String>>,
}

impl PinnedServerVerifier {
    pub fn new(policy: PinPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            seen: Mutex::new(None),
        })
    }

    /// The fingerprint presented during the last handshake, for
    /// trust-on-first-use pinning.
    pub fn seen_fingerprint(&self) -> Option<String> {
        self.seen.lock().unwrap().clone()
    }

    /// Builds a rustls client configuration around this verifier.
    pub fn client_config(self: &Arc<Self>) -> rustls::ClientConfig {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(self) as Arc<dyn ServerCertVerifier>)
            .with_no_client_auth()
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint(end_entity.as_ref());
        *self.seen.lock().unwrap() = Some(presented.clone());

        match &self.policy {
            PinPolicy::Pinned(expected) if *expected == presented => {
                Ok(ServerCertVerified::assertion())
            }
            PinPolicy::Pinned(expected) => Err(rustls::Error::General(format!(
                "certificate fingerprint {presented} does not match pinned {expected}"
            ))),
            PinPolicy::TrustOnFirstUse | PinPolicy::AcceptAny => {
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
