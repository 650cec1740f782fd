//! Payload and frame encryption with the community pre-shared key.
//!
//! Exchange payloads (and, when configured, data-plane Ethernet frames) are
//! sealed with AES-GCM. The output layout is `nonce(12) || ciphertext ||
//! tag`, with a fresh random nonce per message. The key length selects the
//! cipher: 16, 24 or 32 bytes for AES-128/192/256.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};

/// AES-192-GCM; the aes-gcm crate only aliases the 128- and 256-bit forms.
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Nonce length prepended to every sealed message.
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag length appended by AES-GCM.
pub const TAG_LENGTH: usize = 16;

/// Key lengths accepted for a community key.
pub const KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// A community pre-shared key, validated to one of the accepted lengths.
#[derive(Clone)]
pub struct CommunityKey(Vec<u8>);

impl CommunityKey {
    /// Validates and wraps key material.
    ///
    /// Any length other than 16, 24 or 32 bytes is a configuration error
    /// and must be rejected before admission.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if !KEY_LENGTHS.contains(&bytes.len()) {
            return Err(ProtocolError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// The key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn seal_with(&self, nonce: &[u8; NONCE_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let sealed = match self.0.len() {
            16 => Aes128Gcm::new_from_slice(&self.0)
                .map_err(|e| ProtocolError::Encrypt(e.to_string()))?
                .encrypt(nonce, plaintext),
            24 => Aes192Gcm::new_from_slice(&self.0)
                .map_err(|e| ProtocolError::Encrypt(e.to_string()))?
                .encrypt(nonce, plaintext),
            _ => Aes256Gcm::new_from_slice(&self.0)
                .map_err(|e| ProtocolError::Encrypt(e.to_string()))?
                .encrypt(nonce, plaintext),
        };
        sealed.map_err(|e| ProtocolError::Encrypt(e.to_string()))
    }

    fn open_with(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let opened = match self.0.len() {
            16 => Aes128Gcm::new_from_slice(&self.0)
                .map_err(|e| ProtocolError::Decrypt(e.to_string()))?
                .decrypt(nonce, ciphertext),
            24 => Aes192Gcm::new_from_slice(&self.0)
                .map_err(|e| ProtocolError::Decrypt(e.to_string()))?
                .decrypt(nonce, ciphertext),
            _ => Aes256Gcm::new_from_slice(&self.0)
                .map_err(|e| ProtocolError::Decrypt(e.to_string()))?
                .decrypt(nonce, ciphertext),
        };
        opened.map_err(|e| ProtocolError::Decrypt(e.to_string()))
    }
}

impl std::fmt::Debug for CommunityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunityKey")
            .field("len", &self.0.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Seals and opens opaque payloads.
///
/// Without a key this is a passthrough: the payload fields carry raw
/// plaintext SDP or candidate lines.
#[derive(Debug, Clone, Default)]
pub struct PayloadCipher {
    key: Option<CommunityKey>,
}

impl PayloadCipher {
    /// A cipher that passes payloads through unchanged.
    pub fn plaintext() -> Self {
        Self { key: None }
    }

    /// A cipher sealing with the given community key.
    pub fn sealing(key: CommunityKey) -> Self {
        Self { key: Some(key) }
    }

    /// Builds a cipher from raw key bytes; empty means "no encryption".
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::plaintext());
        }
        Ok(Self::sealing(CommunityKey::new(bytes)?))
    }

    /// Whether payloads are actually sealed.
    pub fn is_sealing(&self) -> bool {
        self.key.is_some()
    }

    /// Seals a payload: `nonce || ciphertext || tag`, or passthrough.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };

        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let sealed = key.seal_with(&nonce, plaintext)?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Opens a sealed payload, or passthrough.
    ///
    /// Fails on truncated input, a wrong key, or a failed authentication
    /// tag.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(data.to_vec());
        };

        if data.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(ProtocolError::Decrypt(format!(
                "sealed payload too short: {} bytes",
                data.len()
            )));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
        key.open_with(nonce, ciphertext)
    }
}
