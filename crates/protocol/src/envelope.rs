//! Wire envelopes exchanged over the signaling websocket.
//!
//! Every envelope is a UTF-8 JSON text frame carrying a `type` tag plus the
//! variant's fields. The `payload` field of the exchange variants is opaque
//! to the codec; it is carried as a base64 string on the wire (the JSON byte
//! convention this implementation commits to) and sealed with the community
//! key by the layers above.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::mac::MacAddr;

/// A signaling message, discriminated by the JSON `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Request to join a community under a hardware address.
    Application { community: String, mac: MacAddr },
    /// The application was admitted.
    Acceptance,
    /// The application was refused.
    Rejection,
    /// The member is ready to be introduced to the others.
    Ready,
    /// An existing member is told about a newly ready member.
    Introduction { mac: MacAddr },
    /// SDP offer, routed peer-to-peer through the server.
    Offer {
        mac: MacAddr,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// SDP answer, routed peer-to-peer through the server.
    Answer {
        mac: MacAddr,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// ICE candidate, routed peer-to-peer through the server.
    Candidate {
        mac: MacAddr,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// Orderly departure announcement from a member.
    Exited,
    /// Remaining members are told that a member has left.
    Resignation { mac: MacAddr },
}

impl Envelope {
    /// Encodes this envelope as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from a JSON text frame.
    ///
    /// An unknown `type` tag or a missing field is a protocol error.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// The wire name of this envelope's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Application { .. } => "application",
            Envelope::Acceptance => "acceptance",
            Envelope::Rejection => "rejection",
            Envelope::Ready => "ready",
            Envelope::Introduction { .. } => "introduction",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Candidate { .. } => "candidate",
            Envelope::Exited => "exited",
            Envelope::Resignation { .. } => "resignation",
        }
    }

    /// Returns true for the exchange variants (`offer`, `answer`,
    /// `candidate`) whose payloads are sealed with the community key.
    pub fn is_exchange(&self) -> bool {
        matches!(
            self,
            Envelope::Offer { .. } | Envelope::Answer { .. } | Envelope::Candidate { .. }
        )
    }
}

/// Serde support for payload bytes as base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Decoded contents of an `offer` or `answer` payload: the session
/// description as the peers serialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub kind: String,
    /// The SDP body.
    pub sdp: String,
}

impl ProtocolError {
    /// Convenience constructor for handlers that reject an envelope by tag.
    pub fn unexpected(kind: &str) -> Self {
        ProtocolError::Envelope(format!("unexpected message type \"{kind}\""))
    }
}
