//! # tapmesh protocol library
//!
//! Wire-level building blocks shared by the signaling server and the peer
//! agent:
//!
//! - **Envelopes**: the tagged JSON message set spoken over the signaling
//!   websocket (admission, introduction, exchange, discharge).
//! - **Addressing**: canonicalized IEEE-802 hardware addresses identifying
//!   community members.
//! - **Crypto**: AES-GCM sealing of exchange payloads and data-plane frames
//!   with the community pre-shared key.
//! - **Fingerprints**: the certificate fingerprint form shared by the
//!   signaler's startup banner and the agents' known-hosts files.
//!
//! The crate is a leaf: no async, no I/O, no dependency on the websocket or
//! WebRTC stacks. Everything here is exercised from both sides of the wire.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod mac;

pub use crypto::{CommunityKey, PayloadCipher, KEY_LENGTHS, NONCE_LENGTH, TAG_LENGTH};
pub use envelope::{Envelope, SessionPayload};
pub use error::{ProtocolError, Result};
pub use fingerprint::fingerprint;
pub use mac::{MacAddr, BROADCAST, MAC_LENGTH};
