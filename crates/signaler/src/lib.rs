//! # tapmesh signaler
//!
//! The signaling server that brokers tapmesh overlays. It groups peers into
//! named communities, introduces new members to existing ones, routes
//! offer/answer/candidate exchanges between them, and announces departures.
//! It never sees user traffic, and once a community key is set it never
//! sees plaintext session descriptions either.
//!
//! ## Modules
//!
//! - [`registry`]: the community membership table and its four operations
//! - [`server`]: the websocket accept loop and per-connection state machine
//! - [`tls`]: the self-minted Ed25519 certificate identity

pub mod registry;
pub mod server;
pub mod tls;

pub use registry::{
    CloseStatus, CommunityRegistry, Dispatch, MemberHandle, Outbound, RegistryError,
};
pub use server::{ServerError, SignalingServer, DEFAULT_TIMEOUT, MAX_CLOSE_REASON_BYTES};
pub use tls::{TlsError, TlsIdentity};
