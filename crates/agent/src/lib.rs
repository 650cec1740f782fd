//! # tapmesh agent
//!
//! The peer side of a tapmesh overlay. The agent joins a community through
//! the signaling server, negotiates one WebRTC data channel per remote
//! member, and bridges the local tap interface onto those channels:
//! Ethernet frames written to the tap are delivered unmodified to the
//! member(s) their destination address names, and frames received from
//! peers are injected back into the tap.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                       Overlay                         │
//! │                                                       │
//! │  tap ──frames──▶ PeerManager ◀──events──┐             │
//! │   ▲                  │                  │             │
//! │   └──────frames──────┘           SignalingClient ─ ws │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`signaling`]: the websocket client and its event stream
//! - [`peers`]: per-remote peer sessions and data channels
//! - [`tap`]: the frame-device seam and the Linux tap adapter
//! - [`known_hosts`]: certificate pinning for the signaler
//! - [`config`]: TOML configuration and validation
//! - [`overlay`]: the orchestrator and supervisor

pub mod config;
pub mod error;
pub mod known_hosts;
pub mod overlay;
pub mod peers;
pub mod signaling;
pub mod tap;

pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, Result};
pub use known_hosts::KnownHosts;
pub use overlay::Overlay;
pub use peers::{PeerEvent, PeerManager, SessionState, DATA_CHANNEL_LABEL};
pub use signaling::{SignalingClient, SignalingConfig, SignalingEvent, SignalingHandle};
pub use tap::{FrameDevice, MemoryDevice, ETHERNET_HEADER_LENGTH};
