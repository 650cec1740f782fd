//! Error types for the agent crate.

use protocol::{MacAddr, ProtocolError};
use thiserror::Error;

/// Agent error type.
///
/// Peer-session failures are local and never carried here past the session
/// they concern; errors of this type ending the signaling client are what
/// the supervisor reacts to.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration; refused before any side effect.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The server refused the application. Terminal: the supervisor must
    /// not retry a rejected admission.
    #[error("admission to community \"{0}\" rejected")]
    Rejected(String),

    /// Websocket read, write or ping failure.
    #[error("signaling transport failed: {0}")]
    Transport(String),

    /// A peer-connection primitive failed during negotiation.
    #[error("negotiation with {mac} failed: {message}")]
    Negotiation { mac: MacAddr, message: String },

    /// A second session was requested for a peer that already has one.
    #[error("a session with {0} already exists")]
    SessionExists(MacAddr),

    /// An operation referenced a peer without a session.
    #[error("no session with {0}")]
    UnknownSession(MacAddr),

    /// A unicast write found the session but no open data channel.
    #[error("no open data channel to {0}")]
    ChannelUnavailable(MacAddr),

    /// Tap device I/O failure.
    #[error("tap device failed: {0}")]
    Device(String),

    /// The signaling server's certificate is not pinned in the known-hosts
    /// file, or does not match the pinned fingerprint.
    #[error("signaling server not trusted: {0}")]
    Untrusted(String),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Terminal errors must not be retried by the supervisor.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentError::Rejected(_) | AgentError::Untrusted(_) | AgentError::Config(_)
        )
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Device(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_terminal() {
        assert!(AgentError::Rejected("c1".to_string()).is_terminal());
        assert!(AgentError::Untrusted("unknown host".to_string()).is_terminal());
        assert!(!AgentError::Transport("reset".to_string()).is_terminal());
    }

    #[test]
    fn test_display() {
        let mac: MacAddr = "02:00:00:00:00:0a".parse().unwrap();
        assert_eq!(
            AgentError::UnknownSession(mac).to_string(),
            "no session with 02:00:00:00:00:0a"
        );
    }
}
