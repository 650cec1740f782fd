//! The overlay orchestrator.
//!
//! Wires the tap device, the peer manager and the signaling client
//! together around one central event dispatcher, and supervises the
//! signaling session: a transport failure tears the session down and a new
//! one is started after a bounded backoff, while admission rejection and
//! trust failures are terminal.

use std::sync::Arc;
use std::time::Duration;

use protocol::{MacAddr, PayloadCipher};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::known_hosts::{KnownHosts, PinPolicy, PinnedServerVerifier};
use crate::peers::{PeerEvent, PeerManager};
use crate::signaling::{SignalingClient, SignalingConfig, SignalingEvent, SignalingHandle};
use crate::tap::{destination, FrameDevice, ETHERNET_HEADER_LENGTH};

/// Upper bound of the random slack added to the reconnect backoff.
const BACKOFF_JITTER: Duration = Duration::from_secs(5);

/// Depth of the event and outbound channels between the components.
const CHANNEL_BUFFER: usize = 256;

/// One host's membership in one community.
pub struct Overlay {
    config: AgentConfig,
    mac: MacAddr,
    cipher: PayloadCipher,
    device: Arc<dyn FrameDevice>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("config", &self.config)
            .field("mac", &self.mac)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl Overlay {
    /// Validates the configuration and builds the overlay. No side
    /// effects yet; the signaler is dialed by [`run`](Overlay::run).
    pub fn new(config: AgentConfig, device: Arc<dyn FrameDevice>) -> Result<Self> {
        config.validate()?;
        let mac = config.mac()?;
        let cipher = PayloadCipher::from_key_bytes(config.network.key.as_bytes())?;

        if !cipher.is_sealing() {
            tracing::warn!(
                "no community key configured; frames cross the overlay without the additional AES layer"
            );
        }

        Ok(Self {
            config,
            mac,
            cipher,
            device,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelling this overlay; cancellation drives the graceful
    /// shutdown path (peers first, then the signaling client).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs signaling sessions until shutdown or a terminal error,
    /// restarting failed sessions after the configured timeout plus
    /// jitter.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_session().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }

                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER.as_millis() as u64));
                    let backoff = self.config.timeout() + jitter;
                    tracing::warn!(%err, ?backoff, "signaling session failed, reconnecting");

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    /// One signaling session: connect, join, dispatch events until the
    /// client ends.
    async fn run_session(&self) -> Result<()> {
        let ws = connect_signaler(&self.config).await?;
        tracing::info!(
            signaler = %self.config.network.signaler_url,
            community = %self.config.network.community,
            mac = %self.mac,
            "connected to signaler"
        );

        let (peer_tx, mut peer_events) = mpsc::channel(CHANNEL_BUFFER);
        let peers = Arc::new(PeerManager::new(
            self.config.network.ice_servers.clone(),
            peer_tx,
        )?);

        let (signaling_tx, mut signaling_events) = mpsc::channel(CHANNEL_BUFFER);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_BUFFER);
        let handle = SignalingHandle::new(outgoing_tx, self.cipher.clone());

        let client = SignalingClient::new(
            SignalingConfig {
                mac: self.mac,
                community: self.config.network.community.clone(),
                timeout: self.config.timeout(),
            },
            self.cipher.clone(),
        );

        // The client gets a session-local token, not the overlay's: on
        // shutdown the peer sessions must be closed before the client
        // announces the departure and closes the websocket.
        let client_shutdown = CancellationToken::new();
        let client_token = client_shutdown.clone();
        let mut client_task = tokio::spawn(async move {
            client.run(ws, signaling_tx, outgoing_rx, client_token).await
        });

        let tap_device = Arc::clone(&self.device);
        let tap_peers = Arc::clone(&peers);
        let tap_cipher = self.cipher.clone();
        let mut tap_task =
            tokio::spawn(async move { tap_read_loop(tap_device, tap_peers, tap_cipher).await });

        let mut shutting_down = false;
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled(), if !shutting_down => {
                    shutting_down = true;
                    if let Err(err) = peers.close().await {
                        tracing::warn!(%err, "could not close all peer sessions");
                    }
                    client_shutdown.cancel();
                }
                joined = &mut client_task => {
                    break match joined {
                        Ok(result) => result,
                        Err(err) => Err(AgentError::Transport(format!("signaling task failed: {err}"))),
                    };
                }
                joined = &mut tap_task => {
                    break match joined {
                        Ok(Ok(())) => Err(AgentError::Device("tap loop ended".to_string())),
                        Ok(Err(err)) => Err(err),
                        Err(err) => Err(AgentError::Device(format!("tap task failed: {err}"))),
                    };
                }
                // Once shutdown has closed the peer sessions, buffered
                // server events must not re-create any.
                Some(event) = signaling_events.recv(), if !shutting_down => {
                    self.dispatch_signaling(event, &peers).await;
                }
                Some(event) = peer_events.recv() => {
                    if let Err(err) = self.dispatch_peer(event, &handle).await {
                        break Err(err);
                    }
                }
            }
        };

        client_task.abort();
        tap_task.abort();

        if let Err(err) = peers.close().await {
            tracing::warn!(%err, "could not close all peer sessions");
        }

        result
    }

    /// Routes server-sent events into the peer manager. A peer session
    /// failure is local; it never fails the agent.
    async fn dispatch_signaling(&self, event: SignalingEvent, peers: &PeerManager) {
        match event {
            SignalingEvent::Introduction { mac } => {
                if let Err(err) = peers.handle_introduction(mac).await {
                    tracing::warn!(%mac, %err, "could not react to introduction");
                }
            }
            SignalingEvent::Offer { mac, sdp } => {
                if let Err(err) = peers.handle_offer(mac, sdp).await {
                    tracing::warn!(%mac, %err, "could not react to offer");
                }
            }
            SignalingEvent::Answer { mac, sdp } => {
                if let Err(err) = peers.handle_answer(mac, sdp).await {
                    tracing::warn!(%mac, %err, "could not react to answer");
                }
            }
            SignalingEvent::Candidate { mac, candidate } => {
                if let Err(err) = peers.handle_candidate(mac, candidate).await {
                    tracing::warn!(%mac, %err, "could not apply candidate");
                }
            }
            SignalingEvent::Resignation { mac, blocked } => {
                if blocked {
                    tracing::warn!(%mac, "blocked peer with a mismatched community key");
                } else {
                    tracing::info!(%mac, "peer resigned");
                }
                if let Err(err) = peers.handle_resignation(mac).await {
                    tracing::warn!(%mac, %err, "could not close resigned session");
                }
            }
        }
    }

    /// Routes peer-manager events: negotiation artifacts to the signaler,
    /// frames to the tap. Only a tap write failure is fatal.
    async fn dispatch_peer(&self, event: PeerEvent, handle: &SignalingHandle) -> Result<()> {
        match event {
            PeerEvent::Offer { mac, sdp } | PeerEvent::Answer { mac, sdp } => {
                if let Err(err) = handle.signal_description(mac, &sdp).await {
                    tracing::warn!(%mac, %err, "could not signal description");
                }
            }
            PeerEvent::Candidate { mac, candidate } => {
                if let Err(err) = handle.signal_candidate(mac, &candidate).await {
                    tracing::warn!(%mac, %err, "could not signal candidate");
                }
            }
            PeerEvent::ChannelOpen { mac } => {
                tracing::info!(%mac, "connected to peer");
            }
            PeerEvent::ChannelClosed { mac } => {
                tracing::info!(%mac, "disconnected from peer");
            }
            PeerEvent::Frame { mac, data } => match self.cipher.open(&data) {
                Ok(frame) => {
                    self.device.write_frame(&frame).await?;
                }
                Err(err) => {
                    // Data-plane corruption is tolerated frame by frame.
                    tracing::debug!(%mac, %err, "dropping frame that does not open");
                }
            },
        }

        Ok(())
    }
}

/// Pumps frames from the tap into the peer manager.
async fn tap_read_loop(
    device: Arc<dyn FrameDevice>,
    peers: Arc<PeerManager>,
    cipher: PayloadCipher,
) -> Result<()> {
    let mut buf = vec![0u8; device.mtu() + ETHERNET_HEADER_LENGTH];

    loop {
        let n = device.read_frame(&mut buf).await?;
        let frame = &buf[..n];

        let dst = match destination(frame) {
            Ok(dst) => dst,
            Err(err) => {
                tracing::debug!(%err, "skipping frame without a destination");
                continue;
            }
        };

        let sealed = cipher.seal(frame)?;
        if let Err(err) = peers.write(dst, &sealed).await {
            tracing::debug!(%dst, %err, "could not write to peer, continuing");
        }
    }
}

/// Dials the signaler, enforcing the known-hosts pin policy for `wss`.
async fn connect_signaler(
    config: &AgentConfig,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let url = Url::parse(&config.network.signaler_url)
        .map_err(|err| AgentError::Transport(format!("invalid signaler URL: {err}")))?;

    match url.scheme() {
        "ws" => {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| AgentError::Transport(err.to_string()))?;
            Ok(ws)
        }
        "wss" => connect_tls(config, &url).await,
        other => Err(AgentError::Transport(format!(
            "unsupported signaler scheme \"{other}\""
        ))),
    }
}

async fn connect_tls(
    config: &AgentConfig,
    url: &Url,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let host = url
        .host_str()
        .ok_or_else(|| AgentError::Transport("signaler URL has no host".to_string()))?;
    let port = url.port_or_known_default().unwrap_or(443);
    let address = format!("{host}:{port}");

    let hosts = KnownHosts::new(&config.security.known_hosts);
    hosts
        .create_if_missing()
        .map_err(|err| AgentError::Transport(err.to_string()))?;

    let policy = if config.security.insecure {
        tracing::warn!("certificate verification disabled");
        PinPolicy::AcceptAny
    } else {
        match hosts
            .lookup(&address)
            .map_err(|err| AgentError::Transport(err.to_string()))?
        {
            Some(pinned) => PinPolicy::Pinned(pinned),
            None if config.security.accept_new => PinPolicy::TrustOnFirstUse,
            None => {
                return Err(AgentError::Untrusted(format!(
                    "no fingerprint for {address} in {}; enable accept_new or pin it manually",
                    hosts.path().display()
                )))
            }
        }
    };

    let verifier = PinnedServerVerifier::new(policy.clone());
    let connector = Connector::Rustls(Arc::new(verifier.client_config()));

    match connect_async_tls_with_config(url.as_str(), None, false, Some(connector)).await {
        Ok((ws, _)) => {
            if matches!(policy, PinPolicy::TrustOnFirstUse) {
                if let Some(seen) = verifier.seen_fingerprint() {
                    hosts
                        .pin(&address, &seen)
                        .map_err(|err| AgentError::Transport(err.to_string()))?;
                    tracing::info!(%address, fingerprint = %seen, "pinned new signaler");
                }
            }
            Ok(ws)
        }
        Err(err) => {
            // Distinguish a changed certificate from a flaky network: the
            // former must not be retried into.
            if let PinPolicy::Pinned(expected) = &policy {
                if let Some(seen) = verifier.seen_fingerprint() {
                    if seen != *expected {
                        return Err(AgentError::Untrusted(format!(
                            "certificate for {address} changed: presented {seen}, pinned {expected}"
                        )));
                    }
                }
            }
            Err(AgentError::Transport(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::MemoryDevice;

    fn device() -> Arc<dyn FrameDevice> {
        let (a, _b) = MemoryDevice::pair(
            1500,
            "02:00:00:00:00:0a".parse().unwrap(),
            "02:00:00:00:00:0b".parse().unwrap(),
        );
        Arc::new(a)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = AgentConfig::default();
        config.network.key = "short".to_string();

        let err = Overlay::new(config, device()).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_new_accepts_default_config() {
        assert!(Overlay::new(AgentConfig::default(), device()).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_wss_host_is_untrusted() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AgentConfig::default();
        config.network.signaler_url = "wss://127.0.0.1:1".to_string();
        config.security.known_hosts = dir.path().join("known_hosts");
        config.security.accept_new = false;

        let err = connect_signaler(&config).await.unwrap_err();
        assert!(matches!(err, AgentError::Untrusted(_)));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_refused() {
        let mut config = AgentConfig::default();
        // connect checks the scheme itself, before any validation pass.
        config.network.signaler_url = "https://example.org".to_string();

        let err = connect_signaler(&config).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
