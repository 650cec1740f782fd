//! The signaling client.
//!
//! Three cooperating activities over one websocket: the application
//! activity (apply, await acceptance, announce readiness), the receive
//! activity (decrypt-then-dispatch into a single event stream), and the
//! keep-alive activity. Any activity's failure ends the client; the
//! overlay's supervisor re-runs it after a bounded backoff. Every send runs
//! under a deadline equal to the configured timeout.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{Envelope, MacAddr, PayloadCipher, ProtocolError, SessionPayload};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{AgentError, Result};

/// Default keep-alive interval and send deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Events dispatched from the signaling connection to the overlay.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The server introduced a newly ready member.
    Introduction { mac: MacAddr },
    /// A remote peer's offer, decrypted and parsed.
    Offer {
        mac: MacAddr,
        sdp: RTCSessionDescription,
    },
    /// A remote peer's answer, decrypted and parsed.
    Answer {
        mac: MacAddr,
        sdp: RTCSessionDescription,
    },
    /// A remote peer's ICE candidate line, decrypted.
    Candidate { mac: MacAddr, candidate: String },
    /// A peer left. With `blocked`, the peer presented payloads our community
    /// key cannot open and is being dropped locally.
    Resignation { mac: MacAddr, blocked: bool },
}

/// Configuration of one signaling session.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Our hardware address.
    pub mac: MacAddr,
    /// The community to join.
    pub community: String,
    /// Keep-alive interval and per-send deadline.
    pub timeout: Duration,
}

/// Sender half handed to the overlay: seals payloads and enqueues
/// envelopes for the client's writer.
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    tx: mpsc::Sender<Envelope>,
    cipher: PayloadCipher,
}

impl SignalingHandle {
    pub fn new(tx: mpsc::Sender<Envelope>, cipher: PayloadCipher) -> Self {
        Self { tx, cipher }
    }

    /// Signals a local session description to a remote peer.
    pub async fn signal_description(
        &self,
        mac: MacAddr,
        sdp: &RTCSessionDescription,
    ) -> Result<()> {
        let payload = SessionPayload {
            kind: sdp.sdp_type.to_string(),
            sdp: sdp.sdp.clone(),
        };
        let serialized =
            serde_json::to_vec(&payload).map_err(|err| ProtocolError::Envelope(err.to_string()))?;
        let sealed = self.cipher.seal(&serialized)?;

        let envelope = match payload.kind.as_str() {
            "offer" => Envelope::Offer {
                mac,
                payload: sealed,
            },
            _ => Envelope::Answer {
                mac,
                payload: sealed,
            },
        };
        self.enqueue(envelope).await
    }

    /// Signals a local ICE candidate line to a remote peer.
    pub async fn signal_candidate(&self, mac: MacAddr, candidate: &str) -> Result<()> {
        let sealed = self.cipher.seal(candidate.as_bytes())?;
        self.enqueue(Envelope::Candidate {
            mac,
            payload: sealed,
        })
        .await
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| AgentError::Transport("signaling writer is gone".to_string()))
    }
}

/// The signaling client proper. Owns the websocket for the duration of one
/// [`run`](SignalingClient::run).
pub struct SignalingClient {
    config: SignalingConfig,
    cipher: PayloadCipher,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig, cipher: PayloadCipher) -> Self {
        Self { config, cipher }
    }

    /// Runs the client over an established connection until a failure, a
    /// rejection, or shutdown.
    ///
    /// Incoming envelopes are dispatched on `events`; the overlay's
    /// outbound envelopes arrive on `outgoing` (see [`SignalingHandle`]).
    /// On shutdown the client announces `exited` and closes the socket
    /// with Going-Away.
    pub async fn run<S>(
        &self,
        ws: WebSocketStream<S>,
        events: mpsc::Sender<SignalingEvent>,
        mut outgoing: mpsc::Receiver<Envelope>,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let deadline = self.config.timeout;
        let mut admitted = false;

        send_with_deadline(
            &mut sink,
            Message::Text(
                Envelope::Application {
                    community: self.config.community.clone(),
                    mac: self.config.mac,
                }
                .to_json()?,
            ),
            deadline,
        )
        .await?;

        let mut keepalive = tokio::time::interval(self.config.timeout);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if admitted {
                        let _ = send_with_deadline(
                            &mut sink,
                            Message::Text(Envelope::Exited.to_json()?),
                            deadline,
                        )
                        .await;
                    }
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: "shutting down".into(),
                    };
                    let _ = send_with_deadline(&mut sink, Message::Close(Some(frame)), deadline)
                        .await;
                    return Ok(());
                }
                _ = keepalive.tick() => {
                    send_with_deadline(&mut sink, Message::Ping(Vec::new()), deadline).await?;
                }
                Some(envelope) = outgoing.recv() => {
                    send_with_deadline(&mut sink, Message::Text(envelope.to_json()?), deadline)
                        .await?;
                }
                message = stream.next() => {
                    let message = match message {
                        None => {
                            return Err(AgentError::Transport("connection closed".to_string()))
                        }
                        Some(Err(err)) => return Err(AgentError::Transport(err.to_string())),
                        Some(Ok(message)) => message,
                    };

                    match message {
                        Message::Text(text) => {
                            let envelope = Envelope::from_json(&text)?;
                            if let Some(ready) = self
                                .handle_envelope(envelope, &events, &mut admitted)
                                .await?
                            {
                                send_with_deadline(
                                    &mut sink,
                                    Message::Text(ready.to_json()?),
                                    deadline,
                                )
                                .await?;
                            }
                        }
                        Message::Close(frame) => {
                            return Err(AgentError::Transport(match frame {
                                Some(frame) => format!("closed by server: {}", frame.reason),
                                None => "closed by server".to_string(),
                            }));
                        }
                        Message::Binary(_) => {
                            return Err(ProtocolError::Envelope(
                                "binary frames are not part of the protocol".to_string(),
                            )
                            .into());
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Dispatches one server-sent envelope. Returns the `ready`
    /// announcement when acceptance arrives.
    async fn handle_envelope(
        &self,
        envelope: Envelope,
        events: &mpsc::Sender<SignalingEvent>,
        admitted: &mut bool,
    ) -> Result<Option<Envelope>> {
        match envelope {
            Envelope::Acceptance => {
                if *admitted {
                    return Err(ProtocolError::unexpected("acceptance").into());
                }
                *admitted = true;
                tracing::info!(community = %self.config.community, "admitted, announcing ready");
                Ok(Some(Envelope::Ready))
            }
            Envelope::Rejection => Err(AgentError::Rejected(self.config.community.clone())),
            Envelope::Introduction { mac } => {
                self.emit(events, SignalingEvent::Introduction { mac }).await;
                Ok(None)
            }
            Envelope::Offer { mac, payload } => {
                if let Some(payload) = self.open_exchange(events, mac, &payload).await {
                    let session = parse_session_payload(&payload)?;
                    self.emit(events, SignalingEvent::Offer { mac, sdp: session })
                        .await;
                }
                Ok(None)
            }
            Envelope::Answer { mac, payload } => {
                if let Some(payload) = self.open_exchange(events, mac, &payload).await {
                    let session = parse_session_payload(&payload)?;
                    self.emit(events, SignalingEvent::Answer { mac, sdp: session })
                        .await;
                }
                Ok(None)
            }
            Envelope::Candidate { mac, payload } => {
                if let Some(payload) = self.open_exchange(events, mac, &payload).await {
                    let candidate = String::from_utf8(payload).map_err(|err| {
                        ProtocolError::Envelope(format!("candidate is not UTF-8: {err}"))
                    })?;
                    self.emit(events, SignalingEvent::Candidate { mac, candidate })
                        .await;
                }
                Ok(None)
            }
            Envelope::Resignation { mac } => {
                self.emit(events, SignalingEvent::Resignation { mac, blocked: false })
                    .await;
                Ok(None)
            }
            other => Err(ProtocolError::unexpected(other.kind()).into()),
        }
    }

    /// Opens an exchange payload. A failure here means the sender's
    /// community key differs from ours: that peer is blocked, and the
    /// client carries on.
    async fn open_exchange(
        &self,
        events: &mpsc::Sender<SignalingEvent>,
        mac: MacAddr,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        match self.cipher.open(payload) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::warn!(%mac, %err, "blocked peer: payload does not open with our community key");
                self.emit(events, SignalingEvent::Resignation { mac, blocked: true })
                    .await;
                None
            }
        }
    }

    async fn emit(&self, events: &mpsc::Sender<SignalingEvent>, event: SignalingEvent) {
        if events.send(event).await.is_err() {
            tracing::warn!("signaling event receiver is gone");
        }
    }
}

/// Parses a decrypted `offer`/`answer` payload into a session description.
fn parse_session_payload(payload: &[u8]) -> Result<RTCSessionDescription> {
    let session: SessionPayload = serde_json::from_slice(payload)
        .map_err(|err| ProtocolError::Envelope(format!("invalid session payload: {err}")))?;

    let description = match session.kind.as_str() {
        "offer" => RTCSessionDescription::offer(session.sdp),
        "answer" => RTCSessionDescription::answer(session.sdp),
        other => {
            return Err(
                ProtocolError::Envelope(format!("unknown description type \"{other}\"")).into(),
            )
        }
    };

    description.map_err(|err| {
        ProtocolError::Envelope(format!("session description does not parse: {err}")).into()
    })
}

async fn send_with_deadline<S>(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    deadline: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AgentError::Transport(err.to_string())),
        Err(_) => Err(AgentError::Transport("send deadline exceeded".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::PayloadCipher;

    fn mac(last: u8) -> MacAddr {
        MacAddr::from_bytes([0x02, 0, 0, 0, 0, last])
    }

    fn sealing_cipher() -> PayloadCipher {
        PayloadCipher::from_key_bytes(b"0123456789abcdef").unwrap()
    }

    const SDP: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

    #[tokio::test]
    async fn test_handle_seals_descriptions() {
        let (tx, mut rx) = mpsc::channel(4);
        let cipher = sealing_cipher();
        let handle = SignalingHandle::new(tx, cipher.clone());

        let offer = RTCSessionDescription::offer(SDP.to_string()).unwrap();
        handle.signal_description(mac(1), &offer).await.unwrap();

        match rx.recv().await.unwrap() {
            Envelope::Offer { mac: m, payload } => {
                assert_eq!(m, mac(1));
                // Sealed: the raw payload must not be readable…
                assert!(serde_json::from_slice::<SessionPayload>(&payload).is_err());
                // …but must open with the same key.
                let opened = cipher.open(&payload).unwrap();
                let session: SessionPayload = serde_json::from_slice(&opened).unwrap();
                assert_eq!(session.kind, "offer");
                assert_eq!(session.sdp, SDP);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_answer_envelope_kind() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = SignalingHandle::new(tx, PayloadCipher::plaintext());

        let answer = RTCSessionDescription::answer(SDP.to_string()).unwrap();
        handle.signal_description(mac(2), &answer).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), Envelope::Answer { .. }));
    }

    #[tokio::test]
    async fn test_handle_seals_candidates() {
        let (tx, mut rx) = mpsc::channel(4);
        let cipher = sealing_cipher();
        let handle = SignalingHandle::new(tx, cipher.clone());

        handle
            .signal_candidate(mac(3), "candidate:1 1 udp 1 127.0.0.1 1 typ host")
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Envelope::Candidate { payload, .. } => {
                let opened = cipher.open(&payload).unwrap();
                assert_eq!(opened, b"candidate:1 1 udp 1 127.0.0.1 1 typ host");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_parse_session_payload() {
        let payload = serde_json::to_vec(&SessionPayload {
            kind: "offer".to_string(),
            sdp: "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n".to_string(),
        })
        .unwrap();

        let description = parse_session_payload(&payload).unwrap();
        assert!(description.sdp.contains("v=0"));
    }

    #[test]
    fn test_parse_session_payload_rejects_unknown_kind() {
        let payload = serde_json::to_vec(&SessionPayload {
            kind: "pranswer".to_string(),
            sdp: SDP.to_string(),
        })
        .unwrap();

        assert!(parse_session_payload(&payload).is_err());
    }

    #[test]
    fn test_parse_session_payload_rejects_garbage() {
        assert!(parse_session_payload(b"not json").is_err());
    }
}
