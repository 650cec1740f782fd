//! The signaling websocket server.
//!
//! Each accepted connection runs a reader loop (the admission state machine)
//! plus a spawned writer task that drains the connection's outbound channel.
//! All registry work happens in the reader loop; the writer only serializes
//! envelopes, answers the keep-alive timer, and performs the close
//! handshake. Every write runs under a deadline equal to the configured
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Envelope, MacAddr, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::registry::{
    CloseStatus, CommunityRegistry, Dispatch, MemberHandle, Outbound, RegistryError,
};

/// Default interval between keep-alive pings, which is also the deadline
/// applied to every websocket write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum close-reason length the websocket close frame may carry.
pub const MAX_CLOSE_REASON_BYTES: usize = 122;

/// Depth of a connection's outbound channel. Registry operations enqueue
/// here without blocking on the network.
const OUTBOUND_BUFFER: usize = 64;

/// The community name reserved as invalid on the wire.
const INVALID_COMMUNITY: &str = "-1";

/// Errors ending a connection's loop. The display form becomes the close
/// reason (truncated) and the `exited` cause.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("already applied")]
    DuplicateApplication,

    #[error("invalid community \"{0}\"")]
    InvalidCommunity(String),
}

/// Truncates a close reason to the wire limit, respecting UTF-8 boundaries.
///
/// This is the single truncation point; everything that closes a transport
/// goes through the writer task, which calls this.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn close_code(status: CloseStatus) -> CloseCode {
    match status {
        CloseStatus::Normal => CloseCode::Normal,
        CloseStatus::Protocol => CloseCode::Protocol,
        CloseStatus::GoingAway => CloseCode::Away,
    }
}

/// Where a connection is in the admission state machine.
enum Admission {
    /// Nothing but an `application` is legal yet.
    Pending,
    /// Admitted into a community under a hardware address.
    Admitted { community: String, mac: MacAddr },
}

/// The signaling server: accepts control-plane connections and runs the
/// per-connection loops against a shared [`CommunityRegistry`].
pub struct SignalingServer {
    registry: Arc<CommunityRegistry>,
    timeout: Duration,
}

impl SignalingServer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Arc::new(CommunityRegistry::new()),
            timeout,
        }
    }

    /// The registry backing this server.
    pub fn registry(&self) -> Arc<CommunityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` fires, then closes every
    /// member's transport with Going-Away and drops the registry state.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutting down, resigning all members");
                    emit(self.registry.shutdown()).await;
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted
                        .map_err(|err| ServerError::Transport(err.to_string()))?;
                    next_id += 1;
                    let conn = next_id;

                    tracing::debug!(conn, %peer_addr, "connection accepted");

                    let server = Arc::clone(&self);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.accept_connection(stream, tls, conn).await {
                            tracing::debug!(conn, %err, "handshake failed");
                        }
                    });
                }
            }
        }
    }

    async fn accept_connection(
        self: Arc<Self>,
        stream: TcpStream,
        tls: Option<TlsAcceptor>,
        conn: u64,
    ) -> Result<(), ServerError> {
        match tls {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| ServerError::Transport(err.to_string()))?;
                let ws = tokio_tungstenite::accept_async(stream)
                    .await
                    .map_err(|err| ServerError::Transport(err.to_string()))?;
                self.serve(ws, conn).await;
            }
            None => {
                let ws = tokio_tungstenite::accept_async(stream)
                    .await
                    .map_err(|err| ServerError::Transport(err.to_string()))?;
                self.serve(ws, conn).await;
            }
        }
        Ok(())
    }

    /// Runs one connection to completion, including its exit bookkeeping.
    async fn serve<S>(&self, ws: WebSocketStream<S>, conn: u64)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = MemberHandle::new(tx);

        let writer = tokio::spawn(write_loop(sink, rx, self.timeout));

        let mut admission = Admission::Pending;
        let result = self.read_loop(&mut stream, &handle, &mut admission, conn).await;

        match (&admission, result) {
            (Admission::Admitted { .. }, Ok(())) => {
                // Clean departure: the exited handler already queued the
                // resignations and the Normal close.
                tracing::debug!(conn, "member departed");
            }
            (Admission::Admitted { community, mac }, Err(err)) => {
                tracing::warn!(conn, %community, %mac, %err, "connection failed");
                match self.registry.exited(community, *mac, Some(&err.to_string())) {
                    Ok(dispatches) => emit(dispatches).await,
                    // Already removed, e.g. a clean exit racing the error
                    // path; just close the transport.
                    Err(_) => {
                        handle
                            .deliver(Outbound::Close {
                                status: CloseStatus::Protocol,
                                reason: err.to_string(),
                            })
                            .await;
                    }
                }
            }
            (Admission::Pending, Ok(())) => {}
            (Admission::Pending, Err(err)) => {
                // The connection never completed an application, so the
                // registry was never touched; close directly.
                tracing::debug!(conn, %err, "connection rejected before admission");
                handle
                    .deliver(Outbound::Close {
                        status: CloseStatus::Protocol,
                        reason: err.to_string(),
                    })
                    .await;
            }
        }

        drop(handle);
        let _ = writer.await;
    }

    async fn read_loop<S>(
        &self,
        stream: &mut SplitStream<WebSocketStream<S>>,
        handle: &MemberHandle,
        admission: &mut Admission,
        conn: u64,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut keepalive = tokio::time::interval(self.timeout);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if !handle.deliver(Outbound::Ping).await {
                        return Err(ServerError::Transport("keep-alive ping failed".to_string()));
                    }
                }
                message = stream.next() => {
                    let message = match message {
                        None => return Err(ServerError::Transport("connection closed".to_string())),
                        Some(Err(err)) => return Err(ServerError::Transport(err.to_string())),
                        Some(Ok(message)) => message,
                    };

                    match message {
                        Message::Text(text) => {
                            let envelope = Envelope::from_json(&text)?;
                            if self.handle_envelope(envelope, handle, admission, conn).await? {
                                return Ok(());
                            }
                        }
                        Message::Binary(_) => {
                            return Err(ProtocolError::Envelope(
                                "binary frames are not part of the protocol".to_string(),
                            )
                            .into());
                        }
                        Message::Close(_) => {
                            return Err(ServerError::Transport(
                                "closed by peer without exiting".to_string(),
                            ));
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Dispatches one inbound envelope. Returns true when the connection
    /// finished cleanly (`exited`).
    async fn handle_envelope(
        &self,
        envelope: Envelope,
        handle: &MemberHandle,
        admission: &mut Admission,
        conn: u64,
    ) -> Result<bool, ServerError> {
        match admission {
            Admission::Pending => match envelope {
                Envelope::Application { community, mac } => {
                    if community.is_empty() || community == INVALID_COMMUNITY {
                        handle.deliver(Outbound::Envelope(Envelope::Rejection)).await;
                        return Err(ServerError::InvalidCommunity(community));
                    }

                    if let Err(err) = self.registry.apply(&community, mac, handle.clone()) {
                        // Best-effort rejection before the Protocol close.
                        handle.deliver(Outbound::Envelope(Envelope::Rejection)).await;
                        return Err(err.into());
                    }

                    if !handle.deliver(Outbound::Envelope(Envelope::Acceptance)).await {
                        return Err(ServerError::Transport("acceptance send failed".to_string()));
                    }

                    tracing::info!(conn, %community, %mac, "member applied");
                    *admission = Admission::Admitted { community, mac };
                    Ok(false)
                }
                other => Err(ProtocolError::unexpected(other.kind()).into()),
            },

            Admission::Admitted { community, mac } => match envelope {
                Envelope::Application { .. } => {
                    handle.deliver(Outbound::Envelope(Envelope::Rejection)).await;
                    Err(ServerError::DuplicateApplication)
                }
                Envelope::Ready => {
                    emit(self.registry.ready(community, *mac)?).await;
                    Ok(false)
                }
                envelope @ (Envelope::Offer { .. }
                | Envelope::Answer { .. }
                | Envelope::Candidate { .. }) => {
                    let dispatch = self.registry.exchange(community, *mac, envelope)?;
                    dispatch.handle.deliver(dispatch.outbound).await;
                    Ok(false)
                }
                Envelope::Exited => {
                    emit(self.registry.exited(community, *mac, None)?).await;
                    tracing::info!(conn, %community, %mac, "member exited");
                    Ok(true)
                }
                other => Err(ProtocolError::unexpected(other.kind()).into()),
            },
        }
    }
}

/// Emits computed dispatches; failures mean the target's writer is already
/// gone and its own loop will clean up.
async fn emit(dispatches: Vec<Dispatch>) {
    for dispatch in dispatches {
        dispatch.handle.deliver(dispatch.outbound).await;
    }
}

/// Drains a connection's outbound channel into the websocket sink.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    deadline: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Envelope(envelope) => match envelope.to_json() {
                Ok(json) => send_with_deadline(&mut sink, Message::Text(json), deadline).await,
                Err(err) => {
                    tracing::error!(%err, "could not encode envelope");
                    continue;
                }
            },
            Outbound::Ping => {
                send_with_deadline(&mut sink, Message::Ping(Vec::new()), deadline).await
            }
            Outbound::Close { status, reason } => {
                let frame = CloseFrame {
                    code: close_code(status),
                    reason: truncate_reason(&reason).to_string().into(),
                };
                let _ = send_with_deadline(&mut sink, Message::Close(Some(frame)), deadline).await;
                break;
            }
        };

        if let Err(err) = result {
            tracing::debug!(%err, "transport write failed");
            break;
        }
    }
}

async fn send_with_deadline<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    deadline: Duration,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ServerError::Transport(err.to_string())),
        Err(_) => Err(ServerError::Transport("send deadline exceeded".to_string())),
    }
}
