//! Per-remote peer sessions and their data channels.
//!
//! One session exists per remote member at most. The session table is
//! guarded by a single mutex because signaling callbacks, data-channel
//! callbacks and `write` callers all touch it; handles are cloned out of
//! the lock before any call into the webrtc crate so that re-entrant
//! callbacks cannot deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use protocol::MacAddr;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{AgentError, Result};

/// The one payload channel per peer.
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Where a session is in its lifecycle. A closed session is simply absent
/// from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created on introduction; our offer is out.
    CreatedOfferer,
    /// Created on an incoming offer; our answer is out.
    CreatedAnswerer,
    /// Both descriptions are set.
    Negotiated,
    /// The data channel is open.
    Open,
}

/// Events emitted by the peer manager, consumed by the overlay dispatcher.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local offer is ready for the remote peer.
    Offer {
        mac: MacAddr,
        sdp: RTCSessionDescription,
    },
    /// A local answer is ready for the remote peer.
    Answer {
        mac: MacAddr,
        sdp: RTCSessionDescription,
    },
    /// A local ICE candidate is ready for the remote peer. End-of-candidate
    /// sentinels are filtered out before this point.
    Candidate { mac: MacAddr, candidate: String },
    /// The data channel to a peer opened.
    ChannelOpen { mac: MacAddr },
    /// The data channel to a peer closed; the session is already torn down.
    ChannelClosed { mac: MacAddr },
    /// A frame arrived on a peer's data channel.
    Frame { mac: MacAddr, data: Vec<u8> },
}

struct PeerSession {
    connection: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
    /// Candidates received before the remote description was set, applied
    /// in arrival order once it is.
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_set: bool,
    state: SessionState,
}

type SessionTable = Arc<Mutex<HashMap<MacAddr, PeerSession>>>;

/// Manages one peer session per remote member of the community.
pub struct PeerManager {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    sessions: SessionTable,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerManager {
    /// Creates a manager with the configured ICE servers.
    pub fn new(ice_servers: Vec<String>, events: mpsc::Sender<PeerEvent>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| AgentError::Device(format!("could not register codecs: {err}")))?;

        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|err| AgentError::Device(format!("could not register interceptors: {err}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = vec![RTCIceServer {
            urls: ice_servers,
            ..Default::default()
        }];

        Ok(Self {
            api,
            ice_servers,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    /// Reacts to an introduction: create the peer connection and the data
    /// channel, then send an offer.
    ///
    /// The channel callbacks are registered before the offer is generated
    /// so no open event can be missed.
    pub async fn handle_introduction(&self, mac: MacAddr) -> Result<()> {
        let connection = self.create_session(mac, SessionState::CreatedOfferer).await?;

        let channel = match connection.create_data_channel(DATA_CHANNEL_LABEL, None).await {
            Ok(channel) => channel,
            Err(err) => return self.fail_session(mac, err).await,
        };
        attach_channel_callbacks(&self.sessions, &self.events, mac, &channel);

        let offer = match connection.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => return self.fail_session(mac, err).await,
        };
        if let Err(err) = connection.set_local_description(offer.clone()).await {
            return self.fail_session(mac, err).await;
        }

        let _ = self.events.send(PeerEvent::Offer { mac, sdp: offer }).await;
        Ok(())
    }

    /// Reacts to a remote offer: create the peer connection, subscribe to
    /// the remote-created data channel, and send an answer.
    pub async fn handle_offer(&self, mac: MacAddr, offer: RTCSessionDescription) -> Result<()> {
        let connection = self
            .create_session(mac, SessionState::CreatedAnswerer)
            .await?;

        let sessions = Arc::clone(&self.sessions);
        let events = self.events.clone();
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            attach_channel_callbacks(&sessions, &events, mac, &channel);
            Box::pin(async {})
        }));

        if let Err(err) = connection.set_remote_description(offer).await {
            return self.fail_session(mac, err).await;
        }
        self.mark_remote_set(mac).await;

        let answer = match connection.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => return self.fail_session(mac, err).await,
        };
        if let Err(err) = connection.set_local_description(answer.clone()).await {
            return self.fail_session(mac, err).await;
        }

        let _ = self.events.send(PeerEvent::Answer { mac, sdp: answer }).await;
        Ok(())
    }

    /// Applies a remote candidate, or queues it while the remote
    /// description is still unset. Applying early is a bug: some stacks
    /// accept it, some reject it.
    pub async fn handle_candidate(&self, mac: MacAddr, candidate: String) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate,
            ..Default::default()
        };

        let connection = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&mac)
                .ok_or(AgentError::UnknownSession(mac))?;

            if !session.remote_set {
                session.pending_candidates.push(init);
                return Ok(());
            }
            Arc::clone(&session.connection)
        };

        connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| AgentError::Negotiation {
                mac,
                message: err.to_string(),
            })
    }

    /// Applies a remote answer, then drains the candidate queue in arrival
    /// order.
    pub async fn handle_answer(&self, mac: MacAddr, answer: RTCSessionDescription) -> Result<()> {
        let (connection, queued) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&mac)
                .ok_or(AgentError::UnknownSession(mac))?;

            session.remote_set = true;
            if session.state == SessionState::CreatedOfferer {
                session.state = SessionState::Negotiated;
            }
            (
                Arc::clone(&session.connection),
                std::mem::take(&mut session.pending_candidates),
            )
        };

        if let Err(err) = connection.set_remote_description(answer).await {
            return self.fail_session(mac, err).await;
        }

        for candidate in queued {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                return self.fail_session(mac, err).await;
            }
        }

        Ok(())
    }

    /// Closes and forgets the session. Idempotent: racing the data-channel
    /// close callback or a duplicate resignation is fine.
    pub async fn handle_resignation(&self, mac: MacAddr) -> Result<()> {
        let session = { self.sessions.lock().await.remove(&mac) };
        let Some(session) = session else {
            return Ok(());
        };

        tracing::debug!(%mac, "closing peer session");
        session
            .connection
            .close()
            .await
            .map_err(|err| AgentError::Negotiation {
                mac,
                message: err.to_string(),
            })
    }

    /// Sends a frame to `dst`, or to every open data channel for the
    /// broadcast address.
    ///
    /// A send error means the channel is gone: the peer is resigned
    /// silently and the write still reports success (best-effort datagram
    /// semantics). A unicast write without an open channel is an error.
    pub async fn write(&self, dst: MacAddr, frame: &[u8]) -> Result<()> {
        let targets: Vec<(MacAddr, Arc<RTCDataChannel>)> = {
            let sessions = self.sessions.lock().await;
            if dst.is_broadcast() {
                sessions
                    .iter()
                    .filter_map(|(mac, session)| {
                        session.channel.clone().map(|channel| (*mac, channel))
                    })
                    .collect()
            } else {
                let session = sessions.get(&dst).ok_or(AgentError::UnknownSession(dst))?;
                let channel = session
                    .channel
                    .clone()
                    .ok_or(AgentError::ChannelUnavailable(dst))?;
                vec![(dst, channel)]
            }
        };

        let data = Bytes::copy_from_slice(frame);
        for (mac, channel) in targets {
            if let Err(err) = channel.send(&data).await {
                tracing::debug!(%mac, %err, "data channel send failed, resigning peer");
                let _ = self.handle_resignation(mac).await;
            }
        }

        Ok(())
    }

    /// Resigns every session, reporting the first error after attempting
    /// them all.
    pub async fn close(&self) -> Result<()> {
        let members: Vec<MacAddr> = { self.sessions.lock().await.keys().copied().collect() };

        let mut first_error = None;
        for mac in members {
            if let Err(err) = self.handle_resignation(mac).await {
                tracing::warn!(%mac, %err, "could not close peer session");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Current number of sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The state of a session, if one exists.
    pub async fn session_state(&self, mac: MacAddr) -> Option<SessionState> {
        self.sessions.lock().await.get(&mac).map(|s| s.state)
    }

    /// Number of queued early candidates for a session.
    pub async fn pending_candidates(&self, mac: MacAddr) -> Option<usize> {
        self.sessions
            .lock()
            .await
            .get(&mac)
            .map(|s| s.pending_candidates.len())
    }

    /// Creates the peer connection and registers the candidate callback.
    async fn create_session(
        &self,
        mac: MacAddr,
        state: SessionState,
    ) -> Result<Arc<RTCPeerConnection>> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&mac) {
            return Err(AgentError::SessionExists(mac));
        }

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await.map_err(|err| {
            AgentError::Negotiation {
                mac,
                message: err.to_string(),
            }
        })?);

        let events = self.events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                // A null candidate is the end-of-candidates sentinel.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events
                            .send(PeerEvent::Candidate {
                                mac,
                                candidate: init.candidate,
                            })
                            .await;
                    }
                    Err(err) => {
                        tracing::warn!(%mac, %err, "could not serialize local candidate");
                    }
                }
            })
        }));

        sessions.insert(
            mac,
            PeerSession {
                connection: Arc::clone(&connection),
                channel: None,
                pending_candidates: Vec::new(),
                remote_set: false,
                state,
            },
        );

        Ok(connection)
    }

    async fn mark_remote_set(&self, mac: MacAddr) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&mac) {
            session.remote_set = true;
            session.state = SessionState::Negotiated;
        }
    }

    /// Tears the session down after a failed negotiation primitive and
    /// reports the failure.
    async fn fail_session(&self, mac: MacAddr, err: webrtc::Error) -> Result<()> {
        let _ = self.handle_resignation(mac).await;
        Err(AgentError::Negotiation {
            mac,
            message: err.to_string(),
        })
    }
}

/// Registers open/close/message callbacks on a data channel, for both the
/// locally created channel (offerer) and the remote-created one (answerer).
fn attach_channel_callbacks(
    sessions: &SessionTable,
    events: &mpsc::Sender<PeerEvent>,
    mac: MacAddr,
    channel: &Arc<RTCDataChannel>,
) {
    let open_sessions = Arc::clone(sessions);
    let open_events = events.clone();
    let open_channel = Arc::clone(channel);
    channel.on_open(Box::new(move || {
        let sessions = Arc::clone(&open_sessions);
        let events = open_events.clone();
        let channel = Arc::clone(&open_channel);
        Box::pin(async move {
            {
                let mut sessions = sessions.lock().await;
                if let Some(session) = sessions.get_mut(&mac) {
                    session.channel = Some(channel);
                    session.state = SessionState::Open;
                }
            }
            let _ = events.send(PeerEvent::ChannelOpen { mac }).await;
        })
    }));

    // Channel close races explicit resignation; removal is idempotent.
    let close_sessions = Arc::clone(sessions);
    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let sessions = Arc::clone(&close_sessions);
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::ChannelClosed { mac }).await;
            let session = { sessions.lock().await.remove(&mac) };
            if let Some(session) = session {
                let _ = session.connection.close().await;
            }
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let _ = events
                .send(PeerEvent::Frame {
                    mac,
                    data: message.data.to_vec(),
                })
                .await;
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUN: &str = "stun:stun.l.google.com:19302";

    fn mac(last: u8) -> MacAddr {
        MacAddr::from_bytes([0x02, 0, 0, 0, 0, last])
    }

    fn manager() -> (PeerManager, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (PeerManager::new(vec![STUN.to_string()], tx).unwrap(), rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("event channel closed")
    }

    /// Waits for the next negotiation event, skipping interleaved
    /// candidate gathering.
    async fn next_negotiation_event(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        loop {
            match next_event(rx).await {
                PeerEvent::Candidate { .. } => continue,
                event => return event,
            }
        }
    }

    #[tokio::test]
    async fn test_introduction_creates_offerer_session() {
        let (peers, mut events) = manager();

        peers.handle_introduction(mac(1)).await.unwrap();

        match next_negotiation_event(&mut events).await {
            PeerEvent::Offer { mac: m, sdp } => {
                assert_eq!(m, mac(1));
                assert!(sdp.sdp.contains("v=0"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            peers.session_state(mac(1)).await,
            Some(SessionState::CreatedOfferer)
        );
    }

    #[tokio::test]
    async fn test_second_session_to_same_peer_is_refused() {
        let (peers, _events) = manager();

        peers.handle_introduction(mac(1)).await.unwrap();
        let err = peers.handle_introduction(mac(1)).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionExists(m) if m == mac(1)));
        assert_eq!(peers.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_offer_creates_answerer_session() {
        let (offerer, mut offerer_events) = manager();
        let (answerer, mut answerer_events) = manager();

        offerer.handle_introduction(mac(2)).await.unwrap();
        let offer = match next_negotiation_event(&mut offerer_events).await {
            PeerEvent::Offer { sdp, .. } => sdp,
            other => panic!("unexpected event: {other:?}"),
        };

        answerer.handle_offer(mac(1), offer).await.unwrap();
        match next_negotiation_event(&mut answerer_events).await {
            PeerEvent::Answer { mac: m, sdp } => {
                assert_eq!(m, mac(1));
                assert!(sdp.sdp.contains("v=0"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            answerer.session_state(mac(1)).await,
            Some(SessionState::Negotiated)
        );
    }

    #[tokio::test]
    async fn test_candidates_queue_until_answer_then_drain_in_order() {
        let (offerer, mut offerer_events) = manager();
        let (answerer, mut answerer_events) = manager();

        offerer.handle_introduction(mac(2)).await.unwrap();
        let offer = match next_negotiation_event(&mut offerer_events).await {
            PeerEvent::Offer { sdp, .. } => sdp,
            other => panic!("unexpected event: {other:?}"),
        };

        // Candidates arriving before the answer must queue, not apply.
        for port in [50000u16, 50001, 50002, 50003, 50004] {
            offerer
                .handle_candidate(
                    mac(2),
                    format!("candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host"),
                )
                .await
                .unwrap();
        }
        assert_eq!(offerer.pending_candidates(mac(2)).await, Some(5));

        answerer.handle_offer(mac(1), offer).await.unwrap();
        let answer = match next_negotiation_event(&mut answerer_events).await {
            PeerEvent::Answer { sdp, .. } => sdp,
            other => panic!("unexpected event: {other:?}"),
        };

        // The answer drains the queue in arrival order and empties it.
        offerer.handle_answer(mac(2), answer).await.unwrap();
        assert_eq!(offerer.pending_candidates(mac(2)).await, Some(0));
        assert_eq!(
            offerer.session_state(mac(2)).await,
            Some(SessionState::Negotiated)
        );
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_peer_is_an_error() {
        let (peers, _events) = manager();

        let err = peers
            .handle_candidate(mac(9), "candidate:1 1 udp 1 127.0.0.1 1 typ host".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownSession(m) if m == mac(9)));
    }

    #[tokio::test]
    async fn test_resignation_is_idempotent() {
        let (peers, _events) = manager();

        // Resigning a peer that never had a session is a no-op.
        peers.handle_resignation(mac(7)).await.unwrap();

        peers.handle_introduction(mac(7)).await.unwrap();
        peers.handle_resignation(mac(7)).await.unwrap();
        peers.handle_resignation(mac(7)).await.unwrap();
        assert_eq!(peers.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unicast_write_without_session_is_an_error() {
        let (peers, _events) = manager();

        let err = peers.write(mac(3), b"frame").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownSession(m) if m == mac(3)));
    }

    #[tokio::test]
    async fn test_unicast_write_without_open_channel_is_an_error() {
        let (peers, _events) = manager();

        peers.handle_introduction(mac(3)).await.unwrap();
        let err = peers.write(mac(3), b"frame").await.unwrap_err();
        assert!(matches!(err, AgentError::ChannelUnavailable(m) if m == mac(3)));
    }

    #[tokio::test]
    async fn test_broadcast_with_no_open_channels_succeeds() {
        let (peers, _events) = manager();

        peers.handle_introduction(mac(3)).await.unwrap();
        peers.write(protocol::BROADCAST, b"frame").await.unwrap();
    }

    #[tokio::test]
    async fn test_close_resigns_everything() {
        let (peers, _events) = manager();

        peers.handle_introduction(mac(1)).await.unwrap();
        peers.handle_introduction(mac(2)).await.unwrap();
        assert_eq!(peers.session_count().await, 2);

        peers.close().await.unwrap();
        assert_eq!(peers.session_count().await, 0);
    }
}
