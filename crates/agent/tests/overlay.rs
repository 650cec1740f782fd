//! Agent-side integration tests against an in-process signaling server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agent::config::AgentConfig;
use agent::signaling::{SignalingClient, SignalingConfig, SignalingEvent, SignalingHandle};
use agent::tap::MemoryDevice;
use agent::FrameDevice;
use agent::Overlay;
use protocol::{MacAddr, PayloadCipher};
use signaler::SignalingServer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SDP: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

fn mac(last: u8) -> MacAddr {
    MacAddr::from_bytes([0x02, 0, 0, 0, 0, last])
}

async fn start_signaler() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Arc::new(SignalingServer::new(Duration::from_secs(10)));
    let shutdown = CancellationToken::new();
    tokio::spawn(async move {
        server.run(listener, None, shutdown).await.unwrap();
    });

    addr
}

async fn connect(addr: SocketAddr) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

struct TestClient {
    task: JoinHandle<agent::Result<()>>,
    events: mpsc::Receiver<SignalingEvent>,
    handle: SignalingHandle,
    shutdown: CancellationToken,
}

async fn spawn_client(addr: SocketAddr, member: MacAddr, community: &str, key: &[u8]) -> TestClient {
    let cipher = PayloadCipher::from_key_bytes(key).unwrap();
    let client = SignalingClient::new(
        SignalingConfig {
            mac: member,
            community: community.to_string(),
            timeout: Duration::from_secs(10),
        },
        cipher.clone(),
    );

    let ws = connect(addr).await;
    let (events_tx, events_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();

    let run_shutdown = shutdown.clone();
    let task = tokio::spawn(async move { client.run(ws, events_tx, out_rx, run_shutdown).await });

    TestClient {
        task,
        events: events_rx,
        handle: SignalingHandle::new(out_tx, cipher),
        shutdown,
    }
}

async fn next_event(events: &mut mpsc::Receiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for signaling event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_member_is_introduced_to_newcomers() {
    let addr = start_signaler().await;

    let mut a = spawn_client(addr, mac(0x0a), "c1", b"").await;
    // Give A's application/ready a moment to land before B joins.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _b = spawn_client(addr, mac(0x0b), "c1", b"").await;

    match next_event(&mut a.events).await {
        SignalingEvent::Introduction { mac: m } => assert_eq!(m, mac(0x0b)),
        other => panic!("unexpected event: {other:?}"),
    }

    a.shutdown.cancel();
    assert!(a.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_duplicate_application_is_terminal() {
    let addr = start_signaler().await;

    let _a = spawn_client(addr, mac(0x0a), "c1", b"").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let b = spawn_client(addr, mac(0x0a), "c1", b"").await;
    let result = tokio::time::timeout(RECV_TIMEOUT, b.task)
        .await
        .expect("client did not finish")
        .unwrap();

    match result {
        Err(err) => assert!(err.is_terminal(), "expected terminal error, got {err}"),
        Ok(()) => panic!("expected rejection"),
    }
}

#[tokio::test]
async fn test_exchange_roundtrip_with_shared_key() {
    let addr = start_signaler().await;
    let key = b"0123456789abcdef";

    let mut a = spawn_client(addr, mac(0x0a), "c1", key).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut b = spawn_client(addr, mac(0x0b), "c1", key).await;

    // A hears about B and offers.
    match next_event(&mut a.events).await {
        SignalingEvent::Introduction { mac: m } => assert_eq!(m, mac(0x0b)),
        other => panic!("unexpected event: {other:?}"),
    }
    let offer = RTCSessionDescription::offer(SDP.to_string()).unwrap();
    a.handle.signal_description(mac(0x0b), &offer).await.unwrap();

    // B sees the offer as coming from A, decrypted and parsed.
    match next_event(&mut b.events).await {
        SignalingEvent::Offer { mac: m, sdp } => {
            assert_eq!(m, mac(0x0a));
            assert_eq!(sdp.sdp, SDP);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // And a candidate follows the same path.
    a.handle
        .signal_candidate(mac(0x0b), "candidate:1 1 udp 1 127.0.0.1 9 typ host")
        .await
        .unwrap();
    match next_event(&mut b.events).await {
        SignalingEvent::Candidate { mac: m, candidate } => {
            assert_eq!(m, mac(0x0a));
            assert_eq!(candidate, "candidate:1 1 udp 1 127.0.0.1 9 typ host");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_key_mismatch_blocks_the_peer() {
    let addr = start_signaler().await;

    let mut a = spawn_client(addr, mac(0x0a), "c1", b"0123456789abcdef").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut b = spawn_client(addr, mac(0x0b), "c1", b"fedcba9876543210").await;

    match next_event(&mut a.events).await {
        SignalingEvent::Introduction { mac: m } => assert_eq!(m, mac(0x0b)),
        other => panic!("unexpected event: {other:?}"),
    }

    let offer = RTCSessionDescription::offer(SDP.to_string()).unwrap();
    a.handle.signal_description(mac(0x0b), &offer).await.unwrap();

    // B cannot open A's payload: A is blocked, B's client keeps running.
    match next_event(&mut b.events).await {
        SignalingEvent::Resignation { mac: m, blocked } => {
            assert_eq!(m, mac(0x0a));
            assert!(blocked);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!b.task.is_finished());
}

#[tokio::test]
async fn test_resignation_flows_to_remaining_member() {
    let addr = start_signaler().await;

    let mut a = spawn_client(addr, mac(0x0a), "c1", b"").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut b = spawn_client(addr, mac(0x0b), "c1", b"").await;

    match next_event(&mut a.events).await {
        SignalingEvent::Introduction { .. } => {}
        other => panic!("unexpected event: {other:?}"),
    }

    // B departs cleanly; A observes the resignation.
    b.shutdown.cancel();
    assert!(b.task.await.unwrap().is_ok());

    match next_event(&mut a.events).await {
        SignalingEvent::Resignation { mac: m, blocked } => {
            assert_eq!(m, mac(0x0b));
            assert!(!blocked);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

/// Full two-peer handshake over real ICE: both overlays bring up a data
/// channel and frames cross tap to tap.
#[tokio::test]
#[ignore = "requires UDP connectivity between the in-process ICE agents"]
async fn test_two_peer_overlay_carries_frames() {
    let addr = start_signaler().await;

    let mac_a = mac(0x0a);
    let mac_b = mac(0x0b);

    let (dev_a, os_a) = MemoryDevice::pair(1500, mac_a, mac_a);
    let (dev_b, os_b) = MemoryDevice::pair(1500, mac_b, mac_b);

    let mut config_a = AgentConfig::default();
    config_a.network.signaler_url = format!("ws://{addr}");
    config_a.network.community = "c1".to_string();
    config_a.interface.mac = mac_a.to_string();

    let mut config_b = config_a.clone();
    config_b.interface.mac = mac_b.to_string();

    let overlay_a = Overlay::new(config_a, Arc::new(dev_a)).unwrap();
    let overlay_b = Overlay::new(config_b, Arc::new(dev_b)).unwrap();
    let stop_a = overlay_a.shutdown_token();
    let stop_b = overlay_b.shutdown_token();

    let task_a = tokio::spawn(async move { overlay_a.run().await });
    let task_b = tokio::spawn(async move { overlay_b.run().await });

    // Ethernet frame from A to B.
    let mut frame = vec![0u8; 64];
    frame[..6].copy_from_slice(mac_b.as_bytes());
    frame[6..12].copy_from_slice(mac_a.as_bytes());
    frame[12] = 0x08;

    // Retry while the data channel comes up.
    let mut delivered = None;
    for _ in 0..50 {
        os_a.write_frame(&frame).await.unwrap();
        let mut buf = [0u8; 128];
        match tokio::time::timeout(Duration::from_millis(200), os_b.read_frame(&mut buf)).await {
            Ok(Ok(n)) => {
                delivered = Some(buf[..n].to_vec());
                break;
            }
            _ => continue,
        }
    }

    assert_eq!(delivered.as_deref(), Some(frame.as_slice()));

    stop_a.cancel();
    stop_b.cancel();
    let _ = task_a.await.unwrap();
    let _ = task_b.await.unwrap();
}
