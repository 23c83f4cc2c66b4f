use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pd_core::device::{DeviceContext, Platform};
use pd_core::ids::DeviceId;
use pd_core::network::{ConnectionError, ConnectionState, PeerEvent, SignalKind};
use pd_core::ports::{PeerConnectionPort, PeerLinkFactory};
use pd_core::settings::ConnectionSettings;
use pd_network::{MemoryLinkFactory, MemorySignalingHub, PeerConnectionManager, TcpLinkFactory};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

struct Node {
    id: DeviceId,
    manager: PeerConnectionManager,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

async fn node(hub: &MemorySignalingHub, links: Arc<dyn PeerLinkFactory>, id: &str) -> Node {
    init_tracing();
    let ctx = DeviceContext::new(id, id.to_uppercase(), Platform::Linux);
    let manager = PeerConnectionManager::spawn(
        ctx,
        ConnectionSettings::default(),
        Arc::new(hub.client()),
        links,
    );
    manager.initialize().await.unwrap();
    let events = manager.subscribe().await.unwrap();
    Node {
        id: DeviceId::new(id),
        manager,
        events,
    }
}

async fn memory_pair() -> (Node, Node) {
    let hub = MemorySignalingHub::new();
    let links: Arc<dyn PeerLinkFactory> = Arc::new(MemoryLinkFactory::new());
    let a = node(&hub, links.clone(), "a").await;
    let b = node(&hub, links, "b").await;
    (a, b)
}

async fn wait_state(events: &mut mpsc::UnboundedReceiver<PeerEvent>, device: &DeviceId, wanted: ConnectionState) {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(PeerEvent::StateChanged { device_id, state, .. }) if &device_id == device && state == wanted => {
                    return;
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {device} to become {wanted}"));
}

async fn next_data(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> (DeviceId, Bytes) {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(PeerEvent::DataReceived { device_id, data }) => return (device_id, data),
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for data")
}

async fn connect(a: &mut Node, b: &mut Node) {
    a.manager.create_offer(&b.id).await.unwrap();
    wait_state(&mut a.events, &b.id, ConnectionState::Connected).await;
    wait_state(&mut b.events, &a.id, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_offer_connects_both_sides_and_delivers_data() {
    let (mut a, mut b) = memory_pair().await;
    connect(&mut a, &mut b).await;

    a.manager.send(&b.id, Bytes::from_static(b"hello")).await.unwrap();
    let (from, data) = next_data(&mut b.events).await;
    assert_eq!(from, a.id);
    assert_eq!(data, Bytes::from_static(b"hello"));

    assert_eq!(a.manager.connected_devices().await.unwrap(), vec![b.id.clone()]);
    assert_eq!(
        b.manager.session_state(&a.id).await.unwrap(),
        Some(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn test_messages_sent_before_connect_arrive_in_order() {
    let (a, mut b) = memory_pair().await;

    a.manager.create_offer(&b.id).await.unwrap();
    for i in 0..5u8 {
        a.manager.send(&b.id, Bytes::from(vec![i])).await.unwrap();
    }

    for i in 0..5u8 {
        let (_, data) = next_data(&mut b.events).await;
        assert_eq!(data, Bytes::from(vec![i]));
    }
}

#[tokio::test]
async fn test_second_offer_to_live_session_is_rejected() {
    let (a, b) = memory_pair().await;

    a.manager.create_offer(&b.id).await.unwrap();
    let err = a.manager.create_offer(&b.id).await.unwrap_err();
    assert_eq!(err, ConnectionError::DuplicateSession(b.id.clone()));
}

#[tokio::test]
async fn test_send_without_session_fails() {
    let (a, b) = memory_pair().await;
    let err = a.manager.send(&b.id, Bytes::from_static(b"x")).await.unwrap_err();
    assert_eq!(err, ConnectionError::NoSession(b.id.clone()));
}

#[tokio::test]
async fn test_close_twice_emits_closed_once() {
    let (mut a, mut b) = memory_pair().await;
    connect(&mut a, &mut b).await;

    a.manager.close(&b.id).await.unwrap();
    a.manager.close(&b.id).await.unwrap();
    wait_state(&mut b.events, &a.id, ConnectionState::Closed).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut closed = 0;
    while let Ok(event) = a.events.try_recv() {
        if let PeerEvent::StateChanged {
            state: ConnectionState::Closed,
            ..
        } = event
        {
            closed += 1;
        }
    }
    assert_eq!(closed, 1);
    assert_eq!(a.manager.session_state(&b.id).await.unwrap(), None);
    assert_eq!(b.manager.session_state(&a.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_pair_envelope_is_forwarded_not_negotiated() {
    let (a, mut b) = memory_pair().await;

    a.manager
        .signal(&b.id, SignalKind::Pair, json!({"reciprocal": false}))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), b.events.recv()).await.unwrap().unwrap();
    match event {
        PeerEvent::PairSignal(envelope) => {
            assert_eq!(envelope.from, a.id);
            assert_eq!(envelope.from_name.as_deref(), Some("A"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(b.manager.session_state(&a.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_misaddressed_envelope_is_dropped() {
    let (a, b) = memory_pair().await;
    let stranger = DeviceContext::new("z", "Z", Platform::Web);
    let envelope = pd_core::network::SignalEnvelope::new(&stranger, "someone-else".into(), SignalKind::Offer, json!({}));

    b.manager.handle_signal(envelope).await.unwrap();
    assert_eq!(b.manager.session_state(&"z".into()).await.unwrap(), None);
    assert_eq!(a.manager.connected_devices().await.unwrap(), Vec::<DeviceId>::new());
}

#[tokio::test]
async fn test_broadcast_skips_sessions_that_are_not_connected() {
    let (mut a, mut b) = memory_pair().await;
    connect(&mut a, &mut b).await;

    // "ghost" never joined signaling, so this session stays connecting.
    a.manager.create_offer(&"ghost".into()).await.unwrap();

    let reached = a.manager.broadcast(Bytes::from_static(b"all")).await.unwrap();
    assert_eq!(reached, 1);
    let (_, data) = next_data(&mut b.events).await;
    assert_eq!(data, Bytes::from_static(b"all"));
    assert_eq!(a.manager.buffered_amount(&"ghost".into()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_negotiation_times_out() {
    let (mut a, _b) = memory_pair().await;
    let ghost = DeviceId::new("ghost");

    a.manager.create_offer(&ghost).await.unwrap();
    wait_state(&mut a.events, &ghost, ConnectionState::Connecting).await;

    timeout(Duration::from_secs(60), async {
        loop {
            if let Some(PeerEvent::StateChanged {
                state: ConnectionState::Failed,
                ..
            }) = a.events.recv().await
            {
                return;
            }
        }
    })
    .await
    .expect("session should fail after the negotiation timeout");

    assert_eq!(
        a.manager.session_state(&ghost).await.unwrap(),
        Some(ConnectionState::Failed)
    );
    assert!(matches!(
        a.manager.send(&ghost, Bytes::from_static(b"x")).await,
        Err(ConnectionError::NotLive { .. })
    ));

    // A failed session is replaced by a fresh offer.
    a.manager.create_offer(&ghost).await.unwrap();
    assert_eq!(
        a.manager.session_state(&ghost).await.unwrap(),
        Some(ConnectionState::Connecting)
    );
}

#[tokio::test]
async fn test_simultaneous_offers_settle_on_one_session() {
    let (mut a, mut b) = memory_pair().await;

    let (from_a, from_b) = tokio::join!(a.manager.create_offer(&b.id), b.manager.create_offer(&a.id));
    for result in [from_a, from_b] {
        assert!(matches!(result, Ok(()) | Err(ConnectionError::DuplicateSession(_))));
    }

    wait_state(&mut a.events, &b.id, ConnectionState::Connected).await;
    wait_state(&mut b.events, &a.id, ConnectionState::Connected).await;

    b.manager.send(&a.id, Bytes::from_static(b"settled")).await.unwrap();
    let (from, data) = next_data(&mut a.events).await;
    assert_eq!(from, b.id);
    assert_eq!(data, Bytes::from_static(b"settled"));
}

#[tokio::test]
async fn test_uninitialized_manager_refuses_offers() {
    let hub = MemorySignalingHub::new();
    let manager = PeerConnectionManager::spawn(
        DeviceContext::new("solo", "Solo", Platform::Linux),
        ConnectionSettings::default(),
        Arc::new(hub.client()),
        Arc::new(MemoryLinkFactory::new()),
    );
    assert_eq!(
        manager.create_offer(&"b".into()).await,
        Err(ConnectionError::NotInitialized)
    );

    manager.initialize().await.unwrap();
    manager.initialize().await.unwrap();
    assert_eq!(hub.rooms().await, vec![DeviceId::new("solo")]);

    manager.shutdown().await.unwrap();
    assert!(hub.rooms().await.is_empty());
    assert_eq!(
        manager.connected_devices().await,
        Err(ConnectionError::ManagerStopped)
    );
}

#[tokio::test]
async fn test_tcp_link_carries_data_over_loopback() {
    let hub = MemorySignalingHub::new();
    let links: Arc<dyn PeerLinkFactory> = Arc::new(TcpLinkFactory::loopback_only());
    let mut a = node(&hub, links.clone(), "a").await;
    let mut b = node(&hub, links, "b").await;
    connect(&mut a, &mut b).await;

    let big = Bytes::from(vec![0xAB; 200 * 1024]);
    a.manager.send(&b.id, Bytes::from_static(b"first")).await.unwrap();
    a.manager.send(&b.id, big.clone()).await.unwrap();

    assert_eq!(next_data(&mut b.events).await.1, Bytes::from_static(b"first"));
    assert_eq!(next_data(&mut b.events).await.1, big);

    a.manager.wait_for_drain(&b.id, 0).await.unwrap();
    assert_eq!(a.manager.buffered_amount(&b.id).await.unwrap(), 0);

    b.manager.close(&a.id).await.unwrap();
    wait_state(&mut a.events, &b.id, ConnectionState::Closed).await;
}
