//! End-to-end connectivity scenarios across the tier ladder.
//!
//! Each scenario stands up real components on loopback — TCP listeners,
//! the UDP DHT, a relay volunteer, sled-backed stores — and scripts
//! only the network conditions: a cached address, a blocked direct
//! path, an offline destination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use passage_dht::{DhtConfig, DhtNode};
use passage_net::{
    event_channel, AllowAll, AttemptState, Channel, ChannelRegistry, ConnectOutcome, DialTarget,
    DirectDialer, DirectListener, GossipManager, NetConfig, Orchestrator, RelayCandidate,
    RelayDialer, RelayServer, StatusEvent, TierDialer,
};
use passage_proto::{
    unix_now, AddrScope, Endpoint, NatKind, NodeKeypair, PeerAnnouncement, Tier,
};
use passage_store::{GossipSpool, PeerDirectory, StoreDb};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn net_config() -> NetConfig {
    NetConfig::default()
        .with_resolution_deadline(Duration::from_secs(2))
        .with_tier_timeout(Duration::from_secs(3))
        .with_request_deadline(Duration::from_secs(15))
}

fn open_stores() -> (Arc<PeerDirectory>, GossipSpool, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = StoreDb::open(dir.path()).unwrap();
    let directory = Arc::new(PeerDirectory::open(&db, unix_now()).unwrap());
    let spool = GossipSpool::open(&db).unwrap();
    (directory, spool, dir)
}

fn drain_states(events: &mut mpsc::Receiver<StatusEvent>) -> Vec<(Option<Tier>, AttemptState)> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        states.push((event.tier, event.state));
    }
    states
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Scenario: cached direct route
// ============================================================================

#[tokio::test]
async fn cached_direct_route_connects_without_escalation() {
    // Peer B listens on loopback TCP.
    let kb = NodeKeypair::generate();
    let b_id = kb.peer_id();
    let b_registry = Arc::new(ChannelRegistry::new());
    let listener = DirectListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(kb),
        Arc::new(AllowAll),
    )
    .await
    .unwrap();
    let b_addr = listener.local_addr().unwrap();
    let (b_promoted_tx, mut b_promoted) = mpsc::channel(8);
    tokio::spawn(listener.run(Arc::clone(&b_registry), b_promoted_tx));

    // Peer A knows B's address from its directory cache alone.
    let ka = Arc::new(NodeKeypair::generate());
    let a_id = ka.peer_id();
    let (directory, spool, _tmp) = open_stores();
    let SocketAddr::V4(b_v4) = b_addr else {
        panic!("loopback listener is v4");
    };
    directory
        .put_endpoint(b_id, Endpoint::ipv4(b_v4, AddrScope::External), unix_now())
        .unwrap();

    let a_registry = Arc::new(ChannelRegistry::new());
    let config = net_config();
    let (gossip, _delivered) = GossipManager::new(a_id, Arc::clone(&a_registry), spool, &config);
    let (events_tx, mut events) = event_channel();
    let (promoted_tx, mut a_promoted) = mpsc::channel(8);
    let orchestrator = Orchestrator::new(
        a_id,
        config,
        Arc::clone(&directory),
        Arc::clone(&a_registry),
        Arc::new(gossip),
        events_tx,
        promoted_tx,
    )
    .unwrap()
    .with_dialer(Arc::new(DirectDialer::ipv6(Arc::clone(&ka))))
    .with_dialer(Arc::new(DirectDialer::ipv4(Arc::clone(&ka))));

    let outcome = orchestrator.connect(b_id).await.unwrap();
    let ConnectOutcome::Channel(a_channel) = outcome else {
        panic!("expected a live channel");
    };
    assert_eq!(a_channel.tier(), Tier::DirectIpv4);
    assert_eq!(a_channel.peer_id(), b_id);

    // Both ends are promoted and frames flow both ways.
    let b_channel = timeout(WAIT, b_promoted.recv()).await.unwrap().unwrap();
    assert_eq!(b_channel.peer_id(), a_id);
    a_channel.send(b"from a".to_vec()).await.unwrap();
    assert_eq!(
        timeout(WAIT, b_channel.recv()).await.unwrap().unwrap(),
        b"from a"
    );
    b_channel.send(b"from b".to_vec()).await.unwrap();
    assert_eq!(
        timeout(WAIT, a_channel.recv()).await.unwrap().unwrap(),
        b"from b"
    );

    // The gossip manager heard about the promotion and the hint stuck.
    let announced = timeout(WAIT, a_promoted.recv()).await.unwrap().unwrap();
    assert_eq!(announced.peer_id(), b_id);
    let hint = directory
        .get(&b_id, unix_now())
        .unwrap()
        .last_successful_tier;
    assert_eq!(hint, Some(Tier::DirectIpv4));

    // Nothing escalated past the direct group.
    let states = drain_states(&mut events);
    assert!(states.contains(&(Some(Tier::DirectIpv4), AttemptState::Connected)));
    assert!(!states.iter().any(|(tier, _)| *tier == Some(Tier::Relay)));
    assert!(!states.iter().any(|(_, state)| *state == AttemptState::Queued));
}

// ============================================================================
// Scenario: symmetric NAT, relay rendezvous
// ============================================================================

fn dht_config(seeds: Vec<SocketAddr>) -> DhtConfig {
    DhtConfig::default()
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_bootstrap(seeds)
        .with_rpc_timeout(Duration::from_millis(500))
        .with_lookup_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn blocked_direct_path_falls_back_to_relay() {
    // A relay volunteer R, reachable over loopback.
    let kr = Arc::new(NodeKeypair::generate());
    let r_id = kr.peer_id();
    let relay_server = RelayServer::bind(
        Arc::clone(&kr),
        Arc::new(AllowAll),
        "127.0.0.1:0".parse().unwrap(),
        4,
    )
    .await
    .unwrap();
    let relay_addr = relay_server.local_addr().unwrap();
    let relay_advert = relay_server.advert().unwrap();
    tokio::spawn(relay_server.run());

    // Three DHT nodes: R seeds the network, A and B join through it.
    let ka = Arc::new(NodeKeypair::generate());
    let a_id = ka.peer_id();
    let kb = Arc::new(NodeKeypair::generate());
    let b_id = kb.peer_id();

    let dht_r = DhtNode::bind(r_id, dht_config(Vec::new())).await.unwrap();
    let seed_addr = dht_r.local_addr().unwrap();
    let _r_task = dht_r.start();
    let dht_a = DhtNode::bind(a_id, dht_config(vec![seed_addr]))
        .await
        .unwrap();
    let _a_task = dht_a.start();
    dht_a.bootstrap().await.unwrap();
    let dht_b = DhtNode::bind(b_id, dht_config(vec![seed_addr]))
        .await
        .unwrap();
    let _b_task = dht_b.start();
    dht_b.bootstrap().await.unwrap();

    // R announces its relay listener.
    let SocketAddr::V4(relay_v4) = relay_addr else {
        panic!("loopback relay is v4");
    };
    dht_r
        .announce(&PeerAnnouncement {
            peer_id: r_id,
            ipv4_local: Some(relay_v4),
            ipv4_external: None,
            nat: NatKind::None,
            ipv6: None,
            relay: Some(relay_advert),
            punch: None,
            reachable_via: Vec::new(),
            issued_at: unix_now(),
        })
        .await
        .unwrap();

    // B sits behind a symmetric NAT: its only direct candidate is dead,
    // and it stays registered with R.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);
    let SocketAddr::V4(dead_v4) = dead_addr else {
        panic!("loopback probe is v4");
    };
    dht_b
        .announce(&PeerAnnouncement {
            peer_id: b_id,
            ipv4_local: Some(dead_v4),
            ipv4_external: None,
            nat: NatKind::Symmetric,
            ipv6: None,
            relay: None,
            punch: None,
            reachable_via: vec![r_id],
            issued_at: unix_now(),
        })
        .await
        .unwrap();

    // B parks at the relay waiting for A.
    let b_dialer = RelayDialer::new(Arc::clone(&kb));
    let mut b_target = DialTarget::new(a_id);
    b_target.relay_candidates = vec![RelayCandidate {
        peer_id: r_id,
        addr: relay_addr,
        advert: Some(relay_advert),
        rtt: None,
    }];
    let b_wait = tokio::spawn(async move { b_dialer.dial(b_target).await });

    // A starts cold: empty directory, resolution through the DHT.
    let (directory, spool, _tmp) = open_stores();
    let a_registry = Arc::new(ChannelRegistry::new());
    let config = net_config();
    let (gossip, _delivered) = GossipManager::new(a_id, Arc::clone(&a_registry), spool, &config);
    let (events_tx, mut events) = event_channel();
    let (promoted_tx, _a_promoted) = mpsc::channel(8);
    let orchestrator = Orchestrator::new(
        a_id,
        config,
        Arc::clone(&directory),
        Arc::clone(&a_registry),
        Arc::new(gossip),
        events_tx,
        promoted_tx,
    )
    .unwrap()
    .with_dht(Arc::clone(&dht_a))
    .with_dialer(Arc::new(DirectDialer::ipv4(Arc::clone(&ka))))
    .with_dialer(Arc::new(RelayDialer::new(Arc::clone(&ka))));

    let outcome = orchestrator.connect(b_id).await.unwrap();
    let ConnectOutcome::Channel(a_channel) = outcome else {
        panic!("expected a relayed channel");
    };
    assert_eq!(a_channel.tier(), Tier::Relay);
    assert_eq!(a_channel.peer_id(), b_id);

    let b_channel = timeout(WAIT, b_wait).await.unwrap().unwrap().unwrap();
    assert_eq!(b_channel.peer_id(), a_id);
    a_channel.send(b"through the relay".to_vec()).await.unwrap();
    assert_eq!(
        timeout(WAIT, b_channel.recv()).await.unwrap().unwrap(),
        b"through the relay"
    );
    b_channel.send(b"and back".to_vec()).await.unwrap();
    assert_eq!(
        timeout(WAIT, a_channel.recv()).await.unwrap().unwrap(),
        b"and back"
    );

    // The directory remembers the relay tier for the next request.
    let hint = directory
        .get(&b_id, unix_now())
        .unwrap()
        .last_successful_tier;
    assert_eq!(hint, Some(Tier::Relay));

    let states = drain_states(&mut events);
    assert!(states.contains(&(Some(Tier::DirectIpv4), AttemptState::TierFailed)));
    assert!(states.contains(&(Some(Tier::Relay), AttemptState::Connected)));
}

// ============================================================================
// Scenario: offline destination, spooled delivery
// ============================================================================

#[tokio::test]
async fn queued_message_reaches_a_late_destination() {
    let config = net_config();
    let a_id = NodeKeypair::generate().peer_id();
    let n_id = NodeKeypair::generate().peer_id();
    let c_id = NodeKeypair::generate().peer_id();

    // Sender A: an orchestrator with no live tiers and a running
    // gossip manager.
    let (a_directory, a_spool, _a_tmp) = open_stores();
    let a_registry = Arc::new(ChannelRegistry::new());
    let (a_gossip, _a_delivered) =
        GossipManager::new(a_id, Arc::clone(&a_registry), a_spool, &config);
    let a_gossip = Arc::new(a_gossip);
    let (a_promoted_tx, a_promoted_rx) = mpsc::channel(8);
    tokio::spawn(Arc::clone(&a_gossip).run(a_promoted_rx));
    let (a_events_tx, mut a_events) = event_channel();
    let orchestrator = Orchestrator::new(
        a_id,
        config.clone(),
        a_directory,
        Arc::clone(&a_registry),
        Arc::clone(&a_gossip),
        a_events_tx,
        a_promoted_tx.clone(),
    )
    .unwrap();

    // Neighbor N: a gossip manager with its own spool.
    let (_n_directory, n_spool, _n_tmp) = open_stores();
    let n_registry = Arc::new(ChannelRegistry::new());
    let (n_gossip, _n_delivered) =
        GossipManager::new(n_id, Arc::clone(&n_registry), n_spool, &config);
    let n_gossip = Arc::new(n_gossip);
    let (n_promoted_tx, n_promoted_rx) = mpsc::channel(8);
    tokio::spawn(Arc::clone(&n_gossip).run(n_promoted_rx));

    // A and N are connected; C is offline.
    let (a_end, n_end) = Channel::pair(a_id, n_id, Tier::DirectIpv4);
    let a_end = Arc::new(a_end);
    let n_end = Arc::new(n_end);
    a_registry.register(Arc::clone(&a_end)).await;
    n_registry.register(Arc::clone(&n_end)).await;
    a_promoted_tx.send(Arc::clone(&a_end)).await.unwrap();
    n_promoted_tx.send(Arc::clone(&n_end)).await.unwrap();

    let outcome = orchestrator
        .send_or_queue(c_id, b"catch up later".to_vec())
        .await
        .unwrap();
    let ConnectOutcome::Queued(Some(id)) = outcome else {
        panic!("expected a queued message id");
    };
    assert_eq!(a_gossip.spooled(), 1);

    // The push lands in the neighbor's spool.
    wait_until(|| n_gossip.spooled() == 1).await;

    // C comes online and connects to N.
    let (_c_directory, c_spool, _c_tmp) = open_stores();
    let c_registry = Arc::new(ChannelRegistry::new());
    let (c_gossip, mut c_delivered) =
        GossipManager::new(c_id, Arc::clone(&c_registry), c_spool, &config);
    let c_gossip = Arc::new(c_gossip);
    let (c_promoted_tx, c_promoted_rx) = mpsc::channel(8);
    tokio::spawn(Arc::clone(&c_gossip).run(c_promoted_rx));

    let (n_to_c, c_to_n) = Channel::pair(n_id, c_id, Tier::DirectIpv4);
    let n_to_c = Arc::new(n_to_c);
    let c_to_n = Arc::new(c_to_n);
    n_registry.register(Arc::clone(&n_to_c)).await;
    c_registry.register(Arc::clone(&c_to_n)).await;
    n_promoted_tx.send(Arc::clone(&n_to_c)).await.unwrap();
    c_promoted_tx.send(Arc::clone(&c_to_n)).await.unwrap();

    // N's anti-entropy offer reaches C.
    let envelope = timeout(WAIT, c_delivered.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.message_id, id);
    assert_eq!(envelope.origin, a_id);
    assert_eq!(envelope.destination, c_id);
    assert_eq!(envelope.payload, b"catch up later".to_vec());

    // C's ack clears the neighbor's copy. The origin keeps its own
    // until it hears an ack directly.
    wait_until(|| n_gossip.spooled() == 0).await;
    assert_eq!(a_gossip.spooled(), 1);

    let states = drain_states(&mut a_events);
    assert!(states.contains(&(None, AttemptState::Queued)));
    assert!(!states.iter().any(|(_, state)| *state == AttemptState::Exhausted));
}
