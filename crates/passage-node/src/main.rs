//! Passage connectivity daemon.
//!
//! A standalone node that joins the DHT, accepts direct connections,
//! optionally volunteers as a relay, and forwards gossip for peers
//! it holds channels to.

use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use passage_dht::{Contact, DhtConfig, DhtNode};
use passage_net::{
    event_channel, AllowAll, Authorizer, ChannelRegistry, DirectDialer, DirectListener,
    GossipManager, NetConfig, Orchestrator, PunchDialer, PunchListener, RelayDialer, RelayServer,
    DEFAULT_RELAY_MAX_SESSIONS,
};
use passage_proto::limits::DHT_RECORD_TTL_SECS;
use passage_proto::{
    unix_now, NatKind, NodeKeypair, PeerAnnouncement, PeerId, PunchAdvert, RelayAdvert,
};
use passage_store::{
    ContactStore, GossipSpool, PeerDirectory, StoreDb, DEFAULT_SNAPSHOT_MAX_AGE_SECS,
};

/// File under the data directory holding the node's key seed.
const IDENTITY_FILE: &str = "identity.key";

/// Subdirectory under the data directory holding the database.
const DB_DIR: &str = "db";

/// Buffer for the promoted-channel fanout feeding the gossip manager.
const PROMOTED_BUFFER: usize = 64;

/// Passage Node
///
/// A peer-to-peer connectivity node with tiered dialing and
/// store-and-forward fallback.
#[derive(Parser, Debug)]
#[command(name = "passage-node")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to data directory
    #[arg(short, long, env = "PASSAGE_DATA_DIR", default_value = "/var/lib/passage")]
    data_dir: PathBuf,

    /// TCP listen address for direct connections
    #[arg(short, long, env = "PASSAGE_LISTEN_ADDR", default_value = "0.0.0.0:7400")]
    listen_addr: SocketAddr,

    /// UDP bind address for the DHT
    #[arg(long, env = "PASSAGE_DHT_BIND", default_value = "0.0.0.0:7401")]
    dht_bind: SocketAddr,

    /// Bootstrap contacts (comma-separated `<hex-peer-id>@<ip:port>`)
    #[arg(short, long, env = "PASSAGE_BOOTSTRAP")]
    bootstrap: Option<String>,

    /// Volunteer as a relay for peers that cannot connect directly
    #[arg(long, env = "PASSAGE_VOLUNTEER_RELAY", default_value = "false")]
    volunteer_relay: bool,

    /// Maximum concurrent relay sessions when volunteering
    #[arg(long, env = "PASSAGE_RELAY_MAX_SESSIONS", default_value_t = DEFAULT_RELAY_MAX_SESSIONS)]
    relay_max_sessions: usize,

    /// External signaling service URL (this build is DHT-only)
    #[arg(long, env = "PASSAGE_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PASSAGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (plain, json)
    #[arg(long, env = "PASSAGE_LOG_FORMAT", default_value = "plain")]
    log_format: String,

    /// Health check port
    #[arg(long, env = "PASSAGE_HEALTH_PORT", default_value = "7390")]
    health_port: u16,
}

fn setup_logging(log_level: &str, log_format: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("sled=warn".parse()?);

    match log_format.to_lowercase().as_str() {
        "json" => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
        _ => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
    }

    Ok(())
}

/// Parse `<hex-peer-id>@<ip:port>` bootstrap entries.
fn parse_bootstrap(raw: Option<&str>) -> Result<Vec<(PeerId, SocketAddr)>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut seeds = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (id_hex, addr) = entry.split_once('@').with_context(|| {
            format!("bootstrap entry `{entry}` is missing `@`; expected <hex-peer-id>@<ip:port>")
        })?;
        let peer_id = PeerId::from_hex(id_hex)
            .with_context(|| format!("bootstrap entry `{entry}` has a malformed peer id"))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("bootstrap entry `{entry}` has a malformed address"))?;
        seeds.push((peer_id, addr));
    }
    Ok(seeds)
}

/// Load the persisted identity, or generate and persist one.
fn load_or_generate_identity(data_dir: &Path) -> Result<NodeKeypair> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let seed = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return NodeKeypair::from_seed_bytes(&seed)
            .with_context(|| format!("Identity file {} is corrupt", path.display()));
    }

    let keypair = NodeKeypair::generate();
    let seed = keypair.seed();
    std::fs::write(&path, seed.as_slice())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("Failed to restrict {}", path.display()))?;
    }
    info!(path = %path.display(), peer_id = %keypair.peer_id(), "Generated node identity");
    Ok(keypair)
}

/// Build and publish this node's announcement once.
///
/// Returns `None` when the node has no dialable address yet, which is
/// normal before the first OBSERVE exchange on a wildcard bind.
async fn publish_announcement(
    dht: &Arc<DhtNode>,
    listen_addr: SocketAddr,
    relay: Option<RelayAdvert>,
    punch_port: u16,
) -> Result<Option<usize>> {
    let (external, nat) = match dht.observed_addr().await {
        Ok((addr, nat)) => (Some(addr), nat),
        Err(err) => {
            debug!(%err, "No observed address yet");
            (None, NatKind::Unknown)
        }
    };

    let mut announcement = PeerAnnouncement {
        peer_id: dht.local_id(),
        ipv4_local: None,
        ipv4_external: None,
        nat,
        ipv6: None,
        relay,
        punch: Some(PunchAdvert {
            port: punch_port,
            nat,
            // No punch history to report yet; advertise neutral.
            success_rate: 1.0,
        }),
        reachable_via: Vec::new(),
        issued_at: unix_now(),
    };

    // A concrete listen address is advertised as-is; a wildcard bind
    // relies on the observed address alone.
    match listen_addr.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => {
            announcement.ipv4_local = Some(SocketAddrV4::new(ip, listen_addr.port()));
        }
        IpAddr::V6(ip) if !ip.is_unspecified() => {
            announcement.ipv6 = Some(SocketAddrV6::new(ip, listen_addr.port(), 0, 0));
        }
        _ => {}
    }
    // The observed address carries the DHT's source port; peers dial
    // the TCP listener, so the advertised port is ours.
    match external {
        Some(SocketAddr::V4(addr)) => {
            announcement.ipv4_external = Some(SocketAddrV4::new(*addr.ip(), listen_addr.port()));
        }
        Some(SocketAddr::V6(addr)) => {
            announcement.ipv6 = Some(SocketAddrV6::new(*addr.ip(), listen_addr.port(), 0, 0));
        }
        None => {}
    }

    if announcement.validate().is_err() {
        return Ok(None);
    }
    let stored = dht
        .announce(&announcement)
        .await
        .context("Failed to publish announcement")?;
    Ok(Some(stored))
}

/// Republish the announcement well inside the record TTL.
async fn run_announce_loop(
    dht: Arc<DhtNode>,
    listen_addr: SocketAddr,
    relay: Option<RelayAdvert>,
    punch_port: u16,
) {
    let interval = Duration::from_secs(DHT_RECORD_TTL_SECS / 4);
    loop {
        match publish_announcement(&dht, listen_addr, relay, punch_port).await {
            Ok(Some(stored)) => info!(stored, "Announcement published"),
            Ok(None) => debug!("No dialable address yet, announcement deferred"),
            Err(err) => warn!(error = %err, "Announcement failed"),
        }
        sleep(interval).await;
    }
}

/// Run health check server
async fn run_health_server(port: u16, ready: Arc<AtomicBool>) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!(port = port, "Health check server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            let request = String::from_utf8_lossy(&buf[..n]);
            let response = if request.contains("GET /ready") {
                if ready.load(Ordering::Acquire) {
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: 14\r\n\
                     Connection: close\r\n\r\n\
                     {\"ready\":true}"
                } else {
                    "HTTP/1.1 503 Service Unavailable\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: 15\r\n\
                     Connection: close\r\n\r\n\
                     {\"ready\":false}"
                }
            } else if request.contains("GET /health") {
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: 15\r\n\
                 Connection: close\r\n\r\n\
                 {\"status\":\"ok\"}"
            } else {
                "HTTP/1.1 404 Not Found\r\n\
                 Content-Length: 0\r\n\
                 Connection: close\r\n\r\n"
            };
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, &args.log_format)?;

    if let Some(url) = &args.signaling_url {
        bail!(
            "signaling transport for `{url}` is not available in this build; \
             omit --signaling-url to run DHT-only"
        );
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %args.data_dir.display(),
        listen_addr = %args.listen_addr,
        dht_bind = %args.dht_bind,
        volunteer_relay = args.volunteer_relay,
        "Starting passage node"
    );

    // Ensure data directory exists
    if !args.data_dir.exists() {
        std::fs::create_dir_all(&args.data_dir).context("Failed to create data directory")?;
        info!(path = %args.data_dir.display(), "Created data directory");
    }

    let db = StoreDb::open(args.data_dir.join(DB_DIR)).context("Failed to open store")?;
    let keypair = Arc::new(load_or_generate_identity(&args.data_dir)?);
    let local = keypair.peer_id();
    info!(peer_id = %local, "Identity ready");

    let directory =
        Arc::new(PeerDirectory::open(&db, unix_now()).context("Failed to open peer directory")?);
    let spool = GossipSpool::open(&db).context("Failed to open gossip spool")?;
    let contact_store = ContactStore::open(&db).context("Failed to open contact store")?;

    // DHT: warm the table from the last snapshot and the pinned seeds,
    // then bootstrap against whichever of them answer.
    let seeds = parse_bootstrap(args.bootstrap.as_deref())?;
    let dht_config = DhtConfig::default()
        .with_bind_addr(args.dht_bind)
        .with_bootstrap(seeds.iter().map(|(_, addr)| *addr).collect());
    let dht = DhtNode::bind(local, dht_config)
        .await
        .context("Failed to bind DHT socket")?;

    let snapshot = contact_store
        .load(unix_now(), DEFAULT_SNAPSHOT_MAX_AGE_SECS)
        .context("Failed to load contact snapshot")?;
    let mut warm: Vec<Contact> = snapshot
        .iter()
        .map(|saved| Contact::new(saved.peer_id, saved.addr, saved.last_seen))
        .collect();
    warm.extend(
        seeds
            .iter()
            .map(|(peer_id, addr)| Contact::new(*peer_id, *addr, unix_now())),
    );
    if !warm.is_empty() {
        let admitted = dht.restore_contacts(warm).await;
        info!(admitted, snapshot = snapshot.len(), "Routing table warmed");
    }

    let dht_task = dht.start();
    if let Err(err) = dht.bootstrap().await {
        warn!(error = %err, "Bootstrap failed, continuing with the warm table");
    }

    // Connectivity plumbing shared by inbound and outbound paths.
    let config = NetConfig::default();
    let registry = Arc::new(ChannelRegistry::new());
    let (promoted_tx, promoted_rx) = mpsc::channel(PROMOTED_BUFFER);
    let (gossip, mut delivered_rx) = GossipManager::new(local, Arc::clone(&registry), spool, &config);
    let gossip = Arc::new(gossip);
    let gossip_task = tokio::spawn(Arc::clone(&gossip).run(promoted_rx));

    // Envelopes addressed to this node surface here. Until a control
    // surface consumes them, the daemon just records the delivery.
    tokio::spawn(async move {
        while let Some(envelope) = delivered_rx.recv().await {
            info!(
                message_id = %envelope.message_id,
                origin = %envelope.origin,
                bytes = envelope.payload.len(),
                "Gossip payload delivered"
            );
        }
    });

    // Listeners.
    let authorizer: Arc<dyn Authorizer> = Arc::new(AllowAll);
    let direct = DirectListener::bind(args.listen_addr, Arc::clone(&keypair), Arc::clone(&authorizer))
        .await
        .context("Failed to bind direct listener")?;
    let listen_addr = direct.local_addr()?;
    let direct_task = tokio::spawn(direct.run(Arc::clone(&registry), promoted_tx.clone()));
    info!(addr = %listen_addr, "Direct listener up");

    let relay_advert = if args.volunteer_relay {
        let server = RelayServer::bind(
            Arc::clone(&keypair),
            Arc::clone(&authorizer),
            SocketAddr::new(args.listen_addr.ip(), 0),
            args.relay_max_sessions,
        )
        .await
        .context("Failed to bind relay listener")?;
        let advert = server.advert()?;
        info!(
            addr = %server.local_addr()?,
            max_sessions = args.relay_max_sessions,
            "Relay volunteer up"
        );
        tokio::spawn(server.run());
        Some(advert)
    } else {
        None
    };

    let punch = PunchListener::bind(
        Arc::clone(&keypair),
        Arc::clone(&dht),
        Arc::clone(&authorizer),
        args.listen_addr.ip(),
        0,
        &config,
    )
    .await
    .context("Failed to bind punch listener")?;
    let punch_port = punch.local_port();
    let punch_task = tokio::spawn(punch.run(Arc::clone(&registry), promoted_tx.clone()));
    info!(port = punch_port, "Punch listener up");

    // Orchestrator: dials on behalf of whatever control surface is
    // attached later; inbound and outbound share registry and spool.
    let (events_tx, mut events_rx) = event_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            debug!(
                request = %event.request_id,
                peer = %event.peer_id,
                tier = ?event.tier,
                state = ?event.state,
                "Request transition"
            );
        }
    });
    let orchestrator = Orchestrator::new(
        local,
        config.clone(),
        Arc::clone(&directory),
        Arc::clone(&registry),
        Arc::clone(&gossip),
        events_tx,
        promoted_tx.clone(),
    )?
    .with_dht(Arc::clone(&dht))
    .with_dialer(Arc::new(DirectDialer::ipv6(Arc::clone(&keypair))))
    .with_dialer(Arc::new(DirectDialer::ipv4(Arc::clone(&keypair))))
    .with_dialer(Arc::new(PunchDialer::new(
        Arc::clone(&keypair),
        None,
        Some(Arc::clone(&dht)),
        &config,
    )))
    .with_dialer(Arc::new(RelayDialer::new(Arc::clone(&keypair))));
    let _orchestrator = Arc::new(orchestrator);

    let announce_task = tokio::spawn(run_announce_loop(
        Arc::clone(&dht),
        listen_addr,
        relay_advert,
        punch_port,
    ));

    // Hourly directory sweep; load() already dropped records that
    // expired while the node was down.
    let sweep_directory = Arc::clone(&directory);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            tick.tick().await;
            match sweep_directory.sweep(unix_now()) {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Directory sweep"),
                Err(err) => warn!(error = %err, "Directory sweep failed"),
            }
        }
    });

    // Start health check server
    let ready = Arc::new(AtomicBool::new(false));
    let health_port = args.health_port;
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_ready).await {
            warn!(error = %e, "Health server error");
        }
    });

    ready.store(true, Ordering::Release);
    info!(
        peer_id = %local,
        listen_addr = %listen_addr,
        health_endpoint = format!("http://0.0.0.0:{}/health", args.health_port),
        "Node is ready to accept connections"
    );

    // Wait for shutdown signal
    info!("Press Ctrl+C to stop the node");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down passage node...");

    // Stop the listeners first so the final snapshot is quiescent.
    direct_task.abort();
    punch_task.abort();
    gossip_task.abort();
    announce_task.abort();

    let contacts = dht.snapshot_contacts().await;
    dht_task.abort();
    let saved: Vec<_> = contacts
        .iter()
        .map(|contact| passage_store::SavedContact {
            peer_id: contact.peer_id,
            addr: contact.addr,
            last_seen: contact.last_seen,
        })
        .collect();
    if let Err(err) = contact_store.save(&saved, unix_now()) {
        warn!(error = %err, "Contact snapshot failed");
    } else {
        info!(contacts = saved.len(), "Contact snapshot written");
    }
    match db.flush() {
        Ok(bytes) => info!(bytes, "Store flushed"),
        Err(err) => warn!(error = %err, "Store flush failed"),
    }

    info!("Passage node stopped");
    Ok(())
}
