//! overlay-daemon: headless P2P overlay node.
//!
//! Runs overlay-core over plain TCP: bootstraps against the configured
//! seeds, validates inbound peers, keeps connections alive, gossips
//! distributed data, and persists discovered peers for the next start.

use anyhow::{Context, Result};
use clap::Parser;
use overlay_core::{
    Address, AddressValidator, AdmissionService, Broadcaster, BanList, CloseReason,
    DataGossipService, InMemoryDataStore, KeepAliveService, KeyHash, Node, NodeConfig,
    NodeEvent, PeerExchangeService, PeerGroupStore, StaticAuthorizedKeys, TcpTransport,
};
use overlay_daemon::persistence::PeerStorage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "overlay-daemon")]
#[command(about = "P2P overlay network node")]
struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, default_value = "0.0.0.0:8333")]
    listen: String,

    /// Seed node address (repeatable)
    #[arg(short, long)]
    seed: Vec<String>,

    /// Directory for persisted state
    #[arg(long, default_value = ".overlay")]
    data_dir: PathBuf,

    /// Hex-encoded Ed25519 public key permitted to publish authorized
    /// data (repeatable)
    #[arg(long)]
    authorized_key: Vec<String>,

    /// Seconds between keep-alive rounds
    #[arg(long, default_value_t = 30)]
    keep_alive_interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or
    // debug with --verbose)
    let default_filter = if args.verbose {
        "debug,overlay_daemon=debug"
    } else {
        "info,overlay_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting overlay-daemon");

    let listen: Address = args
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", args.listen))?;
    let seeds: Vec<Address> = args
        .seed
        .iter()
        .map(|s| {
            s.parse()
                .with_context(|| format!("invalid seed address {s}"))
        })
        .collect::<Result<_>>()?;

    let mut authorized = Vec::new();
    for key in &args.authorized_key {
        let bytes = hex::decode(key).with_context(|| format!("invalid authorized key {key}"))?;
        authorized.push(KeyHash::of_public_key(&bytes));
    }

    let mut storage = PeerStorage::new(&args.data_dir)?;
    let persisted = storage.peers().addresses();
    if !persisted.is_empty() {
        info!("Loaded {} persisted peers", persisted.len());
    }

    let ban_list = Arc::new(BanList::new());
    let peer_group = Arc::new(PeerGroupStore::new(seeds.clone(), Arc::clone(&ban_list)));
    peer_group.merge_reported(&persisted, None);

    let config = NodeConfig::new(listen, seeds);
    let node = Node::new(
        config,
        Arc::new(TcpTransport::new()),
        ban_list,
        Arc::clone(&peer_group),
    );
    let address = node.start().await?;
    info!("Listening at {}", address);

    let _validator = AddressValidator::new(Arc::clone(&node));
    let exchange = PeerExchangeService::new(Arc::clone(&node));
    let broadcaster = Broadcaster::new(Arc::clone(&node));
    let keep_alive = KeepAliveService::new(Arc::clone(&node));

    let store = Arc::new(InMemoryDataStore::new());
    let admission = Arc::new(AdmissionService::new(
        store as Arc<dyn overlay_core::DataStore>,
        Arc::new(StaticAuthorizedKeys::new(authorized)),
    ));
    let _gossip = DataGossipService::new(Arc::clone(&node), admission, broadcaster);

    // Forward node events into the main loop for peer persistence
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let _subscription = node.listeners().subscribe(move |event| {
        let _ = event_tx.send(event);
    });

    match exchange.initial_exchange().await {
        Ok(summary) => info!(
            "Bootstrap exchange: {}/{} succeeded, {} peers discovered",
            summary.succeeded, summary.attempted, summary.peers_added
        ),
        Err(e) => warn!("Bootstrap exchange failed: {}", e),
    }

    info!("Daemon running. Press Ctrl+C to stop.");

    let mut keep_alive_timer =
        tokio::time::interval(Duration::from_secs(args.keep_alive_interval.max(1)));
    loop {
        tokio::select! {
            _ = keep_alive_timer.tick() => {
                keep_alive.run_round().await;
                if peer_group.connected_count() < node.config().target_peer_count {
                    if let Err(e) = exchange.further_exchange().await {
                        debug!("Follow-up exchange: {}", e);
                    }
                }
            }

            Some(event) = event_rx.recv() => {
                match event {
                    NodeEvent::ConnectionOpened(connection) => {
                        if let Some(peer) = connection.peer_address() {
                            if let Err(e) = storage.record(&peer, now_ms()) {
                                warn!("Failed to persist peer {}: {}", peer, e);
                            }
                        }
                    }
                    NodeEvent::ConnectionClosed { connection, reason } => {
                        if reason == CloseReason::AddressValidationFailed
                            && let Some(peer) = connection.peer_address()
                        {
                            let _ = storage.forget(&peer);
                        }
                    }
                    NodeEvent::Message { .. } => {}
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    node.shutdown().await;
    info!("Shutting down");
    Ok(())
}
