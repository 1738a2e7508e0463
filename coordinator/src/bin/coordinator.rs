//! Group playback sync simulation - CLI binary.
//!
//! Runs several simulated clients with skewed clocks against an in-process
//! relay, starts group playback and reports how far each client ended up
//! from the group timeline.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use coordinator::sim::{SimPlayer, SimServer};
use coordinator::{
    run_coordinator, CoordinatorDeps, DriverInputs, PeerDeps, SyncConfig, SyncCoordinator,
};
use groupsync_common::protocol::OutboundMessage;
use groupsync_common::time::{ticks_to_ms, SkewedClock};
use groupsync_common::{
    init_tracing, Clock, ColorWhen, MetricsContext, MetricsServerConfig, SettingsStore,
    SystemClock, TimeSource, DEFAULT_LOG_FILTER,
};
use peer::MemoryNetwork;
use rand::Rng;

/// Group playback sync simulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Number of simulated clients
    #[arg(short, long, default_value = "3")]
    clients: usize,

    /// How long the group plays before the report (seconds)
    #[arg(short, long, default_value = "20")]
    duration_secs: u64,

    /// Largest client clock skew in either direction (ms)
    #[arg(long, default_value = "250")]
    max_skew_ms: i64,

    /// One-way latency of time probes (ms)
    #[arg(long, default_value = "30")]
    latency_ms: u64,

    /// Extra random latency per direction (ms)
    #[arg(long, default_value = "20")]
    jitter_ms: u64,

    /// Largest playhead speed error, e.g. 0.01 for 1%
    #[arg(long, default_value = "0.005")]
    max_speed_error: f64,

    /// Settings file (JSON object of string keys and values)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Open peer links between the clients
    #[arg(long)]
    peer_links: bool,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

const GROUP_ID: &str = "living-room";
const ITEM_ID: &str = "item-1";

struct Client {
    // ---
    id: String,
    skew_ms: i64,
    player: SimPlayer,
    shutdown: oneshot::Sender<()>,
    ticker: JoinHandle<()>,
    task: JoinHandle<Result<SyncCoordinator>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color, DEFAULT_LOG_FILTER)?;
    info!("Starting group sync simulation v{VERSION}");
    info!("Clients: {}, skew up to ±{}ms", args.clients, args.max_skew_ms);
    info!(
        "Probe latency: {}ms + up to {}ms jitter",
        args.latency_ms, args.jitter_ms
    );

    let metrics = MetricsContext::new("coordinator")?;
    if let Some(bind) = &args.metrics_bind {
        let bind: SocketAddr = bind.parse().context("invalid metrics bind")?;
        let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(bind));
        info!("Metrics bind: {}", bind);
    }

    let settings = match &args.settings {
        Some(path) => SettingsStore::load(path)?,
        None => SettingsStore::in_memory(),
    };
    let mut config = SyncConfig::from_settings(&settings);
    config.enable_peer_links |= args.peer_links;

    let base: Arc<dyn Clock> = Arc::new(SystemClock);
    let server = SimServer::new(Arc::clone(&base), args.latency_ms, args.jitter_ms);
    let network = MemoryNetwork::new();

    let mut clients = Vec::with_capacity(args.clients);
    for i in 0..args.clients {
        let (skew_ms, speed) = {
            let mut rng = rand::thread_rng();
            let skew = rng.gen_range(-args.max_skew_ms..=args.max_skew_ms);
            let error = rng.gen_range(-args.max_speed_error..=args.max_speed_error);
            (skew, 1.0 + error)
        };
        let id = format!("client-{i}");
        let clock: Arc<dyn Clock> = Arc::new(SkewedClock::new(Arc::clone(&base), skew_ms));

        let player = SimPlayer::new(Arc::clone(&clock), Some(format!("session-{i}")));
        player.set_natural_speed(speed);

        let (relay_inbound, relay) = server.connect(&id);
        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();

        let mut client_config = config.clone();
        client_config.display_name = id.clone();

        let mut coordinator = SyncCoordinator::new(CoordinatorDeps {
            clock,
            relay,
            player_events: player_tx,
            metrics: metrics.clone(),
            config: client_config,
            peers: Some(PeerDeps {
                local_id: id.clone(),
                factory: Arc::new(network.clone()),
                engine_events: engine_tx,
            }),
        });
        coordinator.bind_player(Box::new(player.clone()));

        let inputs = DriverInputs {
            relay_inbound,
            player_events: player_rx,
            engine_events: Some(engine_rx),
            settings_changes: Some(settings.subscribe()),
        };
        let time_source: Arc<dyn TimeSource> = Arc::new(server.clone());
        let (shutdown, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            run_coordinator(&mut coordinator, time_source, inputs, shutdown_rx).await?;
            Ok::<_, anyhow::Error>(coordinator)
        });

        let ticking = player.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                ticking.tick();
            }
        });

        info!("{}: clock skew {:+}ms, speed {:.4}", id, skew_ms, speed);
        clients.push(Client {
            id,
            skew_ms,
            player,
            shutdown,
            ticker,
            task,
        });
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Preparing group {} with {}", GROUP_ID, ITEM_ID);
    server.prepare_session(GROUP_ID, ITEM_ID);

    // Let every client get a first clock estimate
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("client-0 presses play");
    server.handle("client-0", OutboundMessage::RequestPlay);

    tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;

    let group_ms = ticks_to_ms(server.group_position());
    info!("Group position: {:.0}ms", group_ms);
    for client in &clients {
        let drift = group_ms - ticks_to_ms(client.player.position());
        info!(
            "{}: skew {:+}ms, drift {:+.1}ms, reported ping {}",
            client.id,
            client.skew_ms,
            drift,
            server
                .reported_ping(&client.id)
                .map(|p| format!("{p}ms"))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }

    for client in clients {
        client.ticker.abort();
        let _ = client.shutdown.send(());
        match client.task.await {
            Ok(Ok(coordinator)) => {
                let stats = coordinator.stats();
                info!(
                    "{}: {} commands, {} speed / {} skip corrections, {} peers",
                    client.id,
                    stats.commands_applied,
                    stats.speed_corrections,
                    stats.skip_corrections,
                    coordinator.peer_stats().len()
                );
            }
            Ok(Err(e)) => warn!("{}: coordinator failed: {:#}", client.id, e),
            Err(e) => warn!("{}: coordinator task panicked: {}", client.id, e),
        }
    }

    Ok(())
}
