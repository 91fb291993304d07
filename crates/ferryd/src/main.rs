//! ferryd — Ferry LAN file-transfer daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use ferry_core::config::{DiscoveryMode, FerryConfig};
use ferry_core::{Direction, SessionStatus};
use ferry_services::{
    new_registry, ChunkStore, InboundHandler, OutboundRunner, PeerRegistry, SchedulerSettings,
    SendOptions, SessionManager, SessionStore, SystemConstraints, TaskScheduler,
};

mod discovery;
mod listener;

use discovery::scan::ScanSettings;
use discovery::{advertise, scan, Identity};

/// Upper bound on establishing an outbound transfer connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });
    config.ensure_device_id();
    let device_id = config
        .identity
        .device_id_bytes()
        .context("device id is not 16 hex-encoded bytes")?;
    let identity = Identity {
        device_id,
        name: config.identity.device_name.clone(),
        port: config.network.listen_port,
    };
    tracing::info!(device_id = %identity.id_hex(), name = %identity.name, "ferryd starting");

    // Storage
    let chunks_dir = config.chunks_dir();
    let outbound_chunks = Arc::new(ChunkStore::open(chunks_dir.join("outbound"))?);
    let inbound_chunks = Arc::new(ChunkStore::open(chunks_dir.join("inbound"))?);
    let session_store = SessionStore::open(config.sessions_dir())?;
    let sessions = Arc::new(SessionManager::new(
        session_store,
        outbound_chunks,
        inbound_chunks.clone(),
    ));
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        sessions = sessions.list().len(),
        "storage ready"
    );

    let registry = new_registry();

    // Scheduler
    let runner = OutboundRunner::new(
        sessions.clone(),
        SendOptions {
            idle_timeout: config.transfer.idle_timeout(),
            speed_limit: config.transfer.speed_limit_bytes_per_sec,
        },
        CONNECT_TIMEOUT,
        config.transfer.max_chunk_retries,
    );
    let scheduler = Arc::new(TaskScheduler::open(
        config.queue_path(),
        Arc::new(runner),
        Box::new(SystemConstraints::from_config(
            &config.scheduler,
            &config.storage.data_dir,
        )),
        SchedulerSettings::from_config(&config.scheduler),
    ));

    // Pick up work a previous run left behind.
    for id in sessions.resume_interrupted() {
        scheduler.enqueue(&id);
    }
    for session in sessions.list() {
        if session.direction == Direction::Outbound && session.status == SessionStatus::Pending {
            scheduler.enqueue(&session.id);
        }
    }

    // Shutdown broadcast
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("shutdown requested");
            let _ = tx.send(());
        });
    }

    // Transfer listener
    let tcp = TcpListener::bind(("0.0.0.0", config.network.listen_port))
        .await
        .with_context(|| format!("failed to bind transfer port {}", config.network.listen_port))?;
    let handler = Arc::new(InboundHandler {
        store: inbound_chunks,
        sessions: sessions.clone(),
        peers: registry.clone(),
        download_dir: config.transfer.download_dir.clone(),
        idle_timeout: config.transfer.idle_timeout(),
        max_chunk_retries: config.transfer.max_chunk_retries,
        device_id: identity.id_hex(),
        device_name: identity.name.clone(),
    });
    let listener_task = tokio::spawn(listener::accept_loop(
        tcp,
        handler,
        shutdown_tx.subscribe(),
    ));

    // Discovery
    let scan_settings = ScanSettings {
        port: config.network.listen_port,
        interval: config.network.refresh_interval(),
        probe_timeout: config.network.probe_timeout(),
        max_concurrent: config.network.max_concurrent_probes,
    };
    if scan::recheck_gap(&scan_settings) >= config.network.peer_timeout() {
        tracing::warn!(
            probe_timeout_ms = scan_settings.probe_timeout.as_millis() as u64,
            peer_timeout_secs = config.network.peer_timeout().as_secs(),
            "probe timeout too long for the eviction window, scanned peers will flap"
        );
    }
    let discovery_task = spawn_discovery(
        config.network.discovery,
        &identity,
        Duration::from_secs(config.network.announce_interval_secs.max(1)),
        scan_settings,
        registry.clone(),
        &shutdown_tx,
    );
    let refresh_task = tokio::spawn(discovery::refresh_loop(
        registry.clone(),
        config.network.refresh_interval(),
        config.network.peer_timeout(),
        shutdown_tx.subscribe(),
    ));

    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_tx.subscribe()));

    let cleanup_task = tokio::spawn(cleanup_loop(
        sessions.clone(),
        config.sessions.retention(),
        Duration::from_secs(config.sessions.cleanup_interval_secs.max(60)),
        shutdown_tx.subscribe(),
    ));

    // HTTP API
    let api_state = ferry_api::ApiState {
        sessions,
        scheduler,
        registry,
        device_id: identity.id_hex(),
        device_name: identity.name.clone(),
        listen_port: config.network.listen_port,
        chunk_size: config.transfer.chunk_size_override(),
        retention: config.sessions.retention(),
        started_at: Instant::now(),
    };
    let api_task = tokio::spawn(ferry_api::serve(api_state, config.network.api_port));

    tracing::info!(
        listen_port = config.network.listen_port,
        api_port = config.network.api_port,
        discovery = ?config.network.discovery,
        "ferryd running"
    );

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        r = listener_task => tracing::error!(result = ?r, "transfer listener exited"),
        r = refresh_task => tracing::error!(result = ?r, "peer refresh exited"),
        r = scheduler_task => tracing::error!(result = ?r, "scheduler exited"),
        r = cleanup_task => tracing::error!(result = ?r, "session cleanup exited"),
        r = api_task => tracing::error!(result = ?r, "API server exited"),
    }

    // Stop everything else and give the advertiser a moment for GOODBYE.
    let _ = shutdown_tx.send(());
    for task in discovery_task {
        match tokio::time::timeout(Duration::from_secs(2), task).await {
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "discovery shutdown"),
            Ok(_) => {}
            Err(_) => tracing::warn!("discovery did not stop in time"),
        }
    }

    tracing::info!("ferryd stopped");
    Ok(())
}

type DiscoveryTask = tokio::task::JoinHandle<Result<()>>;

/// Start multicast discovery, or the subnet scan when multicast is off or
/// its sockets cannot be opened.
fn spawn_discovery(
    mode: DiscoveryMode,
    identity: &Identity,
    announce_interval: Duration,
    scan_settings: ScanSettings,
    registry: Arc<PeerRegistry>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<DiscoveryTask> {
    if mode == DiscoveryMode::Broadcast {
        match advertise::make_socket().and_then(|tx| Ok((tx, discovery::listener::make_socket()?))) {
            Ok((tx, rx)) => {
                return vec![
                    tokio::spawn(advertise::advertise_loop(
                        tx,
                        identity.clone(),
                        announce_interval,
                        shutdown.subscribe(),
                    )),
                    tokio::spawn(discovery::listener::listen_loop(
                        rx,
                        registry,
                        identity.id_hex(),
                        shutdown.subscribe(),
                    )),
                ];
            }
            Err(e) => {
                tracing::warn!(error = %e, "multicast discovery unavailable, falling back to subnet scan");
                registry.report_error(format!("multicast discovery unavailable: {e}"));
            }
        }
    }

    vec![tokio::spawn(scan::scan_loop(
        registry,
        identity.id_hex(),
        scan_settings,
        shutdown.subscribe(),
    ))]
}

/// Purge finished sessions older than `retention` every `interval`.
async fn cleanup_loop(
    sessions: Arc<SessionManager>,
    retention: Duration,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                let removed = sessions.cleanup(retention);
                if removed > 0 {
                    tracing::info!(removed, "expired sessions cleaned up");
                }
            }
        }
    }
}
