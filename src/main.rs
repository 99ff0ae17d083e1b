//! Composition root: loads configuration, opens the embedded store, starts
//! the Raft partition, and serves it over gRPC (spec §5/§6).
//!
//! Thin by design — the teacher's own `main.rs` is a flat `#[tokio::main]`
//! that wires config, a metrics server, and a worker pool together with no
//! business logic of its own; this keeps that shape, swapping the worker
//! pool for a `Cluster`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use raftkv::cluster::{Cluster, ClusterTuning};
use raftkv::config::Config;
use raftkv::grpc::RaftKvService;
use raftkv::metrics;
use raftkv::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    // `Config::from_env` already validates before returning.
    let config = Config::from_env()?;
    config.print_summary();

    metrics::register_metrics().map_err(|e| format!("failed to register metrics: {e}"))?;

    let store = Store::open(&config.store_dir, config.max_txn_bytes)?;
    store.spawn_gc_loop(
        config.gc_interval,
        config.gc_sleep,
        config.cluster_id,
        config.node_id,
    );

    let bootstrap: BTreeMap<u64, String> = config.bootstrap_nodes.iter().cloned().collect();
    let tuning = ClusterTuning {
        election_rtt: config.election_rtt,
        heartbeat_rtt: config.heartbeat_rtt,
        check_quorum: config.check_quorum,
        snapshot_entries: config.snapshot_entries,
        compaction_overhead: config.compaction_overhead,
    };

    let cluster = Cluster::start(
        config.cluster_id,
        Some(config.node_id),
        &config.raft_address,
        bootstrap,
        store.clone(),
        tuning,
        None,
    )
    .await
    .map_err(|e| format!("failed to start cluster: {e}"))?;
    let cluster = Arc::new(cluster);

    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
    tokio::spawn(metrics::start_metrics_server(metrics_port));

    let listen_addr = config.listen_address.parse()?;
    let service = RaftKvService::new(cluster.clone()).into_server();

    info!(addr = %listen_addr, "raft gRPC server listening");
    Server::builder()
        .add_service(service)
        .serve_with_shutdown(listen_addr, shutdown_signal())
        .await?;

    info!("shutting down");
    store.stop_gc_loop();
    if let Err(e) = cluster.node_host().shutdown().await {
        error!(error = %e, "raft shutdown reported an error");
    }
    // No more applies can happen once Raft is shut down, so draining the
    // event pump here sees a final, settled queue.
    cluster.close_event_pump().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
