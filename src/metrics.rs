//! Prometheus metrics for the replicated store (spec §5/§7 ambient
//! observability — not itself named by spec.md, carried forward per
//! SPEC_FULL.md §0/§2 as the teacher's ambient stack).
//!
//! Same shape as the teacher's own `metrics.rs`: `lazy_static` counters and
//! gauges registered with the default Prometheus registry, served over a
//! bare `hyper` endpoint. The label set is generalized from per-HTTP-request
//! metrics to per-partition Raft/store metrics.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, TextEncoder};
use std::env;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "raftkv".to_string());

    /// Highest Raft log index applied to the state machine, per partition.
    pub static ref APPLIED_INDEX: GaugeVec =
        GaugeVec::new(
            Opts::new("applied_index", "Highest Raft log index applied to the state machine")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["cluster_id", "node_id"]
        ).unwrap();

    /// `UpdateRequest`/`LookupRequest` outcomes, per partition.
    pub static ref REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_total", "Update/Lookup requests served")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["cluster_id", "node_id", "kind", "result"] // kind: update|lookup, result: ok|error
        ).unwrap();

    /// `Store::set`/`delete` calls that hit the `TxnTooBig` commit-and-retry
    /// path (spec §4.2).
    pub static ref TXN_TOO_BIG_RETRIES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("txn_too_big_retries_total", "Store operations retried after a too-big transaction")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["cluster_id", "node_id"]
        ).unwrap();

    /// Background store compaction runs (spec §4.2 value-log GC).
    pub static ref GC_RUNS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("gc_runs_total", "Store compaction loop iterations")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["cluster_id", "node_id", "result"] // result: reclaimed|idle|error
        ).unwrap();

    /// Events enqueued into the `EventPump` (spec §4.5).
    pub static ref EVENT_PUMP_QUEUE_DEPTH: Gauge =
        Gauge::with_opts(
            Opts::new("event_pump_queue_depth", "Approximate pending events across all partitions' event pumps")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry. Safe to call
/// once at startup; a second call returns an `AlreadyReg` error from the
/// registry, which callers should treat as fatal (a composition-root bug,
/// not a runtime condition).
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(APPLIED_INDEX.clone()))?;
    registry.register(Box::new(REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(TXN_TOO_BIG_RETRIES.clone()))?;
    registry.register(Box::new(GC_RUNS_TOTAL.clone()))?;
    registry.register(Box::new(EVENT_PUMP_QUEUE_DEPTH.clone()))?;
    Ok(())
}

async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Starts the Prometheus scrape endpoint. Runs until the process exits;
/// callers spawn this as a background task.
pub async fn start_metrics_server(port: u16) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, hyper::Error>(service_fn(metrics_handler))
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port, "metrics server listening");
    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_carry_namespace() {
        assert_eq!(APPLIED_INDEX.desc()[0].fq_name, "raftkv_applied_index");
    }
}
