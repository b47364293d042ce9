//! Prometheus Metrics for Harvest Runs
//!
//! Metrics include:
//! - pages fetched per source and outcome
//! - fetch latency per source (histogram)
//! - fetch errors per error kind
//! - contacts admitted and rejected
//! - circuit trips and purges

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramOpts, HistogramVec,
    IntCounterVec, TextEncoder,
};
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

static PAGES_FETCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvester_pages_total",
        "Pages processed per source by outcome",
        &["source", "outcome"]
    )
    .expect("Failed to create pages_total metric")
});

static FETCH_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "harvester_fetch_latency_seconds",
            "Latency of page loads in seconds, retries included"
        )
        .buckets(buckets),
        &["source"]
    )
    .expect("Failed to create fetch_latency metric")
});

static FETCH_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvester_fetch_errors_total",
        "Fetch and extraction errors by kind",
        &["source", "kind"]
    )
    .expect("Failed to create fetch_errors metric")
});

static CONTACTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvester_contacts_total",
        "Candidate records by admission result",
        &["source", "result"]
    )
    .expect("Failed to create contacts metric")
});

static CIRCUIT_TRIPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvester_circuit_trips_total",
        "Number of circuit trips",
        &["source"]
    )
    .expect("Failed to create circuit_trips metric")
});

static PURGED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvester_purged_contacts_total",
        "Contacts deleted by trip purges",
        &["source"]
    )
    .expect("Failed to create purged metric")
});

static RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvester_runs_total",
        "Finished source runs by outcome",
        &["source", "outcome"]
    )
    .expect("Failed to create runs metric")
});

// ============================================
// METRICS API
// ============================================

/// Records a processed page ("productive", "empty", "failed")
pub fn record_page(source: &str, outcome: &str) {
    PAGES_FETCHED.with_label_values(&[source, outcome]).inc();
}

pub fn record_fetch_latency(source: &str, latency_secs: f64) {
    FETCH_LATENCY.with_label_values(&[source]).observe(latency_secs);
}

pub fn record_error(source: &str, kind: &str) {
    FETCH_ERRORS.with_label_values(&[source, kind]).inc();
}

/// Records admission results ("admitted", "duplicate", "invalid")
pub fn record_contacts(source: &str, result: &str, count: u64) {
    if count > 0 {
        CONTACTS.with_label_values(&[source, result]).inc_by(count);
    }
}

pub fn record_circuit_trip(source: &str, purged: u64) {
    CIRCUIT_TRIPS.with_label_values(&[source]).inc();
    PURGED.with_label_values(&[source]).inc_by(purged);
}

pub fn record_run(source: &str, outcome: &str) {
    RUNS.with_label_values(&[source, outcome]).inc();
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// Observes fetch latency when dropped
pub struct FetchTimer<'a> {
    source: &'a str,
    start: std::time::Instant,
}

impl<'a> FetchTimer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for FetchTimer<'_> {
    fn drop(&mut self) {
        record_fetch_latency(self.source, self.start.elapsed().as_secs_f64());
    }
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Starts the metrics HTTP server
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}
