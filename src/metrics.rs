//! Prometheus `/metrics` side channel, kept as an ambient operational
//! surface alongside the `.log`/`.txt`/`.ctx` reports §6 requires. Scenario
//! metrics from the teacher's YAML-scenario layer are dropped (no spec
//! counterpart); response-class and byte counters below mirror the columns
//! the report writer also emits.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "smoothloader".to_string());

    pub static ref REQUESTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of HTTP requests made")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RESPONSE_CLASSES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("response_classes_total", "Number of responses by status class")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["class"]
        ).unwrap();

    pub static ref TRANSFER_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("transfer_errors_total", "Number of failed transfers by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref CONCURRENT_CLIENTS: Gauge =
        Gauge::with_opts(
            Opts::new("concurrent_clients", "Number of simulated clients currently attached to the transfer engine")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref BYTES_IN_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("bytes_in_total", "Total response bytes received")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref BYTES_OUT_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("bytes_out_total", "Total request bytes sent")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref HISTOGRAM_LABELS_EVICTED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("histogram_labels_evicted_total", "Number of per-URL percentile labels evicted by the LRU cap")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(REQUESTS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(RESPONSE_CLASSES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(TRANSFER_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(CONCURRENT_CLIENTS.clone()))?;
    prometheus::default_registry().register(Box::new(BYTES_IN_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(BYTES_OUT_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(HISTOGRAM_LABELS_EVICTED_TOTAL.clone()))?;
    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port, %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "failed to encode metrics as UTF-8");
        String::from("# error encoding metrics as utf-8")
    })
}
