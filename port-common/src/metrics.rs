use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const INGEST_RUNS: &str = "port_ingest_runs_total";
pub const INGEST_UPSERTS: &str = "port_ingest_upserts_total";
pub const INGEST_DROPPED_ERRORS: &str = "port_ingest_dropped_errors_total";
pub const INGEST_DURATION: &str = "port_ingest_duration_seconds";
pub const INGEST_WORKER_SATURATION: &str = "port_ingest_worker_saturation_percent";

/// Install a global Prometheus recorder and return the handle used to render it.
/// Fails if a recorder was already installed in this process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()?;

    describe_ingest_metrics();

    Ok(handle)
}

fn describe_ingest_metrics() {
    metrics::describe_counter!(INGEST_RUNS, "Ingestion runs, labelled by outcome");
    metrics::describe_counter!(
        INGEST_UPSERTS,
        "Records handled by upsert tasks, labelled by outcome"
    );
    metrics::describe_counter!(
        INGEST_DROPPED_ERRORS,
        "Errors observed after a run had already failed"
    );
    metrics::describe_histogram!(INGEST_DURATION, "Wall time of a single ingestion run");
    metrics::describe_gauge!(
        INGEST_WORKER_SATURATION,
        "Share of upsert worker slots in use"
    );
}

/// Middleware to record some common HTTP metrics
/// Someday tower-http might provide a metrics middleware: https://github.com/tower-rs/tower-http/issues/57
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
