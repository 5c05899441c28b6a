//! Shared Prometheus wiring: a recorder, a `/metrics` router, and an axum
//! middleware recording request count and latency by method/path/status.
//!
//! Each binary crate mounts `setup_metrics_router()` alongside its own
//! routes and wraps its router in `track_metrics`; per-component gauges
//! (queue depth, cache hit rate, ...) are recorded at the call site with
//! the plain `metrics::counter!`/`gauge!`/`histogram!` macros.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Builds a `Router` serving `/metrics` from a freshly installed recorder.
/// Callers merge this into their own router rather than binding it
/// separately, matching the teacher's single-port pattern.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording `http_requests_total` and
/// `http_requests_duration_seconds`, labelled by method, matched route, and
/// status code. Someday tower-http might ship this; until then it's a thin
/// `axum::middleware::from_fn` layer.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

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
