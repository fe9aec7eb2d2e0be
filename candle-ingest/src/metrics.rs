use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;

use crate::health::HealthRegistry;

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

/// Build the router for the health and scrape endpoints.
pub fn router(liveness: HealthRegistry, recorder_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(move || ready(liveness.get_status())))
        .route("/metrics", get(move || ready(recorder_handle.render())))
}

/// Serve a `Router` on an already-bound listener. Binding stays with the
/// supervisor so an occupied port fails startup instead of a background task.
pub async fn serve(router: Router, listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await?;

    Ok(())
}
