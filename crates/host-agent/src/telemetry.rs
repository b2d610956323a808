use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Router, http::StatusCode, routing::get};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    )
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// `result`: `update`, `current`, or `error`.
pub fn record_poll_result(result: &str) {
    counter!(
        "host_agent_polls_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// `result`: `success`, `failed`, or `not_visible`.
pub fn record_apply_result(result: &str) {
    counter!(
        "host_agent_applies_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_applied_version(version: u64) {
    gauge!("host_agent_applied_version").set(version as f64);
}
