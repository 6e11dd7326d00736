//! Tracing and metrics setup for the courier service.
//!
//! Installs an env-filtered fmt subscriber and a Prometheus recorder, and
//! serves `/metrics`, `/live` and `/ready` on a separate listener.
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and metrics for the service.
///
/// `RUST_LOG` drives the filter; unset or invalid falls back to `info`.
/// Returns the handle used to render the Prometheus exposition.
pub fn init_observability(service_name: &str) -> anyhow::Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    let handle = install_metrics_recorder()?;
    tracing::info!(service = service_name, "observability initialized");
    Ok(handle)
}

pub fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, metrics_router(handle).into_make_service()).await
}

// Tests share one process-wide recorder.
fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new().install_recorder()?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        Ok(PrometheusBuilder::new().install_recorder()?)
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = subscriber.try_init();
}
