// Courier service main entry point.
use anyhow::{Context, Result};
use courier::config::CourierConfig;
use courier::{observability, server, shard};
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier")?;
    let config = CourierConfig::from_env_or_yaml()?;

    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let (shard, shard_task) = shard::spawn_shard(&config);
    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("bind long-poll listener {}", config.http_bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        multimsg = config.longpoll.multimsg,
        timeout_secs = config.longpoll.subscriber_timeout_secs,
        "long-poll listener started"
    );

    // Block until SIGINT; in-flight long-polls are answered before exit.
    axum::serve(listener, server::router(shard).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve long-poll http")?;
    shard_task.abort();
    tracing::info!("courier stopped");
    Ok(())
}
