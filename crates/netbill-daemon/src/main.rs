//! netbill - Main Entry Point

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use netbill_daemon::{build_router, DaemonConfig, Netbill};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("netbill v{}", env!("CARGO_PKG_VERSION"));

    let config_path =
        std::env::var("NETBILL_CONFIG").unwrap_or_else(|_| "/etc/netbill/netbill.json".into());
    let config = DaemonConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "config not loaded, using defaults");
        DaemonConfig::default()
    });

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().context("invalid metrics_addr")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let mut netbill = Netbill::build(&config).await?;
    let background = netbill
        .start()
        .context("background tasks already started")?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "HTTP API listening");

    axum::serve(listener, build_router(netbill.state()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    background.stop(netbill).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
