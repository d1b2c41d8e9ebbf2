//! Zyte API crawler
//!
//! Single-binary crawl runner that:
//! 1. Loads start requests and session settings from TOML
//! 2. Fetches them through the Zyte API with per-domain session pools
//! 3. Optionally serves /health and /metrics while crawling
//! 4. Prints the close reason and crawl stats as JSON on exit

mod config;
mod crawler;
mod downloader;
mod error;
mod metrics;
#[cfg(test)]
mod mock_api;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zyte_api::{ClientConfig, HttpTransport};
use zyte_session::CloseReason;

use crate::config::Config;
use crate::crawler::Crawler;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting zyte-crawler");

    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let Some(api_key) = config.api.key.clone() else {
        anyhow::bail!("no API key configured, set ZYTE_API_KEY or api.key_file");
    };

    let requests = config.crawl.start_requests()?;
    info!(
        api_url = %config.api.url,
        start_requests = requests.len(),
        sessions_enabled = config.sessions.enabled.unwrap_or(false),
        "configuration loaded"
    );

    let transport = Arc::new(HttpTransport::new(ClientConfig {
        api_url: config.api.url.clone(),
        api_key,
        timeout: config.api.timeout(),
    }));
    info!(endpoint = %transport.endpoint(), "API client ready");
    let crawler = Crawler::new(config.crawl.options(), config.sessions.clone(), transport)
        .context("invalid session settings")?;

    // Optional observability listener, stopped once the crawl is over
    let (server_stop_tx, server_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = match config.metrics.listen_addr {
        Some(addr) => {
            let app = server::build_router(AppState {
                prometheus: prometheus_handle,
                sessions: crawler.sessions().clone(),
            });
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind to {addr}"))?;
            info!(addr = %addr, "serving /health and /metrics");
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = server_stop_rx.await;
                    })
                    .await
            }))
        }
        None => None,
    };

    // A signal stops dispatching; in-flight requests still drain
    let close = crawler.close_handle().clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        close.close(CloseReason::Shutdown);
    });

    let report = crawler.run(requests).await;
    signal_task.abort();

    let _ = server_stop_tx.send(());
    if let Some(handle) = server_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "metrics server error"),
            Err(e) => error!(error = %e, "metrics server task panicked"),
        }
    }

    if report.reason != CloseReason::Finished.as_str() {
        warn!(reason = %report.reason, "crawl closed early");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, closing the crawl"),
        _ = terminate => info!("received SIGTERM, closing the crawl"),
    }
}
