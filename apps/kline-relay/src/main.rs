//! Kline Relay Binary
//!
//! Starts live kline streaming and the HTTP surface.
//!
//! # Usage
//!
//! ```bash
//! KLINE_SYMBOLS=SHFE.cu2401,DCE.m2405 TDX_HOST=http://10.0.0.5:7709 cargo run --bin kline-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KLINE_SYMBOLS`: Comma-separated dotted symbols
//! - `TDX_HOST`: Quote gateway base URL (when `KLINE_SOURCE=tdx`)
//!
//! ## Optional
//! - `KLINE_SOURCE`: tdx | simulated (default: tdx)
//! - `KLINE_TIMEFRAME`: Live bar minutes (default: 1)
//! - `KLINE_POLL_INTERVAL_MS`: Live poll interval (default: 1000)
//! - `KLINE_CACHE_ENABLED`: Serve history from the bar cache (default: false)
//! - `KLINE_HTTP_PORT`: HTTP port (default: 8090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `RUST_LOG`: Log filter (default: kline_relay=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use kline_relay::infrastructure::http::{HttpServer, HttpServerState};
use kline_relay::infrastructure::telemetry;
use kline_relay::{
    CachedMarket, InMemoryBarStore, MarketAdapter, RelayConfig, SimulatedMarket, SourceKind,
    StreamingService, TdxConfig, TdxMarket, TopicHub, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for the publisher to drain the queue after streaming stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Closed bars seeded per symbol by the simulated source.
const SIMULATED_HISTORY: usize = 2_000;

/// Polls per simulated bar before it closes.
const SIMULATED_POLLS_PER_BAR: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting kline relay");

    let _metrics_handle = init_metrics()?;

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let adapter = build_adapter(&config)?;
    let hub = Arc::new(TopicHub::new(config.server.topic_capacity));
    let service = Arc::new(StreamingService::new(
        adapter,
        config.symbols.clone(),
        config.stream.clone(),
    ));

    let queue = service.start().await.context("failed to start streaming")?;

    let publisher_hub = Arc::clone(&hub);
    let publisher = tokio::spawn(async move {
        publisher_hub
            .run_publisher(queue, CancellationToken::new())
            .await
    });

    let http_token = CancellationToken::new();
    let http_state = Arc::new(HttpServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&service),
        Arc::clone(&hub),
    ));
    let http_server = HttpServer::new(config.server.http_port, http_state, http_token.clone());
    let http = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Kline relay ready");

    await_shutdown().await;

    service.stop().await;
    match tokio::time::timeout(DRAIN_TIMEOUT, publisher).await {
        Ok(Ok(published)) => tracing::info!(published, "Event queue drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "Publisher task failed"),
        Err(_) => tracing::warn!("Event queue not drained in time"),
    }

    http_token.cancel();
    if let Err(e) = http.await {
        tracing::error!(error = %e, "HTTP server task failed");
    }

    tracing::info!("Kline relay stopped");
    Ok(())
}

/// Construct the configured upstream, optionally behind the cache.
fn build_adapter(config: &RelayConfig) -> anyhow::Result<Arc<dyn MarketAdapter>> {
    let source: Arc<dyn MarketAdapter> = match config.source {
        SourceKind::Tdx => {
            let tdx = config
                .tdx
                .as_ref()
                .context("TDX_HOST is required for the tdx source")?;
            Arc::new(TdxMarket::new(TdxConfig {
                host: tdx.host.clone(),
                request_timeout: tdx.request_timeout,
            })?)
        }
        SourceKind::Simulated => {
            let period = config.stream.timeframe.period_ms();
            let now = Utc::now().timestamp_millis();
            Arc::new(SimulatedMarket::generated(
                &config.symbols,
                config.stream.timeframe,
                SIMULATED_HISTORY,
                SIMULATED_POLLS_PER_BAR,
                now - now.rem_euclid(period),
            ))
        }
    };

    if !config.cache.enabled {
        return Ok(source);
    }
    tracing::info!(warmup_limit = config.cache.warmup_limit, "Bar cache enabled");
    Ok(Arc::new(CachedMarket::new(
        source,
        Arc::new(InMemoryBarStore::new()),
        config.cache.warmup_limit,
    )))
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        source = config.source.as_str(),
        symbols = config.symbols.len(),
        timeframe = %config.stream.timeframe,
        http_port = config.server.http_port,
        cache = config.cache.enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        poll_interval_ms = config.stream.watch.poll_interval.as_millis(),
        lookback = config.stream.watch.lookback,
        queue_capacity = config.stream.queue_capacity,
        page_size = config.stream.history.page_size,
        max_pages = config.stream.history.max_pages,
        "Streaming settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
