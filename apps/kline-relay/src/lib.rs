#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::items_after_statements
    )
)]

//! Kline Relay - Polled Market Data Normalizer
//!
//! Polls a quote gateway for candlestick bars, reconciles overlapping polls
//! into a gap-free, duplicate-free live event stream, and serves paginated
//! historical range queries over the same upstream.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and state machines
//!   - `market`: Symbols, bars, timeframes, raw windows and events
//!   - `reconcile`: Live poll reconciliation
//!   - `pagination`: History page planning and stitching
//!
//! - **Application**: Services and port definitions
//!   - `ports`: `MarketAdapter` and `BarStore`
//!   - `services`: Streaming orchestration, polling, history, retry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `tdx`: HTTP gateway adapter
//!   - `simulated`: In-memory scripted/generated market
//!   - `cache`: Caching decorator and in-memory bar store
//!   - `broadcast`: Per-symbol topics fed from the event queue
//!   - `http`: Method surface, SSE, health and metrics
//!   - `config`, `metrics`, `telemetry`: Runtime plumbing
//!
//! # Data Flow
//!
//! ```text
//!                 ┌───────────────┐  RawWindow  ┌─────────────┐
//! Quote gateway ─►│ MarketAdapter │────────────►│ SymbolTask  │─┐ (one per symbol)
//!                 └───────────────┘             └─────────────┘ │
//!                         ▲                                     ▼
//!                         │ get_kline_histories          bounded mpsc queue
//!                         │                                     │
//!                 ┌───────────────┐                      ┌─────────────┐
//!  POST /rpc ────►│ StreamingSvc  │                      │  TopicHub   │──► GET /stream/{symbol}
//!                 └───────────────┘                      └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Kline types and pure algorithms with no I/O.
pub mod domain;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::pagination::HistoryQuery;
pub use domain::{Bar, EventKind, KlineEvent, MarketError, RawWindow, Symbol, Timeframe};

// Ports
pub use application::ports::{BarStore, HistorySettings, MarketAdapter, WatchOptions};

// Services
pub use application::services::{RetryConfig, ServiceError, StreamSettings, StreamingService};

// Adapters
pub use infrastructure::cache::{CachedMarket, InMemoryBarStore};
pub use infrastructure::simulated::{SimulatedMarket, Step};
pub use infrastructure::tdx::{TdxConfig, TdxMarket};

// Publisher
pub use infrastructure::broadcast::{SharedTopicHub, TopicHub, TopicStats};

// HTTP server
pub use infrastructure::http::{HttpServer, HttpServerError, HttpServerState};

// Config
pub use infrastructure::config::{
    CacheSettings, ConfigError, RelayConfig, ServerSettings, SourceKind, TdxSettings,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
