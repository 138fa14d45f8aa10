//! Market Adapter Port (Driven Port)
//!
//! Interface every upstream quote source implements. Concrete sources only
//! supply connectivity and a raw bounded-window fetch; the live raw-window
//! stream and the paginated history query are provided on top of that and
//! may be overridden by decorators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::application::services::retry::RetryConfig;
use crate::application::services::{history, polling};
use crate::domain::pagination::HistoryQuery;
use crate::domain::{Bar, MarketError, RawWindow, Symbol, Timeframe};

/// Stream of raw two-bar samples produced by [`MarketAdapter::watch_raw`].
pub type RawWindowStream = BoxStream<'static, Result<RawWindow, MarketError>>;

/// Polling parameters for the live path.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Bars requested per poll (at least two are used).
    pub lookback: usize,
    /// Backoff applied to transient fetch failures.
    pub retry: RetryConfig,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lookback: 10,
            retry: RetryConfig::default().unlimited(),
        }
    }
}

/// Paging parameters for history queries.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySettings {
    /// Bars requested per page.
    pub page_size: usize,
    /// Upper bound on pages walked by a `from_ts` query.
    pub max_pages: usize,
    /// Backoff applied to each page.
    pub retry: RetryConfig,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            page_size: 700,
            max_pages: 1000,
            retry: RetryConfig::default(),
        }
    }
}

/// Upstream quote source.
#[async_trait]
pub trait MarketAdapter: Send + Sync + 'static {
    /// Short label for logs and metrics.
    fn name(&self) -> &str;

    /// Establish upstream connectivity. Calling it again is a no-op.
    async fn connect(&self) -> Result<(), MarketError>;

    /// Release upstream connectivity. Safe to call when never connected.
    async fn disconnect(&self);

    /// Fetch up to `count` bars starting `offset` bars back from the most
    /// recent one, most-recent-first.
    async fn fetch_window(
        &self,
        timeframe: Timeframe,
        symbol: &Symbol,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Bar>, MarketError>;

    /// Poll the two most recent bars until cancelled.
    ///
    /// The stream is lazy and cannot be restarted. It ends silently on
    /// cancellation and after yielding a permanent error.
    fn watch_raw(
        self: Arc<Self>,
        timeframe: Timeframe,
        symbol: Symbol,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> RawWindowStream {
        polling::raw_windows(self, timeframe, symbol, options, cancel)
    }

    /// Bars in the queried range, ascending.
    async fn get_kline_histories(
        &self,
        symbol: &Symbol,
        query: HistoryQuery,
        settings: &HistorySettings,
    ) -> Result<Vec<Bar>, MarketError> {
        history::paginate(self, symbol, query, settings).await
    }
}
