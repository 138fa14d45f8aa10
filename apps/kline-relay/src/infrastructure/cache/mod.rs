//! Caching Market Decorator
//!
//! [`CachedMarket`] wraps another adapter and a [`BarStore`] of 1-minute
//! bars. History queries are answered from the store after bringing it up to
//! date; coarser timeframes are aggregated from the stored minutes. Live
//! 1-minute windows are written through as they are observed.
//!
//! # Store Sync
//!
//! Before answering, a symbol's store is caught up from the upstream: from
//! the newest stored bar when there is one, otherwise the most recent
//! `warmup_limit` bars. Symbols being watched at 1-minute granularity are
//! synced once and then kept current by the live path. A gap or error on the
//! live path drops the symbol back to syncing, resuming from the last bar
//! written before the hole.
//!
//! # Coverage
//!
//! The store only answers for spans it holds in full. A `from_ts` older than
//! the covered span, or a `limit` beyond the stored minutes, is backfilled
//! from the upstream first. Once the upstream has served less than asked,
//! its whole history is stored and no further backfill is attempted.

mod memory;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{
    BarStore, HistorySettings, MarketAdapter, RawWindowStream, WatchOptions,
};
use crate::domain::pagination::HistoryQuery;
use crate::domain::{Bar, MarketError, Symbol, Timeframe};

pub use memory::InMemoryBarStore;

/// Coverage of a symbol whose entire upstream history is stored.
const FULL_HISTORY: i64 = i64::MIN;

/// Adapter decorator serving history from a bar store.
pub struct CachedMarket {
    inner: Arc<dyn MarketAdapter>,
    store: Arc<dyn BarStore>,
    warmup_limit: usize,
    watched: Mutex<HashSet<Symbol>>,
    synced: Mutex<HashSet<Symbol>>,
    /// Earliest timestamp from which the store holds every upstream bar.
    covered_from: Mutex<HashMap<Symbol, i64>>,
    /// Last bar written before a live-path hole.
    resume_from: Mutex<HashMap<Symbol, i64>>,
}

impl CachedMarket {
    /// Wrap `inner`, caching into `store`.
    #[must_use]
    pub fn new(inner: Arc<dyn MarketAdapter>, store: Arc<dyn BarStore>, warmup_limit: usize) -> Self {
        Self {
            inner,
            store,
            warmup_limit: warmup_limit.max(1),
            watched: Mutex::new(HashSet::new()),
            synced: Mutex::new(HashSet::new()),
            covered_from: Mutex::new(HashMap::new()),
            resume_from: Mutex::new(HashMap::new()),
        }
    }

    /// Catch the store up with the upstream for one symbol.
    async fn sync(&self, symbol: &Symbol, settings: &HistorySettings) -> Result<(), MarketError> {
        let resume = self.resume_from.lock().get(symbol).copied();
        let query = if let Some(ts) = resume {
            HistoryQuery::since(ts)
        } else if self.store.is_empty(symbol).await? {
            HistoryQuery::latest(self.warmup_limit)
        } else {
            match self.store.latest(symbol).await? {
                Some(newest) => HistoryQuery::since(newest.timestamp),
                None => HistoryQuery::latest(self.warmup_limit),
            }
        };
        let fetched = self.fill(symbol, query, settings).await?;
        debug!(%symbol, bars = fetched, resumed = resume.is_some(), "Synced bar store");
        if resume.is_some() {
            self.resume_from.lock().remove(symbol);
        }
        self.synced.lock().insert(symbol.clone());
        Ok(())
    }

    /// Fetch `query` from the upstream into the store and widen coverage.
    async fn fill(
        &self,
        symbol: &Symbol,
        query: HistoryQuery,
        settings: &HistorySettings,
    ) -> Result<usize, MarketError> {
        let bars = self
            .inner
            .get_kline_histories(symbol, query, settings)
            .await?;
        self.store.upsert(symbol, &bars).await?;

        let covered = match (query.from_ts, query.limit) {
            (Some(from_ts), _) => Some(from_ts),
            (None, Some(limit)) if query.to_ts.is_none() && bars.len() < limit => Some(FULL_HISTORY),
            (None, Some(_)) if query.to_ts.is_none() => bars.first().map(|b| b.timestamp),
            _ => None,
        };
        if let Some(ts) = covered {
            self.covered_from
                .lock()
                .entry(symbol.clone())
                .and_modify(|current| *current = (*current).min(ts))
                .or_insert(ts);
        }
        Ok(bars.len())
    }

    /// Upstream query filling what the store lacks for `query`, if anything.
    async fn missing_span(
        &self,
        symbol: &Symbol,
        query: &HistoryQuery,
    ) -> Result<Option<HistoryQuery>, MarketError> {
        let covered = self.covered_from.lock().get(symbol).copied();
        if covered == Some(FULL_HISTORY) {
            return Ok(None);
        }

        if let Some(from_ts) = query.from_ts {
            return Ok(match covered {
                Some(ts) if from_ts >= ts => None,
                Some(ts) => Some(HistoryQuery::since(from_ts).until(ts)),
                None => Some(HistoryQuery::since(from_ts)),
            });
        }

        let Some(limit) = query.limit else {
            return Ok(None);
        };
        let per_bar = usize::try_from(query.timeframe.minutes()).unwrap_or(1);
        let needed = limit.saturating_mul(per_bar);
        let stored = self.store.range(symbol, None, query.to_ts).await?.len();
        Ok((stored < needed).then(|| HistoryQuery::latest(needed)))
    }

    fn needs_sync(&self, symbol: &Symbol) -> bool {
        !(self.watched.lock().contains(symbol) && self.synced.lock().contains(symbol))
    }

    /// Drop a watched symbol back to syncing after a live-path hole.
    fn mark_stale(&self, symbol: &Symbol, last_written: Option<i64>) {
        self.synced.lock().remove(symbol);
        if let Some(ts) = last_written {
            self.resume_from
                .lock()
                .entry(symbol.clone())
                .and_modify(|current| *current = (*current).min(ts))
                .or_insert(ts);
        }
    }
}

#[async_trait]
impl MarketAdapter for CachedMarket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn connect(&self) -> Result<(), MarketError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    async fn fetch_window(
        &self,
        timeframe: Timeframe,
        symbol: &Symbol,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Bar>, MarketError> {
        self.inner
            .fetch_window(timeframe, symbol, offset, count)
            .await
    }

    fn watch_raw(
        self: Arc<Self>,
        timeframe: Timeframe,
        symbol: Symbol,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> RawWindowStream {
        let windows = Arc::clone(&self.inner).watch_raw(timeframe, symbol.clone(), options, cancel);
        if timeframe != Timeframe::M1 {
            return windows;
        }

        self.watched.lock().insert(symbol.clone());
        let period = timeframe.period_ms();
        let mut last_written: Option<i64> = None;
        Box::pin(windows.then(move |item| {
            match &item {
                Ok(window) => {
                    if last_written.is_some_and(|ts| window.previous.timestamp > ts + period) {
                        info!(%symbol, after = ?last_written, "Live window gap, resyncing store");
                        self.mark_stale(&symbol, last_written);
                    }
                    last_written = last_written.max(Some(window.latest.timestamp));
                }
                Err(err) => {
                    warn!(%symbol, error = %err, "Live stream failed, resyncing store");
                    self.watched.lock().remove(&symbol);
                    self.mark_stale(&symbol, last_written);
                }
            }

            let store = Arc::clone(&self.store);
            let symbol = symbol.clone();
            async move {
                if let Ok(window) = &item {
                    let bars = [window.previous.clone(), window.latest.clone()];
                    if let Err(err) = store.upsert(&symbol, &bars).await {
                        warn!(%symbol, error = %err, "Failed to write through live bars");
                    }
                }
                item
            }
        }))
    }

    async fn get_kline_histories(
        &self,
        symbol: &Symbol,
        query: HistoryQuery,
        settings: &HistorySettings,
    ) -> Result<Vec<Bar>, MarketError> {
        query.validate()?;
        if self.needs_sync(symbol) {
            self.sync(symbol, settings).await?;
        }
        if let Some(span) = self.missing_span(symbol, &query).await? {
            let fetched = self.fill(symbol, span, settings).await?;
            debug!(%symbol, bars = fetched, "Backfilled bar store");
        }

        let minutes = self.store.range(symbol, query.from_ts, query.to_ts).await?;
        let mut bars = aggregate(minutes, query.timeframe);
        if query.from_ts.is_none() {
            if let Some(limit) = query.limit {
                let excess = bars.len().saturating_sub(limit);
                bars.drain(..excess);
            }
        }
        Ok(bars)
    }
}

/// Roll ascending 1-minute bars up into `timeframe` buckets.
///
/// A bucket takes the first open, highest high, lowest low, last close and
/// summed volume of its minutes, stamped with its first minute's timestamp.
#[must_use]
pub fn aggregate(minutes: Vec<Bar>, timeframe: Timeframe) -> Vec<Bar> {
    if timeframe == Timeframe::M1 {
        return minutes;
    }
    let period = timeframe.period_ms();

    let mut out: Vec<Bar> = Vec::new();
    let mut current_bucket = None;
    for bar in minutes {
        let bucket = bar.timestamp.div_euclid(period);
        match out.last_mut() {
            Some(agg) if current_bucket == Some(bucket) => {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
            }
            _ => {
                current_bucket = Some(bucket);
                out.push(bar);
            }
        }
    }
    out
}
