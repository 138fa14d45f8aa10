//! Streaming Service
//!
//! Runs one reconciler task per subscribed symbol, fans their output into a
//! single bounded queue, and answers history queries against the same
//! adapter.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► start() ──► [running] ──► stop() ──► [stopped]
//!              │                         ▲
//!              └── connect failed ───────┘ (nothing spawned)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::reconciler::{SymbolTask, TaskExit};
use crate::application::ports::{HistorySettings, MarketAdapter, WatchOptions};
use crate::domain::pagination::HistoryQuery;
use crate::domain::{Bar, KlineEvent, MarketError, Symbol, Timeframe};
use crate::infrastructure::metrics;

/// Errors from the streaming service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Adapter or algorithm failure.
    #[error(transparent)]
    Market(#[from] MarketError),

    /// `start()` called while already running.
    #[error("streaming service is already running")]
    AlreadyRunning,
}

/// Tunables for the streaming service.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Granularity of the live stream.
    pub timeframe: Timeframe,
    /// Capacity of the fan-in queue.
    pub queue_capacity: usize,
    /// How long `stop()` waits for tasks before aborting them.
    pub shutdown_grace: Duration,
    /// Live polling parameters.
    pub watch: WatchOptions,
    /// History paging parameters.
    pub history: HistorySettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::M1,
            queue_capacity: 100,
            shutdown_grace: Duration::from_secs(2),
            watch: WatchOptions::default(),
            history: HistorySettings::default(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<(Symbol, JoinHandle<TaskExit>)>,
}

/// Orchestrates live streaming and history queries for a symbol set.
pub struct StreamingService {
    adapter: Arc<dyn MarketAdapter>,
    symbols: Vec<Symbol>,
    settings: StreamSettings,
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
    live_tasks: Arc<AtomicUsize>,
}

impl StreamingService {
    /// Create a stopped service.
    #[must_use]
    pub fn new(adapter: Arc<dyn MarketAdapter>, symbols: Vec<Symbol>, settings: StreamSettings) -> Self {
        Self {
            adapter,
            symbols,
            settings,
            running: Mutex::new(None),
            is_running: AtomicBool::new(false),
            live_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribed symbols.
    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Whether `start()` succeeded and `stop()` has not run since.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Symbol tasks that have not exited yet.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::Acquire)
    }

    /// Connect and spawn one reconciler task per symbol.
    ///
    /// The returned receiver stays drainable after `stop()` until dropped.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::AlreadyRunning` when called twice, or the
    /// adapter's connection error (after which nothing is running).
    pub async fn start(&self) -> Result<mpsc::Receiver<KlineEvent>, ServiceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        if let Err(err) = self.adapter.connect().await {
            warn!(adapter = self.adapter.name(), error = %err, "Connect failed");
            self.adapter.disconnect().await;
            return Err(err.into());
        }

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let tasks = self
            .symbols
            .iter()
            .map(|symbol| {
                let task = SymbolTask {
                    adapter: Arc::clone(&self.adapter),
                    symbol: symbol.clone(),
                    timeframe: self.settings.timeframe,
                    options: self.settings.watch.clone(),
                    queue: tx.clone(),
                    cancel: cancel.clone(),
                };
                (symbol.clone(), self.spawn(task))
            })
            .collect();

        *running = Some(Running { cancel, tasks });
        self.is_running.store(true, Ordering::Release);
        info!(
            adapter = self.adapter.name(),
            symbols = self.symbols.len(),
            "Streaming started"
        );
        Ok(rx)
    }

    fn spawn(&self, task: SymbolTask) -> JoinHandle<TaskExit> {
        let live = Arc::clone(&self.live_tasks);
        #[allow(clippy::cast_precision_loss)]
        metrics::set_symbol_tasks((live.fetch_add(1, Ordering::AcqRel) + 1) as f64);
        tokio::spawn(async move {
            let exit = task.run().await;
            #[allow(clippy::cast_precision_loss)]
            metrics::set_symbol_tasks((live.fetch_sub(1, Ordering::AcqRel) - 1) as f64);
            exit
        })
    }

    /// Cancel all tasks, wait for them, then disconnect.
    ///
    /// Tasks still running after the grace period are aborted. Calling this
    /// when not running does nothing.
    pub async fn stop(&self) {
        let Some(Running { cancel, tasks }) = self.running.lock().await.take() else {
            return;
        };
        self.is_running.store(false, Ordering::Release);
        cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.settings.shutdown_grace;
        for (symbol, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(exit)) => info!(%symbol, ?exit, "Symbol task joined"),
                Ok(Err(err)) => {
                    warn!(%symbol, error = %err, "Symbol task panicked");
                    self.live_tasks.fetch_sub(1, Ordering::AcqRel);
                }
                Err(_) => {
                    warn!(%symbol, "Symbol task did not stop in time, aborting");
                    handle.abort();
                    // A task that finished on its own already counted itself out.
                    if handle.await.is_err() {
                        self.live_tasks.fetch_sub(1, Ordering::AcqRel);
                    }
                }
            }
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::set_symbol_tasks(self.live_tasks() as f64);

        self.adapter.disconnect().await;
        info!(adapter = self.adapter.name(), "Streaming stopped");
    }

    /// Bars for `symbol` in the queried range, ascending.
    ///
    /// Unknown symbols yield an empty result. Callable while streaming.
    ///
    /// # Errors
    ///
    /// Invalid symbols and queries are programmer errors; upstream failures
    /// propagate as `ServiceError::Market`.
    #[instrument(skip(self), fields(adapter = self.adapter.name()))]
    pub async fn get_kline_histories(
        &self,
        symbol: &str,
        query: HistoryQuery,
    ) -> Result<Vec<Bar>, ServiceError> {
        let started = Instant::now();
        let result = self.query_history(symbol, query).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::record_history_request(outcome, started.elapsed());

        match result {
            Ok(bars) => Ok(bars),
            Err(MarketError::UnknownSymbol { symbol }) => {
                warn!(%symbol, "History requested for unknown symbol");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn query_history(&self, symbol: &str, query: HistoryQuery) -> Result<Vec<Bar>, MarketError> {
        query.validate()?;
        let symbol: Symbol = symbol.parse()?;
        self.adapter
            .get_kline_histories(&symbol, query, &self.settings.history)
            .await
    }
}

impl ServiceError {
    /// Stable snake_case label for error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Market(err) => err.kind(),
            Self::AlreadyRunning => "already_running",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::retry::RetryConfig;
    use crate::infrastructure::simulated::{SimulatedMarket, Step};

    fn sym(raw: &str) -> Symbol {
        raw.parse().unwrap()
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            watch: WatchOptions {
                poll_interval: Duration::from_millis(100),
                lookback: 2,
                retry: RetryConfig::default().unlimited(),
            },
            ..StreamSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let market = Arc::new(SimulatedMarket::new());
        market.script(&sym("SHFE.cu2401"), vec![Step::bars(&[(1, 1), (2, 2)])]);
        let service = StreamingService::new(market, vec![sym("SHFE.cu2401")], settings());

        let _rx = service.start().await.unwrap();
        assert!(service.is_running());
        assert_eq!(service.start().await.unwrap_err(), ServiceError::AlreadyRunning);
        service.stop().await;
        assert!(!service.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_spawns_nothing() {
        let market = Arc::new(SimulatedMarket::rejecting("gateway down"));
        let service =
            StreamingService::new(market.clone(), vec![sym("SHFE.cu2401")], settings());

        let err = service.start().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Market(MarketError::Connection { .. })
        ));
        assert!(!service.is_running());
        assert_eq!(service.live_tasks(), 0);
        assert_eq!(market.disconnect_count(), 1);
    }

    /// Adapter whose fetches crash the calling task.
    struct CrashingMarket;

    #[async_trait::async_trait]
    impl MarketAdapter for CrashingMarket {
        fn name(&self) -> &str {
            "crashing"
        }

        async fn connect(&self) -> Result<(), MarketError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn fetch_window(
            &self,
            _timeframe: Timeframe,
            _symbol: &Symbol,
            _offset: usize,
            _count: usize,
        ) -> Result<Vec<Bar>, MarketError> {
            panic!("decoder bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_task_is_counted_out_on_stop() {
        let service = StreamingService::new(
            Arc::new(CrashingMarket),
            vec![sym("SHFE.cu2401"), sym("DCE.m2405")],
            settings(),
        );

        let _rx = service.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(service.live_tasks(), 2);

        service.stop().await;
        assert_eq!(service.live_tasks(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let market = Arc::new(SimulatedMarket::new());
        let service = StreamingService::new(market.clone(), vec![], settings());
        service.stop().await;
        service.stop().await;
        assert_eq!(market.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn unknown_symbol_history_is_empty() {
        let market = Arc::new(SimulatedMarket::new());
        market.connect().await.unwrap();
        let service = StreamingService::new(market, vec![], settings());

        let bars = service
            .get_kline_histories("INE.sc2405", HistoryQuery::latest(10))
            .await
            .unwrap();
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn history_without_bounds_is_programmer_error() {
        let market = Arc::new(SimulatedMarket::new());
        let service = StreamingService::new(market, vec![], settings());

        let err = service
            .get_kline_histories("SHFE.cu2401", HistoryQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Market(e) if e.is_programmer_error()));
    }

    #[tokio::test]
    async fn malformed_symbol_is_programmer_error() {
        let market = Arc::new(SimulatedMarket::new());
        let service = StreamingService::new(market, vec![], settings());

        let err = service
            .get_kline_histories("cu2401", HistoryQuery::latest(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_query");
    }
}
