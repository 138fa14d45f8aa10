//! Symbol Reconciler Task
//!
//! Drives a [`Reconciler`] from an adapter's raw window stream and places the
//! emitted bars on the shared fan-in queue.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::ports::{MarketAdapter, WatchOptions};
use crate::domain::reconcile::{Anomaly, Reconciler};
use crate::domain::{KlineEvent, MarketError, Symbol, Timeframe};
use crate::infrastructure::metrics::{self, AnomalyKind};

/// Why a symbol task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// Cancellation was requested.
    Cancelled,
    /// The queue receiver was dropped.
    QueueClosed,
    /// The raw stream ended without cancellation.
    StreamEnded,
    /// The raw stream failed permanently.
    Failed(MarketError),
}

/// Everything a symbol task needs.
pub struct SymbolTask {
    /// Source adapter.
    pub adapter: Arc<dyn MarketAdapter>,
    /// Symbol to follow.
    pub symbol: Symbol,
    /// Bar granularity.
    pub timeframe: Timeframe,
    /// Polling parameters.
    pub options: WatchOptions,
    /// Fan-in queue.
    pub queue: mpsc::Sender<KlineEvent>,
    /// Shared stop signal.
    pub cancel: CancellationToken,
}

impl SymbolTask {
    /// Run until cancelled, the queue closes, or the upstream fails.
    pub async fn run(self) -> TaskExit {
        let Self {
            adapter,
            symbol,
            timeframe,
            options,
            queue,
            cancel,
        } = self;

        info!(%symbol, %timeframe, "Symbol task started");
        let mut windows = adapter.watch_raw(timeframe, symbol.clone(), options, cancel.clone());
        let mut reconciler = Reconciler::new(timeframe);

        let exit = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break TaskExit::Cancelled,
                next = windows.next() => next,
            };

            let window = match next {
                Some(Ok(window)) => window,
                Some(Err(err)) => {
                    error!(%symbol, error = %err, "Upstream failed permanently, stopping symbol task");
                    metrics::record_task_failure(&symbol.to_string(), err.kind());
                    break TaskExit::Failed(err);
                }
                None if cancel.is_cancelled() => break TaskExit::Cancelled,
                None => break TaskExit::StreamEnded,
            };

            let observation = reconciler.observe(&window);
            if let Some(anomaly) = observation.anomaly {
                report(&symbol, anomaly);
            }

            for bar in observation.emitted {
                let event = KlineEvent::on_kline(symbol.clone(), bar);
                let sent = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return TaskExit::Cancelled,
                    sent = queue.send(event) => sent,
                };
                if sent.is_err() {
                    debug!(%symbol, "Queue receiver dropped");
                    return TaskExit::QueueClosed;
                }
                metrics::record_event_enqueued(&symbol.to_string());
            }
        };

        info!(%symbol, ?exit, "Symbol task stopped");
        exit
    }
}

fn report(symbol: &Symbol, anomaly: Anomaly) {
    match anomaly {
        Anomaly::Gap {
            last_ts,
            resumed_ts,
            missing,
        } => {
            warn!(
                %symbol,
                last_ts,
                resumed_ts,
                missing,
                "Polling skipped bars; backfill required to recover them"
            );
            metrics::record_anomaly(&symbol.to_string(), AnomalyKind::Gap);
        }
        Anomaly::Regressed { latest_ts, last_ts } => {
            warn!(%symbol, latest_ts, last_ts, "Upstream went backwards, ignoring window");
            metrics::record_anomaly(&symbol.to_string(), AnomalyKind::Regressed);
        }
        Anomaly::Malformed {
            previous_ts,
            latest_ts,
        } => {
            warn!(%symbol, previous_ts, latest_ts, "Window out of order, ignoring");
            metrics::record_anomaly(&symbol.to_string(), AnomalyKind::Malformed);
        }
    }
}
