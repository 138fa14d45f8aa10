//! Raw Window Polling
//!
//! Samples an adapter's two most recent bars on a fixed interval. Transient
//! fetch failures back off and retry; permanent failures end the stream after
//! being yielded once.

use std::sync::Arc;

use futures::stream;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::retry::Backoff;
use crate::application::ports::{MarketAdapter, RawWindowStream, WatchOptions};
use crate::domain::{MarketError, RawWindow, Symbol, Timeframe};
use crate::infrastructure::metrics;

struct PollState<A: ?Sized> {
    adapter: Arc<A>,
    timeframe: Timeframe,
    symbol: Symbol,
    lookback: usize,
    interval: Interval,
    backoff: Backoff,
    cancel: CancellationToken,
    finished: bool,
}

/// Build the raw window stream for one symbol.
pub fn raw_windows<A>(
    adapter: Arc<A>,
    timeframe: Timeframe,
    symbol: Symbol,
    options: WatchOptions,
    cancel: CancellationToken,
) -> RawWindowStream
where
    A: MarketAdapter + ?Sized,
{
    let mut interval = tokio::time::interval(options.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = PollState {
        adapter,
        timeframe,
        symbol,
        lookback: options.lookback.max(2),
        interval,
        backoff: Backoff::new(options.retry),
        cancel,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        let item = next_window(&mut state).await?;
        Some((item, state))
    }))
}

async fn next_window<A>(state: &mut PollState<A>) -> Option<Result<RawWindow, MarketError>>
where
    A: MarketAdapter + ?Sized,
{
    if state.finished {
        return None;
    }

    loop {
        tokio::select! {
            biased;
            () = state.cancel.cancelled() => return None,
            _ = state.interval.tick() => {}
        }

        metrics::record_fetch(state.adapter.name());
        let fetched = tokio::select! {
            biased;
            () = state.cancel.cancelled() => return None,
            res = state.adapter.fetch_window(state.timeframe, &state.symbol, 0, state.lookback) => res,
        };

        let err = match fetched {
            Ok(bars) => {
                state.backoff.reset();
                if let Some(window) = RawWindow::from_recent_first(&bars) {
                    return Some(Ok(window));
                }
                debug!(
                    symbol = %state.symbol,
                    bars = bars.len(),
                    "Window too short, waiting for next poll"
                );
                continue;
            }
            Err(err) => err,
        };

        metrics::record_fetch_failure(state.adapter.name(), err.kind());
        if !err.is_transient() {
            state.finished = true;
            return Some(Err(err));
        }

        let attempts = state.backoff.attempts();
        let Some(delay) = state.backoff.next_delay() else {
            state.finished = true;
            return Some(Err(MarketError::RetriesExhausted {
                attempts,
                last_error: err.to_string(),
            }));
        };

        warn!(
            symbol = %state.symbol,
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Poll failed, backing off"
        );
        metrics::record_fetch_retry(state.adapter.name());

        tokio::select! {
            biased;
            () = state.cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::application::services::retry::RetryConfig;
    use crate::infrastructure::simulated::{SimulatedMarket, Step};

    fn options(max_attempts: u32) -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(100),
            lookback: 2,
            retry: RetryConfig {
                jitter_factor: 0.0,
                max_attempts,
                ..RetryConfig::default()
            },
        }
    }

    fn symbol() -> Symbol {
        "SHFE.cu2401".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn yields_windows_and_skips_short_ones() {
        let market = Arc::new(SimulatedMarket::new());
        market.script(
            &symbol(),
            vec![
                Step::bars(&[(1, 10)]),
                Step::bars(&[(1, 10), (2, 20)]),
                Step::bars(&[(2, 20), (3, 30)]),
            ],
        );
        market.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let mut windows = raw_windows(market, Timeframe::M1, symbol(), options(0), cancel);

        let first = windows.next().await.unwrap().unwrap();
        assert_eq!(first.latest.timestamp, 2 * 60_000);
        let second = windows.next().await.unwrap().unwrap();
        assert_eq!(second.previous.timestamp, 2 * 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_until_success() {
        let market = Arc::new(SimulatedMarket::new());
        market.script(
            &symbol(),
            vec![
                Step::Fail(MarketError::transient("timeout")),
                Step::Fail(MarketError::transient("timeout")),
                Step::bars(&[(1, 10), (2, 20)]),
            ],
        );
        market.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let mut windows =
            raw_windows(market.clone(), Timeframe::M1, symbol(), options(0), cancel);

        let window = windows.next().await.unwrap().unwrap();
        assert_eq!(window.latest.timestamp, 2 * 60_000);
        assert_eq!(market.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_ends_stream() {
        let market = Arc::new(SimulatedMarket::new());
        market.script(&symbol(), vec![Step::Fail(MarketError::NotConnected)]);
        market.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let mut windows = raw_windows(market, Timeframe::M1, symbol(), options(0), cancel);

        assert_eq!(
            windows.next().await.unwrap(),
            Err(MarketError::NotConnected)
        );
        assert!(windows.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn capped_retries_end_stream() {
        let market = Arc::new(SimulatedMarket::new());
        market.script(
            &symbol(),
            vec![
                Step::Fail(MarketError::transient("a")),
                Step::Fail(MarketError::transient("b")),
            ],
        );
        market.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let mut windows = raw_windows(market, Timeframe::M1, symbol(), options(2), cancel);

        assert!(matches!(
            windows.next().await,
            Some(Err(MarketError::RetriesExhausted { attempts: 2, .. }))
        ));
        assert!(windows.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_stream_silently() {
        let market = Arc::new(SimulatedMarket::new());
        market.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let mut windows =
            raw_windows(market, Timeframe::M1, symbol(), options(0), cancel.clone());
        cancel.cancel();
        assert!(windows.next().await.is_none());
    }
}
