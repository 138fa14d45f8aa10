//! Simulated Market
//!
//! In-memory [`MarketAdapter`] with scripted or generated bar series. Used by
//! tests to drive exact poll sequences and by the binary's `simulated`
//! source for running without a gateway.
//!
//! Each fetch for a symbol first consumes the next scripted [`Step`]: a
//! `Bars` step replaces the symbol's series, a `Fail` step is returned as the
//! fetch error. Once the script is exhausted the last series keeps being
//! served, advanced by the generator if one is attached.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::application::ports::MarketAdapter;
use crate::domain::{Bar, MarketError, Symbol, Timeframe};

/// One scripted fetch outcome.
#[derive(Debug, Clone)]
pub enum Step {
    /// Replace the series (ascending) and serve it.
    Bars(Vec<Bar>),
    /// Fail this fetch.
    Fail(MarketError),
}

impl Step {
    /// Series of 1-minute bars from `(minute, value)` pairs, oldest first.
    ///
    /// Every price field and the volume are set to `value`.
    #[must_use]
    pub fn bars(points: &[(i64, i64)]) -> Self {
        Self::Bars(
            points
                .iter()
                .map(|&(minute, value)| {
                    let price = Decimal::new(value, 0);
                    Bar::new(minute * 60_000, price, price, price, price, value)
                })
                .collect(),
        )
    }
}

/// Deterministic price walk that revises the forming bar on every poll and
/// opens a new one every `polls_per_bar` polls.
#[derive(Debug, Clone)]
struct Generator {
    period_ms: i64,
    polls_per_bar: u32,
    polls: u32,
}

impl Generator {
    fn advance(&mut self, series: &mut Vec<Bar>) {
        self.polls += 1;
        let Some(last) = series.last().cloned() else {
            return;
        };
        if self.polls % self.polls_per_bar == 0 {
            series.push(Bar::new(
                last.timestamp + self.period_ms,
                last.close,
                last.close,
                last.close,
                last.close,
                0,
            ));
            return;
        }
        let step = walk_step(i64::from(self.polls));
        let close = last.close + step;
        if let Some(forming) = series.last_mut() {
            forming.close = close;
            forming.high = forming.high.max(close);
            forming.low = forming.low.min(close);
            forming.volume += 1;
        }
    }
}

/// Zig-zag price increment in hundredths.
fn walk_step(n: i64) -> Decimal {
    Decimal::new((n * 7) % 13 - 6, 2)
}

#[derive(Debug, Default)]
struct Feed {
    steps: VecDeque<Step>,
    series: Vec<Bar>,
    generator: Option<Generator>,
}

/// Scripted in-memory market adapter.
#[derive(Debug, Default)]
pub struct SimulatedMarket {
    feeds: Mutex<HashMap<Symbol, Feed>>,
    reject_connect: Option<String>,
    connected: AtomicBool,
    fetches: AtomicUsize,
    disconnects: AtomicUsize,
}

impl SimulatedMarket {
    /// Create an empty market that accepts connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a market whose `connect` always fails with `message`.
    #[must_use]
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject_connect: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Create a market generating endless data for `symbols`.
    ///
    /// Each symbol starts with `history` closed bars ending at `start_ts`.
    #[must_use]
    pub fn generated(
        symbols: &[Symbol],
        timeframe: Timeframe,
        history: usize,
        polls_per_bar: u32,
        start_ts: i64,
    ) -> Self {
        let market = Self::new();
        let period_ms = timeframe.period_ms();
        {
            let mut feeds = market.feeds.lock();
            for (index, symbol) in symbols.iter().enumerate() {
                let base = Decimal::new(1000 * (i64::try_from(index).unwrap_or(0) + 1), 0);
                let mut price = base;
                let series = (0..history)
                    .rev()
                    .map(|back| {
                        let back = i64::try_from(back).unwrap_or(0);
                        let open = price;
                        price += walk_step(back);
                        Bar::new(
                            start_ts - back * period_ms,
                            open,
                            open.max(price),
                            open.min(price),
                            price,
                            100 + back % 50,
                        )
                    })
                    .collect();
                feeds.insert(
                    symbol.clone(),
                    Feed {
                        steps: VecDeque::new(),
                        series,
                        generator: Some(Generator {
                            period_ms,
                            polls_per_bar: polls_per_bar.max(1),
                            polls: 0,
                        }),
                    },
                );
            }
        }
        market
    }

    /// Append scripted steps for `symbol`, registering it if new.
    pub fn script(&self, symbol: &Symbol, steps: Vec<Step>) {
        self.feeds
            .lock()
            .entry(symbol.clone())
            .or_default()
            .steps
            .extend(steps);
    }

    /// Raw fetches served so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Calls to `disconnect` so far.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Whether `connect` has succeeded and `disconnect` has not run since.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketAdapter for SimulatedMarket {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn connect(&self) -> Result<(), MarketError> {
        if let Some(message) = &self.reject_connect {
            return Err(MarketError::Connection {
                message: message.clone(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn fetch_window(
        &self,
        _timeframe: Timeframe,
        symbol: &Symbol,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Bar>, MarketError> {
        if !self.is_connected() {
            return Err(MarketError::NotConnected);
        }
        if count == 0 {
            return Err(MarketError::invalid("count must be positive"));
        }

        let mut feeds = self.feeds.lock();
        let feed = feeds
            .get_mut(symbol)
            .ok_or_else(|| MarketError::UnknownSymbol {
                symbol: symbol.to_string(),
            })?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        match feed.steps.pop_front() {
            Some(Step::Fail(err)) => return Err(err),
            Some(Step::Bars(series)) => feed.series = series,
            None => {
                if let Some(generator) = feed.generator.as_mut() {
                    generator.advance(&mut feed.series);
                }
            }
        }

        let window: Vec<Bar> = feed
            .series
            .iter()
            .rev()
            .skip(offset)
            .take(count)
            .cloned()
            .collect();
        debug!(%symbol, offset, count, returned = window.len(), "Simulated fetch");
        Ok(window)
    }
}
