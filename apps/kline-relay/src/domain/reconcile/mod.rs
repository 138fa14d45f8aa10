//! Poll Reconciliation
//!
//! Turns repeated two-bar samples of an upstream into an append-only bar
//! sequence. The upstream only exposes "the last N bars", so the same period
//! is observed several times while it forms, and the closing snapshot of a
//! period shows up as the *previous* bar once the next one opens.
//!
//! # Emission Rules
//!
//! For each window `(previous, latest)`:
//!
//! 1. `latest` older than the last emitted bar: emit nothing.
//! 2. `previous` has the last emitted timestamp but different contents: emit
//!    `previous` (the authoritative close of that period).
//! 3. `previous` is newer than the last emitted bar: emit `previous` so the
//!    closed bar is not lost. A distance of more than one period is a gap.
//! 4. `latest` differs from the last emitted bar: emit `latest`.
//!
//! The output is timestamp-non-decreasing and never repeats a bar
//! back-to-back.

use super::market::{Bar, RawWindow, Timeframe};

/// Something unusual seen while observing a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// Upstream's latest bar is older than what was already emitted.
    Regressed {
        /// Timestamp of the window's latest bar.
        latest_ts: i64,
        /// Timestamp of the last emitted bar.
        last_ts: i64,
    },
    /// Window's previous bar is newer than its latest bar.
    Malformed {
        /// Timestamp of the window's previous bar.
        previous_ts: i64,
        /// Timestamp of the window's latest bar.
        latest_ts: i64,
    },
    /// Bars between the last emitted one and `previous` were never observed.
    Gap {
        /// Timestamp of the last emitted bar.
        last_ts: i64,
        /// Timestamp of the recovered previous bar.
        resumed_ts: i64,
        /// Number of whole periods that were skipped.
        missing: i64,
    },
}

/// Result of observing one window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Bars to publish, in order.
    pub emitted: Vec<Bar>,
    /// Anomaly detected, if any.
    pub anomaly: Option<Anomaly>,
}

/// Per-symbol reconciliation state.
#[derive(Debug, Clone)]
pub struct Reconciler {
    period_ms: i64,
    last_emitted: Option<Bar>,
}

impl Reconciler {
    /// Create a reconciler for bars of the given timeframe.
    #[must_use]
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            period_ms: timeframe.period_ms(),
            last_emitted: None,
        }
    }

    /// The last bar handed out, if any.
    #[must_use]
    pub const fn last_emitted(&self) -> Option<&Bar> {
        self.last_emitted.as_ref()
    }

    /// Feed one window and collect the bars it yields.
    pub fn observe(&mut self, window: &RawWindow) -> Observation {
        let RawWindow { previous, latest } = window;
        let mut observation = Observation::default();

        if previous.timestamp > latest.timestamp {
            observation.anomaly = Some(Anomaly::Malformed {
                previous_ts: previous.timestamp,
                latest_ts: latest.timestamp,
            });
            return observation;
        }

        if let Some(last) = &self.last_emitted {
            if latest.timestamp < last.timestamp {
                observation.anomaly = Some(Anomaly::Regressed {
                    latest_ts: latest.timestamp,
                    last_ts: last.timestamp,
                });
                return observation;
            }

            let finalized = previous.timestamp == last.timestamp && previous != last;
            let skipped = previous.timestamp > last.timestamp;

            if skipped {
                let distance = previous.timestamp - last.timestamp;
                if distance > self.period_ms {
                    observation.anomaly = Some(Anomaly::Gap {
                        last_ts: last.timestamp,
                        resumed_ts: previous.timestamp,
                        missing: distance / self.period_ms - 1,
                    });
                }
            }

            if finalized || skipped {
                self.emit(previous.clone(), &mut observation.emitted);
            }
        }

        if self.last_emitted.as_ref() != Some(latest) {
            self.emit(latest.clone(), &mut observation.emitted);
        }

        observation
    }

    fn emit(&mut self, bar: Bar, out: &mut Vec<Bar>) {
        out.push(bar.clone());
        self.last_emitted = Some(bar);
    }
}

// =============================================================================
// Tests
// =============================================================================
