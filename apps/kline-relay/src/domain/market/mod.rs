//! Market Data Types
//!
//! Core value types for candlestick data: symbols, bars, timeframes and
//! the events published for them. These types are transport-agnostic and
//! represent the canonical internal representation of kline data.
//!
//! # Wire Shape
//!
//! Bars serialize with an epoch-millisecond `datetime` and string prices:
//!
//! ```json
//! {"datetime": 1704067200000, "open": "68950.00", "high": "69010.00",
//!  "low": "68930.00", "close": "69000.00", "volume": 1532}
//! ```

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::MarketError;

// =============================================================================
// Symbol
// =============================================================================

/// Instrument key made of an exchange market and a contract code.
///
/// Parsed from a dotted identifier such as `"SHFE.cu2401"`. The market part
/// is normalized to upper case; the code is kept verbatim because some
/// exchanges distinguish case in contract codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    market: String,
    code: String,
}

impl Symbol {
    /// Create a symbol from its parts.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::InvalidQuery` if either part is empty.
    pub fn new(market: &str, code: &str) -> Result<Self, MarketError> {
        let market = market.trim();
        let code = code.trim();
        if market.is_empty() || code.is_empty() {
            return Err(MarketError::InvalidQuery {
                message: format!("symbol parts must be non-empty: '{market}.{code}'"),
            });
        }
        Ok(Self {
            market: market.to_ascii_uppercase(),
            code: code.to_string(),
        })
    }

    /// Exchange market identifier (e.g. `SHFE`).
    #[must_use]
    pub fn market(&self) -> &str {
        &self.market
    }

    /// Contract code within the market (e.g. `cu2401`).
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl FromStr for Symbol {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((market, code)) = s.split_once('.') else {
            return Err(MarketError::InvalidQuery {
                message: format!("symbol '{s}' is not in MARKET.code form"),
            });
        };
        Self::new(market, code)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.market, self.code)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Bar
// =============================================================================

/// A single OHLCV candle.
///
/// `timestamp` is the UTC start of the period in epoch milliseconds. Two bars
/// are equal only if every field matches, so a revised bar for the same
/// period compares unequal to its earlier snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Period start, UTC epoch milliseconds.
    #[serde(rename = "datetime")]
    pub timestamp: i64,
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing (or latest) price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: i64,
}

impl Bar {
    /// Create a bar from its fields.
    #[must_use]
    pub const fn new(
        timestamp: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: i64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Whether this bar covers the same period as `other`.
    #[must_use]
    pub const fn same_period(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

// =============================================================================
// Timeframe
// =============================================================================

/// Supported bar granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeframe {
    /// One-minute bars.
    #[default]
    M1,
    /// Five-minute bars.
    M5,
    /// Fifteen-minute bars.
    M15,
    /// Thirty-minute bars.
    M30,
    /// Hourly bars.
    H1,
    /// Daily bars.
    D1,
}

impl Timeframe {
    /// Every supported timeframe, shortest first.
    pub const ALL: [Self; 6] = [Self::M1, Self::M5, Self::M15, Self::M30, Self::H1, Self::D1];

    /// Length of one bar in minutes.
    #[must_use]
    pub const fn minutes(self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::D1 => 1440,
        }
    }

    /// Length of one bar in milliseconds.
    #[must_use]
    pub fn period_ms(self) -> i64 {
        i64::from(self.minutes()) * 60_000
    }
}

impl TryFrom<u32> for Timeframe {
    type Error = MarketError;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.minutes() == minutes)
            .ok_or(MarketError::UnsupportedTimeframe(minutes))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.minutes())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let minutes = u32::deserialize(deserializer)?;
        Self::try_from(minutes).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Raw Window
// =============================================================================

/// One poll sample of the upstream's two most recent bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWindow {
    /// The bar before the most recent one (normally closed).
    pub previous: Bar,
    /// The most recent bar (normally still forming).
    pub latest: Bar,
}

impl RawWindow {
    /// Build a window from a most-recent-first slice.
    ///
    /// Returns `None` when fewer than two bars are available.
    #[must_use]
    pub fn from_recent_first(bars: &[Bar]) -> Option<Self> {
        match bars {
            [latest, previous, ..] => Some(Self {
                previous: previous.clone(),
                latest: latest.clone(),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Kind of event placed on the fan-in queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new or revised bar.
    OnKline,
}

impl EventKind {
    /// Wire name of the event kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnKline => "on_kline",
        }
    }
}

/// A bar emitted for a symbol, ready for publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineEvent {
    /// Topic the event belongs to.
    pub symbol: Symbol,
    /// Event kind.
    pub kind: EventKind,
    /// The bar itself.
    pub payload: Bar,
}

impl KlineEvent {
    /// Wrap a bar as an `on_kline` event.
    #[must_use]
    pub const fn on_kline(symbol: Symbol, payload: Bar) -> Self {
        Self {
            symbol,
            kind: EventKind::OnKline,
            payload,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn bar(ts: i64, close: i64) -> Bar {
        let price = Decimal::new(close, 2);
        Bar::new(ts, price, price, price, price, 10)
    }

    #[test_case("SHFE.cu2401", "SHFE", "cu2401" ; "futures contract")]
    #[test_case("shfe.cu2401", "SHFE", "cu2401" ; "market upper-cased")]
    #[test_case("US.AAPL.X", "US", "AAPL.X" ; "splits on first dot")]
    fn symbol_parses(raw: &str, market: &str, code: &str) {
        let symbol: Symbol = raw.parse().unwrap();
        assert_eq!(symbol.market(), market);
        assert_eq!(symbol.code(), code);
    }

    #[test_case("SHFEcu2401" ; "missing dot")]
    #[test_case(".cu2401" ; "empty market")]
    #[test_case("SHFE." ; "empty code")]
    fn symbol_rejects(raw: &str) {
        let err = raw.parse::<Symbol>().unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[test]
    fn symbol_display_round_trips() {
        let symbol: Symbol = "DCE.m2405".parse().unwrap();
        assert_eq!(symbol.to_string(), "DCE.m2405");
        assert_eq!(serde_json::to_string(&symbol).unwrap(), "\"DCE.m2405\"");
    }

    #[test_case(1, Timeframe::M1)]
    #[test_case(5, Timeframe::M5)]
    #[test_case(15, Timeframe::M15)]
    #[test_case(30, Timeframe::M30)]
    #[test_case(60, Timeframe::H1)]
    #[test_case(1440, Timeframe::D1)]
    fn timeframe_from_minutes(minutes: u32, expected: Timeframe) {
        assert_eq!(Timeframe::try_from(minutes).unwrap(), expected);
        assert_eq!(expected.minutes(), minutes);
    }

    #[test]
    fn timeframe_rejects_unsupported() {
        assert!(matches!(
            Timeframe::try_from(3),
            Err(MarketError::UnsupportedTimeframe(3))
        ));
    }

    #[test]
    fn bar_serializes_with_datetime_and_string_prices() {
        let json = serde_json::to_value(bar(1_704_067_200_000, 6_900_000)).unwrap();
        assert_eq!(json["datetime"], 1_704_067_200_000_i64);
        assert_eq!(json["close"], "69000.00");
        assert_eq!(json["volume"], 10);
    }

    #[test]
    fn bar_equality_is_full_field() {
        let a = bar(60_000, 100);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.volume += 1;
        assert_ne!(a, b);
        assert!(a.same_period(&b));
    }

    #[test]
    fn window_needs_two_bars() {
        assert!(RawWindow::from_recent_first(&[]).is_none());
        assert!(RawWindow::from_recent_first(&[bar(60_000, 1)]).is_none());

        let window =
            RawWindow::from_recent_first(&[bar(120_000, 2), bar(60_000, 1), bar(0, 0)]).unwrap();
        assert_eq!(window.latest.timestamp, 120_000);
        assert_eq!(window.previous.timestamp, 60_000);
    }

    #[test]
    fn event_kind_wire_name() {
        assert_eq!(EventKind::OnKline.as_str(), "on_kline");
        assert_eq!(
            serde_json::to_string(&EventKind::OnKline).unwrap(),
            "\"on_kline\""
        );
    }
}
