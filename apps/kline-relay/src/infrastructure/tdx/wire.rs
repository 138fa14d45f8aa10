//! Gateway wire types and conversions.

use chrono::{FixedOffset, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{Bar, MarketError, Timeframe};

/// Exchange local time offset of gateway timestamps (UTC+08:00).
const EXCHANGE_OFFSET_SECS: i32 = 8 * 3600;

/// Gateway datetime format.
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Entry of `GET /markets`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketEntry {
    /// Numeric market id.
    pub market: u16,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

/// Entry of `GET /bars`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireBar {
    /// Period start in exchange local time.
    pub datetime: String,
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub trade: i64,
}

/// Gateway bar category for a timeframe.
#[must_use]
pub const fn category(timeframe: Timeframe) -> u8 {
    match timeframe {
        Timeframe::M1 => 8,
        Timeframe::M5 => 0,
        Timeframe::M15 => 1,
        Timeframe::M30 => 2,
        Timeframe::H1 => 3,
        Timeframe::D1 => 4,
    }
}

/// Gateway market id for an exchange code.
#[must_use]
pub fn market_id(market: &str) -> Option<u16> {
    match market {
        "SHFE" => Some(30),
        "CZCE" => Some(28),
        "DCE" => Some(29),
        "CFFEX" => Some(47),
        "US" => Some(74),
        _ => None,
    }
}

/// Convert a gateway bar to a canonical bar.
///
/// # Errors
///
/// Returns `MarketError::Protocol` for unparseable timestamps or prices.
pub fn to_bar(wire: &WireBar) -> Result<Bar, MarketError> {
    Ok(Bar::new(
        to_utc_millis(&wire.datetime)?,
        price(wire.open)?,
        price(wire.high)?,
        price(wire.low)?,
        price(wire.close)?,
        wire.trade,
    ))
}

fn to_utc_millis(local: &str) -> Result<i64, MarketError> {
    let naive = NaiveDateTime::parse_from_str(local.trim(), DATETIME_FORMAT).map_err(|e| {
        MarketError::Protocol {
            message: format!("bad datetime '{local}': {e}"),
        }
    })?;
    let offset = FixedOffset::east_opt(EXCHANGE_OFFSET_SECS).ok_or_else(|| MarketError::Protocol {
        message: "invalid exchange offset".to_string(),
    })?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| MarketError::Protocol {
            message: format!("ambiguous datetime '{local}'"),
        })
}

fn price(value: f64) -> Result<Decimal, MarketError> {
    Decimal::try_from(value)
        .map(|d| d.round_dp(2))
        .map_err(|e| MarketError::Protocol {
            message: format!("bad price {value}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Timeframe::M1, 8)]
    #[test_case(Timeframe::M5, 0)]
    #[test_case(Timeframe::M15, 1)]
    #[test_case(Timeframe::M30, 2)]
    #[test_case(Timeframe::H1, 3)]
    #[test_case(Timeframe::D1, 4)]
    fn category_mapping(timeframe: Timeframe, expected: u8) {
        assert_eq!(category(timeframe), expected);
    }

    #[test_case("SHFE", Some(30))]
    #[test_case("CZCE", Some(28))]
    #[test_case("DCE", Some(29))]
    #[test_case("CFFEX", Some(47))]
    #[test_case("US", Some(74))]
    #[test_case("INE", None)]
    fn market_mapping(market: &str, expected: Option<u16>) {
        assert_eq!(market_id(market), expected);
    }

    #[test]
    fn converts_local_time_and_rounds_prices() {
        let wire = WireBar {
            datetime: "2024-01-02 09:01".to_string(),
            open: 68_950.004,
            high: 69_010.0,
            low: 68_930.126,
            close: 69_000.0,
            trade: 1532,
        };
        let bar = to_bar(&wire).unwrap();
        // 2024-01-02 01:01 UTC
        assert_eq!(bar.timestamp, 1_704_157_260_000);
        assert_eq!(bar.open.to_string(), "68950.00");
        assert_eq!(bar.low.to_string(), "68930.13");
        assert_eq!(bar.volume, 1532);
    }

    #[test]
    fn rejects_bad_datetime() {
        let wire = WireBar {
            datetime: "02/01/2024".to_string(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            trade: 0,
        };
        assert!(matches!(to_bar(&wire), Err(MarketError::Protocol { .. })));
    }

    #[test]
    fn rejects_nan_price() {
        assert!(price(f64::NAN).is_err());
    }
}
