//! Bar Store Port (Driven Port)
//!
//! Persistence for 1-minute bars keyed by symbol and timestamp, used by the
//! caching decorator.

use async_trait::async_trait;

use crate::domain::{Bar, MarketError, Symbol};

/// Keyed bar storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BarStore: Send + Sync + 'static {
    /// Insert or replace bars by timestamp.
    async fn upsert(&self, symbol: &Symbol, bars: &[Bar]) -> Result<(), MarketError>;

    /// Newest stored bar for a symbol.
    async fn latest(&self, symbol: &Symbol) -> Result<Option<Bar>, MarketError>;

    /// Stored bars with `from_ts <= timestamp <= to_ts`, ascending.
    async fn range(
        &self,
        symbol: &Symbol,
        from_ts: Option<i64>,
        to_ts: Option<i64>,
    ) -> Result<Vec<Bar>, MarketError>;

    /// Whether nothing is stored for a symbol.
    async fn is_empty(&self, symbol: &Symbol) -> Result<bool, MarketError>;
}
