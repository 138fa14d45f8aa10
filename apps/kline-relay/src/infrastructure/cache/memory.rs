//! In-memory bar store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::BarStore;
use crate::domain::{Bar, MarketError, Symbol};

/// In-memory implementation of `BarStore`.
///
/// Keeps every bar ever upserted. Suitable for tests and short-lived
/// processes.
#[derive(Debug, Default)]
pub struct InMemoryBarStore {
    bars: RwLock<HashMap<Symbol, BTreeMap<i64, Bar>>>,
}

impl InMemoryBarStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bars stored for a symbol.
    #[must_use]
    pub fn len(&self, symbol: &Symbol) -> usize {
        self.bars.read().get(symbol).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn upsert(&self, symbol: &Symbol, bars: &[Bar]) -> Result<(), MarketError> {
        let mut all = self.bars.write();
        let series = all.entry(symbol.clone()).or_default();
        for bar in bars {
            series.insert(bar.timestamp, bar.clone());
        }
        Ok(())
    }

    async fn latest(&self, symbol: &Symbol) -> Result<Option<Bar>, MarketError> {
        Ok(self
            .bars
            .read()
            .get(symbol)
            .and_then(|series| series.values().next_back().cloned()))
    }

    async fn range(
        &self,
        symbol: &Symbol,
        from_ts: Option<i64>,
        to_ts: Option<i64>,
    ) -> Result<Vec<Bar>, MarketError> {
        let from = from_ts.unwrap_or(i64::MIN);
        let to = to_ts.unwrap_or(i64::MAX);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .bars
            .read()
            .get(symbol)
            .map(|series| series.range(from..=to).map(|(_, bar)| bar.clone()).collect())
            .unwrap_or_default())
    }

    async fn is_empty(&self, symbol: &Symbol) -> Result<bool, MarketError> {
        Ok(self.len(symbol) == 0)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn bar(minute: i64, volume: i64) -> Bar {
        Bar::new(
            minute * 60_000,
            Decimal::ONE,
            Decimal::ONE,
            Decimal::ONE,
            Decimal::ONE,
            volume,
        )
    }

    #[tokio::test]
    async fn upsert_replaces_by_timestamp() {
        let store = InMemoryBarStore::new();
        let symbol: Symbol = "SHFE.cu2401".parse().unwrap();
        assert!(store.is_empty(&symbol).await.unwrap());

        store.upsert(&symbol, &[bar(1, 1), bar(2, 2)]).await.unwrap();
        store.upsert(&symbol, &[bar(2, 5), bar(3, 3)]).await.unwrap();

        assert_eq!(store.len(&symbol), 3);
        assert_eq!(store.latest(&symbol).await.unwrap(), Some(bar(3, 3)));
        let range = store
            .range(&symbol, Some(2 * 60_000), Some(2 * 60_000))
            .await
            .unwrap();
        assert_eq!(range, vec![bar(2, 5)]);
    }

    #[tokio::test]
    async fn inverted_range_is_empty() {
        let store = InMemoryBarStore::new();
        let symbol: Symbol = "SHFE.cu2401".parse().unwrap();
        store.upsert(&symbol, &[bar(1, 1)]).await.unwrap();
        assert!(store.range(&symbol, Some(10), Some(0)).await.unwrap().is_empty());
    }
}
