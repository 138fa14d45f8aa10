//! History Backfill
//!
//! Drives a [`Backfill`] page walk against an adapter's raw fetch, retrying
//! each page on transient failures.

use tracing::{debug, instrument};

use super::retry::retry_transient;
use crate::application::ports::{HistorySettings, MarketAdapter};
use crate::domain::pagination::{Backfill, HistoryQuery};
use crate::domain::{Bar, MarketError, Symbol};

/// Answer `query` by paging through `adapter.fetch_window`.
///
/// # Errors
///
/// Fails on an invalid query, a permanent fetch error, a page whose retries
/// ran out, or a walk longer than `settings.max_pages`. A partial range is
/// never returned.
#[instrument(skip(adapter, symbol, settings), fields(adapter = adapter.name(), symbol = %symbol))]
pub async fn paginate<A>(
    adapter: &A,
    symbol: &Symbol,
    query: HistoryQuery,
    settings: &HistorySettings,
) -> Result<Vec<Bar>, MarketError>
where
    A: MarketAdapter + ?Sized,
{
    let mut walk = Backfill::new(query, settings.page_size, settings.max_pages)?;
    let timeframe = query.timeframe;

    while let Some(page) = walk.next_page() {
        let bars = retry_transient(adapter.name(), &settings.retry, move || {
            adapter.fetch_window(timeframe, symbol, page.offset, page.count)
        })
        .await?;
        debug!(
            offset = page.offset,
            requested = page.count,
            received = bars.len(),
            "Fetched history page"
        );
        walk.absorb(bars)?;
    }

    let pages = walk.pages_fetched();
    let bars = walk.finish();
    debug!(pages, bars = bars.len(), "History query complete");
    Ok(bars)
}
