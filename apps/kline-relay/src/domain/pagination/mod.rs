//! History Pagination
//!
//! Plans and stitches the page walk that turns "give me `count` bars starting
//! `offset` bars back" into an arbitrary range query.
//!
//! # Modes
//!
//! - **Since** (`from_ts` set): walk backward in `page_size` pages until the
//!   oldest collected bar predates `from_ts` or a page adds nothing older.
//!   Upstreams may serve fewer bars than asked per page.
//! - **Latest** (`limit` only): fetch `limit / page_size` full pages plus one
//!   partial page of the remainder.
//!
//! Pages arrive most-recent-first. Each one is reversed and prepended to the
//! accumulated bars; anything at or after the current oldest timestamp is
//! dropped first, so a bar that closes mid-walk (shifting every offset by
//! one) never produces a duplicate.

use serde::{Deserialize, Serialize};

use super::error::MarketError;
use super::market::{Bar, Timeframe};

// =============================================================================
// Query
// =============================================================================

/// Range query over historical bars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Inclusive lower bound, UTC ms. Drives pagination when set.
    #[serde(default)]
    pub from_ts: Option<i64>,
    /// Inclusive upper bound, UTC ms.
    #[serde(default)]
    pub to_ts: Option<i64>,
    /// Number of most recent bars, used when `from_ts` is absent.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Bar granularity.
    #[serde(default)]
    pub timeframe: Timeframe,
}

impl HistoryQuery {
    /// Bars at or after `from_ts`.
    #[must_use]
    pub fn since(from_ts: i64) -> Self {
        Self {
            from_ts: Some(from_ts),
            ..Self::default()
        }
    }

    /// The most recent `limit` bars.
    #[must_use]
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Add an inclusive upper bound.
    #[must_use]
    pub const fn until(mut self, to_ts: i64) -> Self {
        self.to_ts = Some(to_ts);
        self
    }

    /// Use a different timeframe.
    #[must_use]
    pub const fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    /// Check that the query names a lower bound.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::InvalidQuery` when neither `from_ts` nor a
    /// positive `limit` is given.
    pub fn validate(&self) -> Result<(), MarketError> {
        match (self.from_ts, self.limit) {
            (Some(_), _) | (None, Some(1..)) => Ok(()),
            (None, Some(0)) => Err(MarketError::invalid("limit must be positive")),
            (None, None) => Err(MarketError::invalid(
                "one of from_ts or limit must be supplied",
            )),
        }
    }

    /// Drop bars outside `[from_ts, to_ts]`.
    pub fn retain_in_range(&self, bars: &mut Vec<Bar>) {
        if let Some(from_ts) = self.from_ts {
            bars.retain(|b| b.timestamp >= from_ts);
        }
        if let Some(to_ts) = self.to_ts {
            bars.retain(|b| b.timestamp <= to_ts);
        }
    }
}

// =============================================================================
// Page Walk
// =============================================================================

/// One raw fetch to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Bars back from the most recent one.
    pub offset: usize,
    /// Bars to fetch.
    pub count: usize,
}

#[derive(Debug, Clone)]
enum Mode {
    Since { from_ts: i64 },
    Latest { limit: usize, remaining: Vec<usize> },
}

/// Stateful page walk for one query.
///
/// Call [`Backfill::next_page`] until it returns `None`, feeding each fetched
/// page to [`Backfill::absorb`], then collect with [`Backfill::finish`].
#[derive(Debug, Clone)]
pub struct Backfill {
    query: HistoryQuery,
    mode: Mode,
    page_size: usize,
    max_pages: usize,
    offset: usize,
    pages: usize,
    done: bool,
    bars: Vec<Bar>,
}

impl Backfill {
    /// Plan the walk for `query`.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::InvalidQuery` for a query without a lower bound
    /// or a zero page size.
    pub fn new(query: HistoryQuery, page_size: usize, max_pages: usize) -> Result<Self, MarketError> {
        query.validate()?;
        if page_size == 0 {
            return Err(MarketError::invalid("page size must be positive"));
        }

        let mode = if let Some(from_ts) = query.from_ts {
            Mode::Since { from_ts }
        } else {
            let limit = query.limit.unwrap_or_default();
            Mode::Latest {
                limit,
                remaining: latest_page_counts(limit, page_size),
            }
        };

        Ok(Self {
            query,
            mode,
            page_size,
            max_pages,
            offset: 0,
            pages: 0,
            done: false,
            bars: Vec::new(),
        })
    }

    /// Next fetch to perform, or `None` once the walk is complete.
    #[must_use]
    pub fn next_page(&self) -> Option<PageRequest> {
        if self.done {
            return None;
        }
        let count = match &self.mode {
            Mode::Since { .. } => self.page_size,
            Mode::Latest { remaining, .. } => *remaining.first()?,
        };
        Some(PageRequest {
            offset: self.offset,
            count,
        })
    }

    /// Pages absorbed so far.
    #[must_use]
    pub const fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Merge a most-recent-first page into the result.
    ///
    /// A since-walk ends once it reaches `from_ts` or a page adds nothing
    /// older, and advances by the bars actually served. A short page alone
    /// does not end it. A latest-walk ends on its last planned page or on a
    /// short page.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::RangeTooLarge` when a since-walk still needs
    /// more pages after `max_pages`.
    pub fn absorb(&mut self, page: Vec<Bar>) -> Result<(), MarketError> {
        let requested = self.next_page().map_or(0, |req| req.count);
        let served = page.len();
        let before = self.bars.len();
        self.pages += 1;
        stitch(&mut self.bars, page);

        match &mut self.mode {
            Mode::Since { from_ts } => {
                self.offset += served;
                let reached = self.bars.first().is_some_and(|b| b.timestamp < *from_ts);
                let stalled = self.bars.len() == before;
                self.done = reached || stalled;
                if !self.done && self.pages >= self.max_pages {
                    return Err(MarketError::RangeTooLarge {
                        pages: self.max_pages,
                    });
                }
            }
            Mode::Latest { remaining, .. } => {
                self.offset += requested;
                if !remaining.is_empty() {
                    remaining.remove(0);
                }
                self.done = served < requested || remaining.is_empty();
            }
        }
        Ok(())
    }

    /// Finish the walk: apply range filters and return bars ascending.
    #[must_use]
    pub fn finish(self) -> Vec<Bar> {
        let mut bars = self.bars;
        self.query.retain_in_range(&mut bars);
        if let Mode::Latest { limit, .. } = self.mode {
            let excess = bars.len().saturating_sub(limit);
            bars.drain(..excess);
        }
        bars
    }
}

/// Page counts for a latest-`limit` walk.
fn latest_page_counts(limit: usize, page_size: usize) -> Vec<usize> {
    let mut counts = vec![page_size; limit / page_size];
    let partial = limit % page_size;
    if partial > 0 {
        counts.push(partial);
    }
    counts
}

/// Prepend a most-recent-first `page` to the ascending `acc`.
///
/// Bars at or after the current oldest accumulated timestamp are dropped.
pub fn stitch(acc: &mut Vec<Bar>, page: Vec<Bar>) {
    let oldest = acc.first().map(|b| b.timestamp);
    let mut older: Vec<Bar> = page
        .into_iter()
        .rev()
        .filter(|b| oldest.is_none_or(|ts| b.timestamp < ts))
        .collect();
    older.dedup_by_key(|b| b.timestamp);
    older.append(acc);
    *acc = older;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use test_case::test_case;

    use super::*;

    fn bar(ts: i64) -> Bar {
        Bar::new(ts, Decimal::ONE, Decimal::ONE, Decimal::ONE, Decimal::ONE, ts)
    }

    /// Upstream holding ascending `series`; serves most-recent-first pages.
    fn page(series: &[Bar], req: PageRequest) -> Vec<Bar> {
        series
            .iter()
            .rev()
            .skip(req.offset)
            .take(req.count)
            .cloned()
            .collect()
    }

    fn drive(series: &[Bar], query: HistoryQuery, page_size: usize) -> Result<Vec<Bar>, MarketError> {
        drive_capped(series, query, page_size, usize::MAX)
    }

    /// Like [`drive`], against an upstream that never serves more than `cap`.
    fn drive_capped(
        series: &[Bar],
        query: HistoryQuery,
        page_size: usize,
        cap: usize,
    ) -> Result<Vec<Bar>, MarketError> {
        let mut walk = Backfill::new(query, page_size, 1000)?;
        while let Some(mut req) = walk.next_page() {
            req.count = req.count.min(cap);
            walk.absorb(page(series, req))?;
        }
        Ok(walk.finish())
    }

    fn series(n: i64) -> Vec<Bar> {
        (1..=n).map(bar).collect()
    }

    fn stamps(bars: &[Bar]) -> Vec<i64> {
        bars.iter().map(|b| b.timestamp).collect()
    }

    #[test]
    fn since_scenario_with_page_size_three() {
        let out = drive(&series(9), HistoryQuery::since(4), 3).unwrap();
        assert_eq!(stamps(&out), vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn since_before_history_returns_everything() {
        let out = drive(&series(10), HistoryQuery::since(-5), 3).unwrap();
        assert_eq!(stamps(&out), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn since_with_upper_bound() {
        let out = drive(&series(20), HistoryQuery::since(5).until(8), 4).unwrap();
        assert_eq!(stamps(&out), vec![5, 6, 7, 8]);
    }

    #[test_case(5, 3 ; "full and partial page")]
    #[test_case(6, 3 ; "exact pages")]
    #[test_case(2, 700 ; "single partial page")]
    fn latest_returns_most_recent(limit: usize, page_size: usize) {
        let out = drive(&series(50), HistoryQuery::latest(limit), page_size).unwrap();
        assert_eq!(out.len(), limit);
        assert_eq!(out.last().unwrap().timestamp, 50);
        assert!(out.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn latest_beyond_history_returns_all() {
        let out = drive(&series(4), HistoryQuery::latest(100), 3).unwrap();
        assert_eq!(stamps(&out), vec![1, 2, 3, 4]);
    }

    #[test]
    fn latest_with_upper_bound() {
        let out = drive(&series(10), HistoryQuery::latest(5).until(8), 3).unwrap();
        assert_eq!(stamps(&out), vec![6, 7, 8]);
    }

    #[test]
    fn from_ts_wins_over_limit() {
        let query = HistoryQuery {
            from_ts: Some(3),
            limit: Some(1),
            ..HistoryQuery::default()
        };
        let out = drive(&series(6), query, 2).unwrap();
        assert_eq!(stamps(&out), vec![3, 4, 5, 6]);
    }

    #[test]
    fn missing_bounds_is_programmer_error() {
        let err = Backfill::new(HistoryQuery::default(), 700, 1000).unwrap_err();
        assert!(err.is_programmer_error());
        let err = Backfill::new(HistoryQuery::latest(0), 700, 1000).unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[test]
    fn stitch_drops_overlapping_boundary() {
        let mut acc = vec![bar(4), bar(5), bar(6)];
        stitch(&mut acc, vec![bar(4), bar(3), bar(2)]);
        assert_eq!(stamps(&acc), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn drift_mid_walk_does_not_duplicate() {
        let mut walk = Backfill::new(HistoryQuery::since(1), 3, 1000).unwrap();
        walk.absorb(vec![bar(9), bar(8), bar(7)]).unwrap();
        // A new bar closed: the upstream shifted by one.
        walk.absorb(vec![bar(7), bar(6), bar(5)]).unwrap();
        walk.absorb(vec![bar(4), bar(3), bar(2)]).unwrap();
        walk.absorb(vec![bar(1)]).unwrap();
        assert!(walk.next_page().is_some());
        walk.absorb(Vec::new()).unwrap();
        assert!(walk.next_page().is_none());
        assert_eq!(stamps(&walk.finish()), (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn since_keeps_walking_when_upstream_caps_pages() {
        let out = drive_capped(&series(2000), HistoryQuery::since(1), 700, 500).unwrap();
        assert_eq!(out.len(), 2000);
        assert_eq!(out.first().unwrap().timestamp, 1);
        assert!(out.windows(2).all(|w| w[0].timestamp + 1 == w[1].timestamp));
    }

    #[test]
    fn since_advances_offset_by_bars_served() {
        let mut walk = Backfill::new(HistoryQuery::since(1), 700, 1000).unwrap();
        walk.absorb(page(&series(2000), PageRequest { offset: 0, count: 500 }))
            .unwrap();
        assert_eq!(walk.next_page(), Some(PageRequest { offset: 500, count: 700 }));
    }

    #[test]
    fn since_stops_when_page_adds_nothing_older() {
        let mut walk = Backfill::new(HistoryQuery::since(1), 3, 1000).unwrap();
        walk.absorb(vec![bar(9), bar(8), bar(7)]).unwrap();
        walk.absorb(vec![bar(9), bar(8), bar(7)]).unwrap();
        assert!(walk.next_page().is_none());
        assert_eq!(stamps(&walk.finish()), vec![7, 8, 9]);
    }

    #[test]
    fn since_walk_is_bounded() {
        let mut walk = Backfill::new(HistoryQuery::since(0), 2, 2).unwrap();
        walk.absorb(vec![bar(100), bar(99)]).unwrap();
        let err = walk.absorb(vec![bar(98), bar(97)]).unwrap_err();
        assert_eq!(err, MarketError::RangeTooLarge { pages: 2 });
    }

    #[test]
    fn empty_upstream_yields_empty_result() {
        assert!(drive(&[], HistoryQuery::since(0), 3).unwrap().is_empty());
        assert!(drive(&[], HistoryQuery::latest(7), 3).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn since_returns_exact_suffix(
            len in 0i64..200,
            from in -10i64..220,
            page_size in 1usize..40,
            cap in 1usize..40,
        ) {
            let all = series(len);
            let out = drive(&all, HistoryQuery::since(from), page_size).unwrap();
            let capped = drive_capped(&all, HistoryQuery::since(from), page_size, cap).unwrap();
            prop_assert_eq!(stamps(&capped), stamps(&out));
            let expected: Vec<i64> = (1..=len).filter(|ts| *ts >= from).collect();
            prop_assert_eq!(stamps(&out), expected);
        }

        #[test]
        fn latest_returns_exact_tail(
            len in 0i64..200,
            limit in 1usize..250,
            page_size in 1usize..40,
        ) {
            let all = series(len);
            let out = drive(&all, HistoryQuery::latest(limit), page_size).unwrap();
            let take = limit.min(all.len());
            prop_assert_eq!(stamps(&out), stamps(&all[all.len() - take..]));
        }
    }
}
