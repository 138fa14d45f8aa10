//! Domain Layer - Kline types and the pure reconciliation/pagination logic.
//!
//! Nothing in this layer performs I/O. The application layer drives these
//! state machines from adapter fetches.

/// Market error taxonomy.
pub mod error;

/// Symbols, bars, timeframes and events.
pub mod market;

/// Page planning and stitching for history backfill.
pub mod pagination;

/// Live poll reconciliation state machine.
pub mod reconcile;

pub use error::MarketError;
pub use market::{Bar, EventKind, KlineEvent, RawWindow, Symbol, Timeframe};
