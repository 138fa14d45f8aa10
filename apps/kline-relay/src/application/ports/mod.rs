//! Port Interfaces
//!
//! Contracts between the relay's services and the outside world, following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketAdapter`: Upstream quote source (connect, fetch, watch, history)
//! - `BarStore`: Bar persistence behind the caching decorator

mod bar_store;
mod market_adapter;

#[cfg(test)]
pub use bar_store::MockBarStore;
pub use bar_store::BarStore;
pub use market_adapter::{HistorySettings, MarketAdapter, RawWindowStream, WatchOptions};
