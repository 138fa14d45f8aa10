//! Application Services
//!
//! Services that drive the domain state machines from adapter fetches.
//!
//! - `StreamingService`: Per-symbol task orchestration and history queries
//! - `SymbolTask`: Live reconciliation for one symbol
//! - `paginate`: Paged history backfill
//! - `Backoff`: Retry delays for transient fetch failures

/// Paged history backfill.
pub mod history;

/// Raw window polling stream.
pub mod polling;

/// Per-symbol reconciliation task.
pub mod reconciler;

/// Backoff and retry of transient fetch failures.
pub mod retry;

/// Task orchestration and the history method surface.
pub mod streaming;

pub use reconciler::{SymbolTask, TaskExit};
pub use retry::{Backoff, RetryConfig};
pub use streaming::{ServiceError, StreamSettings, StreamingService};
