//! Market error types.

use thiserror::Error;

/// Errors raised by market adapters and the algorithms built on them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// Upstream rejected or did not answer a connection attempt.
    #[error("connection failed: {message}")]
    Connection {
        /// Failure description.
        message: String,
    },

    /// A fetch was attempted before `connect` succeeded.
    #[error("adapter is not connected")]
    NotConnected,

    /// A single fetch failed and may succeed if retried.
    #[error("transient fetch failure: {message}")]
    TransientFetch {
        /// Failure description.
        message: String,
    },

    /// Retries for one history page ran out.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Rendering of the last failure.
        last_error: String,
    },

    /// The symbol's market is not in the adapter catalog.
    #[error("unknown symbol: {symbol}")]
    UnknownSymbol {
        /// The symbol as requested.
        symbol: String,
    },

    /// Caller supplied an invalid query or argument.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// What was wrong.
        message: String,
    },

    /// Timeframe in minutes that no adapter supports.
    #[error("unsupported timeframe: {0} minutes")]
    UnsupportedTimeframe(u32),

    /// Backfill walked more pages than allowed.
    #[error("range too large: exceeded {pages} pages")]
    RangeTooLarge {
        /// Page limit that was hit.
        pages: usize,
    },

    /// Upstream payload could not be decoded.
    #[error("protocol error: {message}")]
    Protocol {
        /// Decoding failure.
        message: String,
    },

    /// Bar store failure.
    #[error("store error: {message}")]
    Store {
        /// Store failure.
        message: String,
    },
}

impl MarketError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }

    /// Whether the caller passed bad input.
    #[must_use]
    pub const fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidQuery { .. } | Self::UnsupportedTimeframe(_)
        )
    }

    /// Stable snake_case label used in metrics and error bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::NotConnected => "not_connected",
            Self::TransientFetch { .. } => "transient_fetch",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::UnknownSymbol { .. } => "unknown_symbol",
            Self::InvalidQuery { .. } => "invalid_query",
            Self::UnsupportedTimeframe(_) => "unsupported_timeframe",
            Self::RangeTooLarge { .. } => "range_too_large",
            Self::Protocol { .. } => "protocol",
            Self::Store { .. } => "store",
        }
    }

    /// Shorthand for a transient fetch failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFetch {
            message: message.into(),
        }
    }

    /// Shorthand for an invalid query.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_fetch_is_transient() {
        assert!(MarketError::transient("timeout").is_transient());
        assert!(!MarketError::NotConnected.is_transient());
        assert!(
            !MarketError::Protocol {
                message: "bad json".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn programmer_errors() {
        assert!(MarketError::invalid("no range").is_programmer_error());
        assert!(MarketError::UnsupportedTimeframe(2).is_programmer_error());
        assert!(
            !MarketError::UnknownSymbol {
                symbol: "X.y".into()
            }
            .is_programmer_error()
        );
    }

    #[test]
    fn display_includes_context() {
        let err = MarketError::RetriesExhausted {
            attempts: 5,
            last_error: "timeout".into(),
        };
        assert_eq!(err.to_string(), "retries exhausted after 5 attempts: timeout");
        assert_eq!(err.kind(), "retries_exhausted");
    }
}
