//! Relay Configuration Settings
//!
//! Configuration types for the kline relay, loaded from environment variables.

use std::time::Duration;

use crate::application::ports::{HistorySettings, WatchOptions};
use crate::application::services::{RetryConfig, StreamSettings};
use crate::domain::{Symbol, Timeframe};

/// Upstream quote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// TDX-style quote gateway over HTTP.
    #[default]
    Tdx,
    /// Generated in-memory data.
    Simulated,
}

impl SourceKind {
    /// Parse source kind from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "simulated" | "sim" => Self::Simulated,
            _ => Self::Tdx,
        }
    }

    /// Get the source name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tdx => "tdx",
            Self::Simulated => "simulated",
        }
    }
}

/// Quote gateway connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdxSettings {
    /// Gateway base URL, e.g. `http://10.0.0.5:7709`.
    pub host: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

/// Caching decorator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Wrap the source in the caching decorator.
    pub enabled: bool,
    /// Bars fetched when warming an empty store.
    pub warmup_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            warmup_limit: 5000,
        }
    }
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// HTTP port for the method surface, streams, health and metrics.
    pub http_port: u16,
    /// Buffer of each per-symbol broadcast topic.
    pub topic_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8090,
            topic_capacity: 1024,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream source.
    pub source: SourceKind,
    /// Gateway settings, present when `source` is `Tdx`.
    pub tdx: Option<TdxSettings>,
    /// Symbols to stream.
    pub symbols: Vec<Symbol>,
    /// Streaming service settings.
    pub stream: StreamSettings,
    /// Caching decorator settings.
    pub cache: CacheSettings,
    /// Server settings.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let source = env
            .get("KLINE_SOURCE")
            .map(|s| SourceKind::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let tdx = match source {
            SourceKind::Tdx => Some(TdxSettings {
                host: env.required("TDX_HOST")?,
                request_timeout: env.duration_millis("TDX_REQUEST_TIMEOUT_MS", Duration::from_secs(5)),
            }),
            SourceKind::Simulated => None,
        };

        let symbols = parse_symbols(&env.required("KLINE_SYMBOLS")?)?;

        let minutes = env.parse("KLINE_TIMEFRAME", 1u32);
        let timeframe = Timeframe::try_from(minutes).map_err(|err| ConfigError::InvalidValue {
            key: "KLINE_TIMEFRAME".to_string(),
            message: err.to_string(),
        })?;

        let defaults = StreamSettings::default();
        let retry = RetryConfig {
            initial_delay: env.duration_millis("KLINE_RETRY_INITIAL_MS", RetryConfig::default().initial_delay),
            max_delay: env.duration_millis("KLINE_RETRY_MAX_MS", RetryConfig::default().max_delay),
            ..RetryConfig::default()
        };

        let stream = StreamSettings {
            timeframe,
            queue_capacity: env.parse("KLINE_QUEUE_CAPACITY", defaults.queue_capacity),
            shutdown_grace: env.duration_millis("KLINE_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            watch: WatchOptions {
                poll_interval: env.duration_millis("KLINE_POLL_INTERVAL_MS", defaults.watch.poll_interval),
                lookback: env.parse("KLINE_LOOKBACK", defaults.watch.lookback),
                retry: retry.clone().unlimited(),
            },
            history: HistorySettings {
                page_size: env.parse("KLINE_PAGE_SIZE", defaults.history.page_size),
                max_pages: env.parse("KLINE_MAX_PAGES", defaults.history.max_pages),
                retry: RetryConfig {
                    max_attempts: env.parse("KLINE_FETCH_MAX_ATTEMPTS", retry.max_attempts),
                    ..retry
                },
            },
        };

        let cache = CacheSettings {
            enabled: env.flag("KLINE_CACHE_ENABLED", CacheSettings::default().enabled),
            warmup_limit: env.parse("KLINE_CACHE_WARMUP_LIMIT", CacheSettings::default().warmup_limit),
        };

        let server = ServerSettings {
            http_port: env.parse("KLINE_HTTP_PORT", ServerSettings::default().http_port),
            topic_capacity: env.parse("KLINE_TOPIC_CAPACITY", ServerSettings::default().topic_capacity),
        };

        Ok(Self {
            source,
            tdx,
            symbols,
            stream,
            cache,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be interpreted.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// What was wrong.
        message: String,
    },
}

fn parse_symbols(raw: &str) -> Result<Vec<Symbol>, ConfigError> {
    let mut symbols: Vec<Symbol> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let symbol = part.parse().map_err(|err: crate::domain::MarketError| {
            ConfigError::InvalidValue {
                key: "KLINE_SYMBOLS".to_string(),
                message: err.to_string(),
            }
        })?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    if symbols.is_empty() {
        return Err(ConfigError::EmptyValue("KLINE_SYMBOLS".to_string()));
    }
    Ok(symbols)
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key).map_or(default, |v| {
            matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
