//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    CacheSettings, ConfigError, RelayConfig, ServerSettings, SourceKind, TdxSettings,
};
