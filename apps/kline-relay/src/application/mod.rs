//! Application Layer - Services and port definitions.
//!
//! Drives the pure domain state machines from adapter fetches and defines
//! the ports the infrastructure layer implements.

/// Port interfaces for upstream sources and bar storage.
pub mod ports;

/// Streaming orchestration, polling, history and retry services.
pub mod services;
