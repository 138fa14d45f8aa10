//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete market adapters behind the `MarketAdapter` port, the outbound
//! publisher, the HTTP surface and the ambient runtime plumbing.

/// Per-symbol broadcast topics and the publish loop.
pub mod broadcast;

/// Caching decorator and bar stores.
pub mod cache;

/// Environment configuration.
pub mod config;

/// Method surface, SSE stream, health and metrics endpoints.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Scripted and generated in-memory market.
pub mod simulated;

/// TDX quote gateway adapter.
pub mod tdx;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
