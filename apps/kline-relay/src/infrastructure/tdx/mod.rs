//! TDX Quote Gateway Adapter
//!
//! [`MarketAdapter`] over an HTTP/JSON gateway fronting a TDX-style quote
//! server. The gateway only answers "`count` bars starting `offset` back from
//! the most recent", so live streaming and range queries both come from the
//! provided trait methods.
//!
//! # Endpoints
//!
//! - `GET {host}/markets`: market catalog, loaded by `connect`
//! - `GET {host}/bars?category&market&code&start&count`: bars, oldest first,
//!   timestamps in exchange local time
//!
//! Requests are serialized through one async mutex, matching the single
//! session a TDX server grants per client.

mod wire;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::ports::MarketAdapter;
use crate::domain::{Bar, MarketError, Symbol, Timeframe};

pub use wire::{MarketEntry, WireBar, category, market_id};

/// Gateway connection settings.
#[derive(Debug, Clone)]
pub struct TdxConfig {
    /// Base URL of the gateway.
    pub host: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

#[derive(Debug, Default)]
struct Session {
    catalog: Option<HashSet<u16>>,
}

/// Polling adapter for a TDX quote gateway.
#[derive(Debug)]
pub struct TdxMarket {
    client: Client,
    host: String,
    session: Mutex<Session>,
}

impl TdxMarket {
    /// Create a disconnected adapter.
    ///
    /// # Errors
    ///
    /// Returns `MarketError::Connection` if the HTTP client cannot be built.
    pub fn new(config: TdxConfig) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MarketError::Connection {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            session: Mutex::new(Session::default()),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketError> {
        let url = format!("{}{path}", self.host);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| MarketError::transient(format!("GET {path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(categorize_status(status, path, &body));
        }

        response.json().await.map_err(|e| MarketError::Protocol {
            message: format!("GET {path}: {e}"),
        })
    }
}

fn categorize_status(status: StatusCode, path: &str, body: &str) -> MarketError {
    let message = format!("GET {path}: {status} {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        MarketError::transient(message)
    } else {
        MarketError::Protocol { message }
    }
}

#[async_trait]
impl MarketAdapter for TdxMarket {
    fn name(&self) -> &str {
        "tdx"
    }

    async fn connect(&self) -> Result<(), MarketError> {
        let mut session = self.session.lock().await;
        if session.catalog.is_some() {
            return Ok(());
        }

        let markets: Vec<MarketEntry> = self.get("/markets", &[]).await.map_err(|e| {
            MarketError::Connection {
                message: format!("{}: {e}", self.host),
            }
        })?;
        info!(host = %self.host, markets = markets.len(), "Connected to quote gateway");
        session.catalog = Some(markets.into_iter().map(|m| m.market).collect());
        Ok(())
    }

    async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if session.catalog.take().is_some() {
            info!(host = %self.host, "Disconnected from quote gateway");
        }
    }

    async fn fetch_window(
        &self,
        timeframe: Timeframe,
        symbol: &Symbol,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Bar>, MarketError> {
        if count == 0 {
            return Err(MarketError::invalid("count must be positive"));
        }

        let session = self.session.lock().await;
        let catalog = session.catalog.as_ref().ok_or(MarketError::NotConnected)?;
        let market = market_id(symbol.market())
            .filter(|id| catalog.contains(id))
            .ok_or_else(|| MarketError::UnknownSymbol {
                symbol: symbol.to_string(),
            })?;

        let query = [
            ("category", category(timeframe).to_string()),
            ("market", market.to_string()),
            ("code", symbol.code().to_string()),
            ("start", offset.to_string()),
            ("count", count.to_string()),
        ];
        let result: Result<Vec<WireBar>, MarketError> = self.get("/bars", &query).await;
        drop(session);

        let wire = result.inspect_err(|err| {
            warn!(%symbol, error = %err, "Bar request failed");
        })?;

        let mut bars = wire.iter().map(wire::to_bar).collect::<Result<Vec<_>, _>>()?;
        bars.reverse();
        debug!(%symbol, offset, count, returned = bars.len(), "Fetched bars");
        Ok(bars)
    }
}
