// =============================================================================
// Binance REST API Client — public kline queries for history backfill
// =============================================================================
//
// SECURITY: The API key is sent as the X-MBX-APIKEY header and is never
// logged or serialized.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::binance::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::runtime_config::Credentials;

pub const REST_BASE_URL: &str = "https://api.binance.com";

/// Request weight of GET /api/v3/klines.
const KLINES_WEIGHT: u32 = 2;
/// Largest `limit` the klines endpoint accepts.
const KLINES_MAX_LIMIT: u32 = 1000;

/// Binance REST API client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(credentials: &Credentials) -> Result<Self> {
        Self::with_base_url(credentials, REST_BASE_URL)
    }

    pub fn with_base_url(credentials: &Credentials, base_url: impl Into<String>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        let key = HeaderValue::from_str(&credentials.api_key)
            .context("BINANCE_API_KEY is not a valid header value")?;
        default_headers.insert("X-MBX-APIKEY", key);

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> RateLimitSnapshot {
        self.rate_limit.snapshot()
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines.
    ///
    /// The body is returned untouched; normalisation into candles happens in
    /// `market_data::kline`, which understands every row encoding the relay
    /// accepts.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines_raw(&self, symbol: &str, interval: &str, limit: u32) -> Result<Value> {
        if !self.rate_limit.can_send_request(KLINES_WEIGHT) {
            anyhow::bail!("request weight budget exhausted, klines for {symbol} not requested");
        }

        let limit = limit.clamp(1, KLINES_MAX_LIMIT);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        debug!(
            symbol,
            interval,
            rows = body.as_array().map_or(0, Vec::len),
            "klines fetched"
        );
        Ok(body)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(key: &str) -> Credentials {
        Credentials {
            api_key: key.into(),
            api_secret: "hunter2".into(),
        }
    }

    #[test]
    fn debug_output_hides_the_key() {
        let client = BinanceClient::new(&credentials("my-very-own-key")).unwrap();
        let shown = format!("{client:?}");
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains("my-very-own-key"));
    }

    #[test]
    fn key_with_control_characters_is_rejected() {
        assert!(BinanceClient::new(&credentials("bad\nkey")).is_err());
    }
}
