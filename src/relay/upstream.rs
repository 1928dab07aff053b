//! Contract expected from the upstream market-data provider.
//!
//! The provider hands over raw JSON; normalisation into `Candle` happens in
//! `market_data::kline` so the relay core never depends on a wire format.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::relay::error::UpstreamError;

/// Push stream of raw kline ticks for one symbol.  The stream is active until
/// the provider closes it; reconnecting in between is the provider's job.
pub type TickStream = mpsc::Receiver<Value>;

#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    /// Open the kline push stream for `symbol`.  Resolves once the provider
    /// has confirmed the subscription, or with the reason it could not.
    async fn subscribe(&self, symbol: &str, interval: &str) -> Result<TickStream, UpstreamError>;

    /// Fetch up to `limit` of the most recent bars.  The body is returned
    /// as-is; it may be positional rows, keyed rows or a single object.
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> anyhow::Result<Value>;
}
