// =============================================================================
// Binance kline stream — the relay's upstream provider
// =============================================================================
//
// One WebSocket per (symbol, interval):
//
//   wss://stream.binance.com:9443/ws/<symbol>@kline_<interval>
//
// `subscribe` resolves once the first connection is up.  After that a pump
// task forwards every text frame into the tick channel and reconnects on its
// own after a drop.  It gives up, closing the channel, when the relay drops
// the receiver or when too many reconnects in a row fail.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::binance::client::BinanceClient;
use crate::relay::error::UpstreamError;
use crate::relay::upstream::{TickStream, UpstreamFeed};

pub const STREAM_BASE_URL: &str = "wss://stream.binance.com:9443";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 12;
const TICK_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binance REST + WebSocket market data behind the relay's upstream contract.
#[derive(Debug, Clone)]
pub struct BinanceFeed {
    client: BinanceClient,
    stream_base: String,
    reconnect_delay: Duration,
}

impl BinanceFeed {
    pub fn new(client: BinanceClient) -> Self {
        Self {
            client,
            stream_base: STREAM_BASE_URL.to_string(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    fn stream_url(&self, symbol: &str, interval: &str) -> String {
        format!(
            "{}/ws/{}@kline_{}",
            self.stream_base,
            symbol.to_lowercase(),
            interval
        )
    }
}

async fn connect(url: &str) -> Result<WsStream> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to kline WebSocket {url}"))?;
    Ok(ws_stream)
}

enum PumpEnd {
    /// The relay dropped its end of the tick channel.
    ReceiverGone,
    /// The socket closed or errored.
    Disconnected,
}

async fn forward(symbol: &str, ws_stream: &mut WsStream, tx: &mpsc::Sender<Value>) -> PumpEnd {
    loop {
        let msg = tokio::select! {
            _ = tx.closed() => return PumpEnd::ReceiverGone,
            msg = ws_stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => {
                    if tx.send(value).await.is_err() {
                        return PumpEnd::ReceiverGone;
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "kline frame is not JSON");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(symbol = %symbol, frame = ?frame, "kline WebSocket closed by server");
                return PumpEnd::Disconnected;
            }
            // Ping / Pong / Binary: tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "kline WebSocket read error");
                return PumpEnd::Disconnected;
            }
            None => {
                warn!(symbol = %symbol, "kline WebSocket stream ended");
                return PumpEnd::Disconnected;
            }
        }
    }
}

async fn pump(
    symbol: String,
    url: String,
    mut ws_stream: WsStream,
    tx: mpsc::Sender<Value>,
    delay: Duration,
) {
    loop {
        if let PumpEnd::ReceiverGone = forward(&symbol, &mut ws_stream, &tx).await {
            debug!(symbol = %symbol, "tick receiver dropped, closing kline WebSocket");
            return;
        }

        let mut attempts = 0;
        ws_stream = loop {
            if tx.is_closed() {
                return;
            }
            if attempts == MAX_RECONNECT_ATTEMPTS {
                error!(symbol = %symbol, attempts, "giving up on kline WebSocket");
                return;
            }
            attempts += 1;
            warn!(symbol = %symbol, attempt = attempts, "reconnecting kline WebSocket in {delay:?}");
            tokio::time::sleep(delay).await;

            match connect(&url).await {
                Ok(ws) => {
                    info!(symbol = %symbol, "kline WebSocket reconnected");
                    break ws;
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "kline reconnect failed"),
            }
        };
    }
}

#[async_trait]
impl UpstreamFeed for BinanceFeed {
    async fn subscribe(&self, symbol: &str, interval: &str) -> Result<TickStream, UpstreamError> {
        let url = self.stream_url(symbol, interval);
        info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

        let ws_stream = connect(&url).await?;
        info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");

        let (tx, rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        tokio::spawn(pump(
            symbol.to_string(),
            url,
            ws_stream,
            tx,
            self.reconnect_delay,
        ));
        Ok(rx)
    }

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Value> {
        let body = self.client.get_klines_raw(symbol, interval, limit).await?;
        debug!(symbol = %symbol, weight = ?self.client.rate_limit(), "backfill request done");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::Credentials;

    fn feed() -> BinanceFeed {
        let creds = Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
        };
        BinanceFeed::new(BinanceClient::new(&creds).unwrap())
    }

    #[test]
    fn stream_url_uses_lowercase_symbol() {
        assert_eq!(
            feed().stream_url("BTCUSDT", "1m"),
            "wss://stream.binance.com:9443/ws/btcusdt@kline_1m"
        );
    }

    #[tokio::test]
    async fn unreachable_stream_is_a_subscription_error() {
        let mut feed = feed();
        feed.stream_base = "ws://127.0.0.1:1".into();
        let err = feed.subscribe("BTCUSDT", "1m").await.unwrap_err();
        assert!(err.0.contains("kline WebSocket"));
    }
}
