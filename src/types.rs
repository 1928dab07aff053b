// =============================================================================
// Shared types used across the kline relay
// =============================================================================

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single OHLCV bar for one `(symbol, interval)` series.
///
/// Prices and volumes are fixed-point decimals and serialise as JSON strings,
/// so a value read from the upstream feed reaches subscribers unchanged.
/// `open_time` is the identity of the bar within its series: two candles with
/// the same `open_time` are the same bar at different points in its life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    /// Epoch milliseconds.
    pub open_time: i64,
    /// Epoch milliseconds, always greater than `open_time`.
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    #[serde(default)]
    pub taker_buy_volume: Decimal,
    #[serde(default)]
    pub taker_buy_quote_volume: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_trade_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_id: Option<i64>,
    /// True once the bar will never change again.
    pub is_closed: bool,
}

/// Time-ordered candles for one symbol, strictly increasing by `open_time`.
pub type SymbolHistory = Vec<Candle>;

/// Frames pushed to subscribers.
///
/// `History` and `Update` carry the candle ordering contract; `Info` and
/// `Error` are advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    History {
        symbol: String,
        interval: String,
        candles: SymbolHistory,
        timestamp: String,
    },
    Update {
        symbol: String,
        interval: String,
        candle: Candle,
        timestamp: String,
    },
    Info {
        message: String,
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
}

const ENCODE_FALLBACK: &str =
    r#"{"type":"error","message":"failed to encode server message","timestamp":""}"#;

impl ServerMessage {
    pub fn history(symbol: &str, interval: &str, candles: SymbolHistory) -> Self {
        Self::History {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            candles,
            timestamp: now_iso(),
        }
    }

    pub fn update(candle: Candle) -> Self {
        Self::Update {
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            candle,
            timestamp: now_iso(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
            timestamp: now_iso(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_iso(),
        }
    }

    /// Serialise once so the same payload can be shared by every subscriber.
    pub fn encode(&self) -> Arc<str> {
        match serde_json::to_string(self) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(error = %e, "failed to serialise server message");
                Arc::from(ENCODE_FALLBACK)
            }
        }
    }
}

/// Current wall-clock time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
