// =============================================================================
// Kline normalization — upstream stream ticks and REST rows into `Candle`
// =============================================================================
//
// The upstream provider speaks two dialects:
//
//   * Stream ticks, either a single-stream payload `{ "e": "kline", "s", "k" }`
//     or the combined-stream envelope `{ "stream", "data": { "s", "k" } }`.
//   * REST backfill rows, either positional arrays
//     `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
//       trades, takerBuyBase, takerBuyQuote, ignore]`
//     or keyed objects using long (`openTime`) or short (`t`) field names.
//
// Everything downstream only ever sees `Candle`.
// =============================================================================

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::relay::error::{MalformedTick, ShapeError};
use crate::types::Candle;

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// The upstream sends decimals as JSON strings, occasionally as numbers.
fn decimal_value(val: &Value) -> Option<Decimal> {
    match val {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn int_value(val: &Value) -> Option<i64> {
    match val {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_decimal(obj: &Value, key: &'static str) -> Result<Decimal, MalformedTick> {
    let val = obj.get(key).ok_or(MalformedTick::MissingField(key))?;
    decimal_value(val).ok_or(MalformedTick::InvalidField(key))
}

fn optional_decimal(obj: &Value, key: &'static str) -> Result<Decimal, MalformedTick> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Decimal::ZERO),
        Some(val) => decimal_value(val).ok_or(MalformedTick::InvalidField(key)),
    }
}

fn required_int(obj: &Value, key: &'static str) -> Result<i64, MalformedTick> {
    let val = obj.get(key).ok_or(MalformedTick::MissingField(key))?;
    int_value(val).ok_or(MalformedTick::InvalidField(key))
}

// ---------------------------------------------------------------------------
// Stream ticks
// ---------------------------------------------------------------------------

/// Normalise one push message from the kline stream.
///
/// `default_interval` fills in a missing `k.i`.  A tick that lacks any
/// price, volume or time field is rejected as a whole; nothing is partially
/// applied.
pub fn parse_stream_tick(raw: &Value, default_interval: &str) -> Result<Candle, MalformedTick> {
    // Support both combined-stream envelope and direct single-stream payload.
    let data = raw.get("data").unwrap_or(raw);

    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or(MalformedTick::MissingField("s"))?;

    let k = data
        .get("k")
        .filter(|k| k.is_object())
        .ok_or(MalformedTick::MissingField("k"))?;

    let interval = k
        .get("i")
        .and_then(Value::as_str)
        .unwrap_or(default_interval)
        .to_string();

    let open_time = required_int(k, "t")?;
    let close_time = required_int(k, "T")?;
    if open_time >= close_time {
        return Err(MalformedTick::InvertedTimes {
            open_time,
            close_time,
        });
    }

    let is_closed = k
        .get("x")
        .and_then(Value::as_bool)
        .ok_or(MalformedTick::MissingField("x"))?;

    let trade_count = match k.get("n") {
        None | Some(Value::Null) => 0,
        Some(v) => v.as_u64().ok_or(MalformedTick::InvalidField("n"))?,
    };

    Ok(Candle {
        symbol,
        interval,
        open_time,
        close_time,
        open: required_decimal(k, "o")?,
        high: required_decimal(k, "h")?,
        low: required_decimal(k, "l")?,
        close: required_decimal(k, "c")?,
        volume: required_decimal(k, "v")?,
        quote_volume: optional_decimal(k, "q")?,
        trade_count,
        taker_buy_volume: optional_decimal(k, "V")?,
        taker_buy_quote_volume: optional_decimal(k, "Q")?,
        first_trade_id: k.get("f").and_then(int_value),
        last_trade_id: k.get("L").and_then(int_value),
        is_closed,
    })
}

// ---------------------------------------------------------------------------
// REST backfill rows
// ---------------------------------------------------------------------------

/// Keyed-object encoding of a REST row.  Long and short field names are both
/// accepted.
#[derive(Debug, Deserialize)]
struct KeyedKline {
    #[serde(rename = "openTime", alias = "t")]
    open_time: Value,
    #[serde(rename = "closeTime", alias = "T", default)]
    close_time: Option<Value>,
    #[serde(alias = "i", default)]
    interval: Option<String>,
    #[serde(alias = "o")]
    open: Value,
    #[serde(alias = "h")]
    high: Value,
    #[serde(alias = "l")]
    low: Value,
    #[serde(alias = "c")]
    close: Value,
    #[serde(alias = "v")]
    volume: Value,
    #[serde(rename = "quoteAssetVolume", alias = "quoteVolume", alias = "q", default)]
    quote_volume: Option<Value>,
    #[serde(rename = "numberOfTrades", alias = "tradeCount", alias = "n", default)]
    trade_count: Option<Value>,
    #[serde(rename = "takerBuyBaseAssetVolume", alias = "V", default)]
    taker_buy_volume: Option<Value>,
    #[serde(rename = "takerBuyQuoteAssetVolume", alias = "Q", default)]
    taker_buy_quote_volume: Option<Value>,
    #[serde(rename = "firstTradeId", alias = "f", default)]
    first_trade_id: Option<Value>,
    #[serde(rename = "lastTradeId", alias = "L", default)]
    last_trade_id: Option<Value>,
    #[serde(rename = "isClosed", alias = "x", default)]
    is_closed: Option<bool>,
}

/// One REST row in either supported encoding.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawKline {
    Positional(Vec<Value>),
    Keyed(KeyedKline),
}

/// Minimum positional row: openTime .. closeTime.
const MIN_POSITIONAL_FIELDS: usize = 7;

fn shape_err(index: usize, reason: impl Into<String>) -> ShapeError {
    ShapeError::Row {
        index,
        reason: reason.into(),
    }
}

fn row_decimal(index: usize, val: Option<&Value>, name: &str) -> Result<Decimal, ShapeError> {
    match val {
        None | Some(Value::Null) => Ok(Decimal::ZERO),
        Some(v) => decimal_value(v).ok_or_else(|| shape_err(index, format!("{name} is not a decimal"))),
    }
}

fn row_required_decimal(index: usize, val: &Value, name: &str) -> Result<Decimal, ShapeError> {
    decimal_value(val).ok_or_else(|| shape_err(index, format!("{name} is not a decimal")))
}

fn row_time(index: usize, val: &Value, name: &str) -> Result<i64, ShapeError> {
    int_value(val).ok_or_else(|| shape_err(index, format!("{name} is not an integer")))
}

impl RawKline {
    fn into_candle(
        self,
        index: usize,
        symbol: &str,
        interval: &str,
        now_ms: i64,
    ) -> Result<Candle, ShapeError> {
        match self {
            RawKline::Positional(row) => {
                if row.len() < MIN_POSITIONAL_FIELDS {
                    return Err(shape_err(
                        index,
                        format!("positional row has {} fields, need {MIN_POSITIONAL_FIELDS}", row.len()),
                    ));
                }
                let open_time = row_time(index, &row[0], "openTime")?;
                let close_time = row_time(index, &row[6], "closeTime")?;
                let trade_count = match row.get(8) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v
                        .as_u64()
                        .ok_or_else(|| shape_err(index, "trade count is not an integer"))?,
                };
                finish(
                    index,
                    Candle {
                        symbol: symbol.to_string(),
                        interval: interval.to_string(),
                        open_time,
                        close_time,
                        open: row_required_decimal(index, &row[1], "open")?,
                        high: row_required_decimal(index, &row[2], "high")?,
                        low: row_required_decimal(index, &row[3], "low")?,
                        close: row_required_decimal(index, &row[4], "close")?,
                        volume: row_required_decimal(index, &row[5], "volume")?,
                        quote_volume: row_decimal(index, row.get(7), "quoteVolume")?,
                        trade_count,
                        taker_buy_volume: row_decimal(index, row.get(9), "takerBuyVolume")?,
                        taker_buy_quote_volume: row_decimal(index, row.get(10), "takerBuyQuoteVolume")?,
                        first_trade_id: None,
                        last_trade_id: None,
                        is_closed: close_time < now_ms,
                    },
                )
            }
            RawKline::Keyed(k) => {
                let open_time = row_time(index, &k.open_time, "openTime")?;
                let close_time = match &k.close_time {
                    Some(v) => row_time(index, v, "closeTime")?,
                    None => return Err(shape_err(index, "closeTime is missing")),
                };
                let trade_count = match &k.trade_count {
                    None | Some(Value::Null) => 0,
                    Some(v) => v
                        .as_u64()
                        .ok_or_else(|| shape_err(index, "trade count is not an integer"))?,
                };
                finish(
                    index,
                    Candle {
                        symbol: symbol.to_string(),
                        interval: k.interval.unwrap_or_else(|| interval.to_string()),
                        open_time,
                        close_time,
                        open: row_required_decimal(index, &k.open, "open")?,
                        high: row_required_decimal(index, &k.high, "high")?,
                        low: row_required_decimal(index, &k.low, "low")?,
                        close: row_required_decimal(index, &k.close, "close")?,
                        volume: row_required_decimal(index, &k.volume, "volume")?,
                        quote_volume: row_decimal(index, k.quote_volume.as_ref(), "quoteVolume")?,
                        trade_count,
                        taker_buy_volume: row_decimal(index, k.taker_buy_volume.as_ref(), "takerBuyVolume")?,
                        taker_buy_quote_volume: row_decimal(
                            index,
                            k.taker_buy_quote_volume.as_ref(),
                            "takerBuyQuoteVolume",
                        )?,
                        first_trade_id: k.first_trade_id.as_ref().and_then(int_value),
                        last_trade_id: k.last_trade_id.as_ref().and_then(int_value),
                        is_closed: k.is_closed.unwrap_or(close_time < now_ms),
                    },
                )
            }
        }
    }
}

fn finish(index: usize, candle: Candle) -> Result<Candle, ShapeError> {
    if candle.open_time >= candle.close_time {
        return Err(shape_err(index, "openTime is not before closeTime"));
    }
    Ok(candle)
}

/// Decode a REST backfill body into candles sorted by `open_time`.
///
/// Accepts an array of rows (each positional or keyed), a single keyed
/// object, or `null` (no data).  Anything else, or any row matching neither
/// encoding, is a [`ShapeError`].  Rows whose `close_time` is already in the
/// past relative to `now_ms` are marked closed unless the row says otherwise.
pub fn decode_backfill(
    symbol: &str,
    interval: &str,
    body: Value,
    now_ms: i64,
) -> Result<Vec<Candle>, ShapeError> {
    let rows: Vec<Value> = match body {
        Value::Null => return Ok(Vec::new()),
        Value::Array(rows) => rows,
        obj @ Value::Object(_) => vec![obj],
        other => return Err(ShapeError::Body(json_kind(&other))),
    };

    let mut candles = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let kind = json_kind(&row);
        let raw: RawKline = serde_json::from_value(row)
            .map_err(|e| shape_err(index, format!("{kind} row matches no kline encoding: {e}")))?;
        candles.push(raw.into_candle(index, symbol, interval, now_ms)?);
    }

    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

fn json_kind(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
