// =============================================================================
// Stream Ingestor — one upstream kline subscription per symbol
// =============================================================================
//
// Per-symbol state machine:
//
//   NotStarted ──ensure_started──▶ Subscribing ──confirmed──▶ Streaming
//                                      │                          │
//                                      └──── error ──▶ Failed ◀── stream closed
//
// `Failed` is terminal for the lifetime of the relay.  Retrying a dropped
// connection is the upstream provider's concern; the ingestor never loops on
// a failed subscribe.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::market_data::kline;
use crate::relay::error::MalformedTick;
use crate::relay::pipeline::Pipeline;
use crate::relay::upstream::UpstreamFeed;
use crate::types::ServerMessage;

/// Lifecycle of the upstream subscription for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    NotStarted,
    Subscribing,
    Streaming,
    Failed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

type States = Arc<RwLock<HashMap<String, FeedState>>>;

/// Owns the upstream stream subscriptions and feeds every tick into the
/// pipeline.
pub struct StreamIngestor {
    upstream: Arc<dyn UpstreamFeed>,
    pipeline: Arc<Pipeline>,
    states: States,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamIngestor {
    pub fn new(upstream: Arc<dyn UpstreamFeed>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            upstream,
            pipeline,
            states: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the subscription for `symbol` unless it has been started before.
    /// Returns `true` only for the call that actually started it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_started(&self, symbol: &str) -> bool {
        {
            let mut states = self.states.write();
            if states.contains_key(symbol) {
                return false;
            }
            states.insert(symbol.to_string(), FeedState::Subscribing);
        }

        info!(symbol = %symbol, "starting upstream kline subscription");
        let handle = tokio::spawn(run_feed(
            symbol.to_string(),
            self.upstream.clone(),
            self.pipeline.clone(),
            self.states.clone(),
        ));
        self.tasks.lock().push(handle);
        true
    }

    pub fn state(&self, symbol: &str) -> FeedState {
        self.states
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(FeedState::NotStarted)
    }

    /// States of every symbol that has been started, sorted by symbol.
    pub fn states(&self) -> Vec<(String, FeedState)> {
        let mut all: Vec<_> = self
            .states
            .read()
            .iter()
            .map(|(sym, state)| (sym.clone(), *state))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Abort every ingestion task.  Dropping a task drops its tick stream,
    /// which tells the provider to stop.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn set_state(states: &States, symbol: &str, state: FeedState) {
    let prev = states.write().insert(symbol.to_string(), state);
    debug!(
        symbol = %symbol,
        from = %prev.unwrap_or(FeedState::NotStarted),
        to = %state,
        "feed state changed"
    );
}

async fn run_feed(
    symbol: String,
    upstream: Arc<dyn UpstreamFeed>,
    pipeline: Arc<Pipeline>,
    states: States,
) {
    let interval = pipeline.interval().to_string();

    let mut ticks = match upstream.subscribe(&symbol, &interval).await {
        Ok(ticks) => ticks,
        Err(e) => {
            set_state(&states, &symbol, FeedState::Failed);
            error!(symbol = %symbol, error = %e, "upstream subscription failed");
            pipeline.notify_all(ServerMessage::error(format!(
                "Live feed for {symbol} is unavailable."
            )));
            return;
        }
    };

    set_state(&states, &symbol, FeedState::Streaming);
    info!(symbol = %symbol, interval = %interval, "upstream kline subscription active");

    while let Some(raw) = ticks.recv().await {
        match normalise(&raw, &symbol, &interval) {
            Ok(candle) => {
                pipeline.apply(candle);
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "dropping malformed kline tick");
            }
        }
    }

    set_state(&states, &symbol, FeedState::Failed);
    warn!(symbol = %symbol, "upstream kline stream closed");
    pipeline.notify_all(ServerMessage::error(format!(
        "Live feed for {symbol} has stopped."
    )));
}

fn normalise(
    raw: &serde_json::Value,
    symbol: &str,
    interval: &str,
) -> Result<crate::types::Candle, MalformedTick> {
    let candle = kline::parse_stream_tick(raw, interval)?;
    if candle.interval != interval {
        return Err(MalformedTick::IntervalMismatch {
            expected: interval.to_string(),
            got: candle.interval,
        });
    }
    if candle.symbol != symbol {
        return Err(MalformedTick::SymbolMismatch {
            expected: symbol.to_string(),
            got: candle.symbol,
        });
    }
    Ok(candle)
}
