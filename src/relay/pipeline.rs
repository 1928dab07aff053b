use tracing::debug;

use crate::market_data::HistoryCache;
use crate::relay::error::SendFailed;
use crate::relay::hub::{BroadcastHub, SubscriberId};
use crate::types::{Candle, ServerMessage, SymbolHistory};

/// History cache and broadcast hub bound together.
///
/// Both write paths go through the symbol's cache lock:
///
/// * [`apply`](Self::apply) upserts a tick and publishes it before the lock is
///   released, so updates for one symbol leave in arrival order.
/// * [`attach`](Self::attach) sends the snapshot and registers the subscriber
///   for that symbol under the same lock, so no update can slip in before the
///   snapshot or fall between snapshot and registration.
///
/// Sinks never block, so holding the lock across delivery is cheap.
pub struct Pipeline {
    cache: HistoryCache,
    hub: BroadcastHub,
    interval: String,
}

impl Pipeline {
    pub fn new(history_limit: usize, interval: impl Into<String>) -> Self {
        Self {
            cache: HistoryCache::new(history_limit),
            hub: BroadcastHub::new(),
            interval: interval.into(),
        }
    }

    pub fn cache(&self) -> &HistoryCache {
        &self.cache
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    /// Store a normalised tick and fan it out.  Returns the number of
    /// subscribers it reached.
    ///
    /// A tick older than everything in a full window is truncated away by the
    /// cache and is not published either; subscribers only ever hear about
    /// bars the relay still holds.
    pub fn apply(&self, candle: Candle) -> usize {
        let symbol = candle.symbol.clone();
        let open_time = candle.open_time;
        let frame = ServerMessage::update(candle.clone()).encode();
        self.cache.upsert_then(&symbol, candle, |history| {
            if history.binary_search_by_key(&open_time, |c| c.open_time).is_err() {
                debug!(symbol = %symbol, open_time, "late tick fell outside the window");
                return 0;
            }
            let delivered = self.hub.publish(&symbol, frame);
            debug!(symbol = %symbol, delivered, "update published");
            delivered
        })
    }

    /// Deliver the current history of `symbol` to `id` and subscribe it to
    /// subsequent updates, atomically with respect to [`apply`](Self::apply).
    pub fn attach(&self, id: SubscriberId, symbol: &str) -> Result<SymbolHistory, SendFailed> {
        self.cache.read_then(symbol, |history| {
            let snapshot = history.to_vec();
            let frame = ServerMessage::history(symbol, &self.interval, snapshot.clone()).encode();
            self.hub.send_to(id, frame)?;
            if !self.hub.attach(id, symbol) {
                return Err(SendFailed::Closed);
            }
            Ok(snapshot)
        })
    }

    /// Advisory notice to every subscriber.
    pub fn notify_all(&self, message: ServerMessage) -> usize {
        self.hub.notify_all(message.encode())
    }

    /// Advisory notice to a single subscriber.
    pub fn notify(&self, id: SubscriberId, message: ServerMessage) -> Result<(), SendFailed> {
        self.hub.send_to(id, message.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::hub::ChannelSink;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::thread;

    fn candle(symbol: &str, open_time: i64) -> Candle {
        Candle {
            symbol: symbol.into(),
            interval: "1m".into(),
            open_time,
            close_time: open_time + 59_999,
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::from(open_time),
            volume: Decimal::ZERO,
            quote_volume: Decimal::ZERO,
            trade_count: 0,
            taker_buy_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
            first_trade_id: None,
            last_trade_id: None,
            is_closed: false,
        }
    }

    fn frames(rx: &mut tokio::sync::mpsc::Receiver<Arc<str>>) -> Vec<ServerMessage> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|raw| serde_json::from_str(&raw).unwrap())
            .collect()
    }

    #[test]
    fn attach_sends_snapshot_then_updates() {
        let pipeline = Pipeline::new(30, "1m");
        pipeline.apply(candle("BTCUSDT", 1_000));

        let (sink, mut rx) = ChannelSink::channel(16);
        let id = pipeline.hub().register(sink);
        let snapshot = pipeline.attach(id, "BTCUSDT").unwrap();
        assert_eq!(snapshot.len(), 1);

        pipeline.apply(candle("BTCUSDT", 2_000));
        pipeline.apply(candle("SOLUSDT", 2_000));

        let got = frames(&mut rx);
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[0], ServerMessage::History { candles, .. } if candles.len() == 1));
        assert!(matches!(&got[1], ServerMessage::Update { candle, .. } if candle.open_time == 2_000));
    }

    #[test]
    fn tick_older_than_a_full_window_is_not_published() {
        let pipeline = Pipeline::new(3, "1m");
        for t in [10, 20, 30] {
            pipeline.apply(candle("BTCUSDT", t));
        }

        let (sink, mut rx) = ChannelSink::channel(16);
        let id = pipeline.hub().register(sink);
        pipeline.attach(id, "BTCUSDT").unwrap();

        assert_eq!(pipeline.apply(candle("BTCUSDT", 5)), 0);
        let times: Vec<i64> = pipeline.cache().get("BTCUSDT").iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![10, 20, 30]);

        let got = frames(&mut rx);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], ServerMessage::History { .. }));

        assert_eq!(pipeline.apply(candle("BTCUSDT", 15)), 1);
    }

    #[test]
    fn attach_for_departed_subscriber_fails() {
        let pipeline = Pipeline::new(30, "1m");
        let (sink, _rx) = ChannelSink::channel(4);
        let id = pipeline.hub().register(sink);
        pipeline.hub().leave(id);
        assert_eq!(pipeline.attach(id, "BTCUSDT"), Err(SendFailed::Closed));
    }

    /// A subscriber joining mid-stream sees its snapshot followed by exactly
    /// the updates published after it, with nothing older than the snapshot
    /// and nothing missing.
    #[test]
    fn concurrent_join_is_gap_free() {
        for _ in 0..20 {
            let pipeline = Arc::new(Pipeline::new(1_000, "1m"));
            let total = 400;

            let writer = {
                let pipeline = pipeline.clone();
                thread::spawn(move || {
                    for t in 1..=total {
                        pipeline.apply(candle("BTCUSDT", t));
                    }
                })
            };

            let (sink, mut rx) = ChannelSink::channel(4_096);
            let id = pipeline.hub().register(sink);
            let snapshot = pipeline.attach(id, "BTCUSDT").unwrap();
            writer.join().unwrap();

            let newest = snapshot.last().map_or(0, |c| c.open_time);
            let got = frames(&mut rx);
            assert!(matches!(got[0], ServerMessage::History { .. }));

            let updates: Vec<i64> = got[1..]
                .iter()
                .map(|m| match m {
                    ServerMessage::Update { candle, .. } => candle.open_time,
                    other => panic!("unexpected frame {other:?}"),
                })
                .collect();
            let expected: Vec<i64> = ((newest + 1)..=total).collect();
            assert_eq!(updates, expected);
        }
    }
}
