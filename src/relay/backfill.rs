use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::market_data::{kline, HistoryCache};
use crate::relay::error::BackfillError;
use crate::relay::upstream::UpstreamFeed;
use crate::types::now_ms;

/// Seeds empty symbol histories from the upstream REST endpoint.
///
/// At most one fetch per symbol is in flight: concurrent callers queue on a
/// per-symbol gate, and a caller that waited behind a completed fetch reuses
/// its outcome instead of issuing another request.  A failed fetch does not
/// count as completed, so the next waiter tries again.
pub struct BackfillFetcher {
    upstream: Arc<dyn UpstreamFeed>,
    interval: String,
    limit: usize,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

#[derive(Default)]
struct Gate {
    lock: tokio::sync::Mutex<()>,
    completed: AtomicU64,
}

impl BackfillFetcher {
    pub fn new(upstream: Arc<dyn UpstreamFeed>, interval: impl Into<String>, limit: usize) -> Self {
        Self {
            upstream,
            interval: interval.into(),
            limit,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, symbol: &str) -> Arc<Gate> {
        self.gates
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    /// Make sure `symbol` has history, fetching it if the cache is cold.
    ///
    /// Returns the number of candles seeded (zero on the hot path or when
    /// live data won the race).  No cache lock is held during the request.
    ///
    /// Seeding only fills the cache.  A subscriber that already attached to
    /// this symbol with an empty snapshot is not sent the backfilled bars;
    /// it sees live updates from its attach point on.
    pub async fn ensure_history(
        &self,
        symbol: &str,
        cache: &HistoryCache,
    ) -> Result<usize, BackfillError> {
        if !cache.is_empty(symbol) {
            return Ok(0);
        }

        let gate = self.gate(symbol);
        let seen = gate.completed.load(Ordering::Acquire);
        let _guard = gate.lock.lock().await;
        if !cache.is_empty(symbol) || gate.completed.load(Ordering::Acquire) != seen {
            return Ok(0);
        }

        let limit = u32::try_from(self.limit).unwrap_or(u32::MAX);
        let body = self
            .upstream
            .fetch_klines(symbol, &self.interval, limit)
            .await
            .map_err(BackfillError::Fetch)?;

        let candles = kline::decode_backfill(symbol, &self.interval, body, now_ms())?;
        gate.completed.fetch_add(1, Ordering::Release);
        let count = candles.len();
        if count == 0 {
            warn!(symbol = %symbol, "backfill returned no candles");
            return Ok(0);
        }

        if cache.seed(symbol, candles) {
            info!(symbol = %symbol, count, "history seeded from backfill");
            Ok(count.min(cache.limit()))
        } else {
            info!(symbol = %symbol, "live data arrived first, backfill discarded");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::error::{ShapeError, UpstreamError};
    use crate::relay::upstream::TickStream;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// REST-only fake that answers after a short delay with a fixed body.
    struct FakeRest {
        body: Value,
        calls: AtomicUsize,
    }

    impl FakeRest {
        fn new(body: Value) -> Arc<Self> {
            Arc::new(Self {
                body,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl UpstreamFeed for FakeRest {
        async fn subscribe(&self, _symbol: &str, _interval: &str) -> Result<TickStream, UpstreamError> {
            Err(UpstreamError("not used".into()))
        }

        async fn fetch_klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(self.body.clone())
        }
    }

    fn rows(n: i64) -> Value {
        Value::Array(
            (0..n)
                .rev()
                .map(|i| json!([i * 60_000, "1", "2", "0.5", "1.5", "3", i * 60_000 + 59_999, "4", 5]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn cold_symbol_is_seeded_sorted_and_bounded() {
        let rest = FakeRest::new(rows(5));
        let fetcher = BackfillFetcher::new(rest.clone(), "1m", 3);
        let cache = HistoryCache::new(3);

        let seeded = fetcher.ensure_history("BTCUSDT", &cache).await.unwrap();
        assert_eq!(seeded, 3);
        let times: Vec<i64> = cache.get("BTCUSDT").iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![120_000, 180_000, 240_000]);
    }

    #[tokio::test]
    async fn warm_symbol_skips_fetch() {
        let rest = FakeRest::new(rows(2));
        let fetcher = BackfillFetcher::new(rest.clone(), "1m", 30);
        let cache = HistoryCache::new(30);
        fetcher.ensure_history("BTCUSDT", &cache).await.unwrap();

        assert_eq!(fetcher.ensure_history("BTCUSDT", &cache).await.unwrap(), 0);
        assert_eq!(rest.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let rest = FakeRest::new(rows(2));
        let fetcher = BackfillFetcher::new(rest.clone(), "1m", 30);
        let cache = HistoryCache::new(30);

        let (a, b) = tokio::join!(
            fetcher.ensure_history("SOLUSDT", &cache),
            fetcher.ensure_history("SOLUSDT", &cache)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(rest.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len("SOLUSDT"), 2);
    }

    #[tokio::test]
    async fn empty_result_is_shared_by_waiting_callers() {
        let rest = FakeRest::new(Value::Null);
        let fetcher = BackfillFetcher::new(rest.clone(), "1m", 30);
        let cache = HistoryCache::new(30);

        let (a, b) = tokio::join!(
            fetcher.ensure_history("SOLUSDT", &cache),
            fetcher.ensure_history("SOLUSDT", &cache)
        );
        assert_eq!((a.unwrap(), b.unwrap()), (0, 0));
        assert_eq!(rest.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty("SOLUSDT"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_shape_error_and_cache_stays_empty() {
        let rest = FakeRest::new(json!("definitely not klines"));
        let fetcher = BackfillFetcher::new(rest, "1m", 30);
        let cache = HistoryCache::new(30);

        let err = fetcher.ensure_history("SOLUSDT", &cache).await.unwrap_err();
        assert!(matches!(err, BackfillError::Shape(ShapeError::Body("string"))));
        assert!(cache.is_empty("SOLUSDT"));
    }
}
