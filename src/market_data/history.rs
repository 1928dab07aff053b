use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{Candle, SymbolHistory};

// ---------------------------------------------------------------------------
// HistoryCache -- bounded sliding window per symbol
// ---------------------------------------------------------------------------

type Slot = Arc<Mutex<SymbolHistory>>;

/// Per-symbol, time-ordered, bounded candle store.
///
/// Each symbol owns its own mutex, so writers for different symbols never
/// contend; the outer map lock is only held long enough to find or create a
/// slot.  Readers always receive a copy, never a reference into the store.
///
/// The `*_then` variants run a closure while the symbol lock is still held.
/// The relay pipeline uses them to make "write + publish" and
/// "snapshot + register" atomic with respect to each other.
pub struct HistoryCache {
    symbols: RwLock<HashMap<String, Slot>>,
    limit: usize,
}

impl HistoryCache {
    /// Create a cache that retains at most `limit` candles per symbol.
    pub fn new(limit: usize) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn slot(&self, symbol: &str) -> Slot {
        if let Some(slot) = self.symbols.read().get(symbol) {
            return slot.clone();
        }
        self.symbols
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(self.limit + 1))))
            .clone()
    }

    /// Insert `candle`, replacing any entry with the same `open_time`, and
    /// return a copy of the resulting window.
    pub fn upsert(&self, symbol: &str, candle: Candle) -> SymbolHistory {
        self.upsert_then(symbol, candle, |history| history.to_vec())
    }

    /// Like [`upsert`](Self::upsert), but hands the updated window to `f`
    /// before the symbol lock is released.
    ///
    /// A candle older than everything in a full window is inserted and then
    /// immediately truncated away.
    pub fn upsert_then<R>(
        &self,
        symbol: &str,
        candle: Candle,
        f: impl FnOnce(&[Candle]) -> R,
    ) -> R {
        let slot = self.slot(symbol);
        let mut history = slot.lock();

        // Updates almost always land on the last bar, so the search below is
        // effectively constant time.
        match history.binary_search_by_key(&candle.open_time, |c| c.open_time) {
            Ok(idx) => history[idx] = candle,
            Err(idx) => history.insert(idx, candle),
        }

        if history.len() > self.limit {
            let excess = history.len() - self.limit;
            history.drain(..excess);
        }

        f(&history)
    }

    /// Copy of the current window, empty when nothing is cached.
    pub fn get(&self, symbol: &str) -> SymbolHistory {
        let slot = self.symbols.read().get(symbol).cloned();
        match slot {
            Some(slot) => slot.lock().clone(),
            None => Vec::new(),
        }
    }

    /// Run `f` over the current window while holding the symbol lock.
    pub fn read_then<R>(&self, symbol: &str, f: impl FnOnce(&[Candle]) -> R) -> R {
        let slot = self.slot(symbol);
        let history = slot.lock();
        f(&history)
    }

    /// Seed an empty window from a backfill.  Returns `false` (and leaves the
    /// window untouched) when live data has already arrived.
    pub fn seed(&self, symbol: &str, mut candles: Vec<Candle>) -> bool {
        let slot = self.slot(symbol);
        let mut history = slot.lock();
        if !history.is_empty() {
            return false;
        }

        // Stable sort keeps the later of two duplicates last, so dedup keeps
        // the newest copy of each bar.
        candles.sort_by_key(|c| c.open_time);
        candles.reverse();
        candles.dedup_by_key(|c| c.open_time);
        candles.reverse();

        if candles.len() > self.limit {
            let excess = candles.len() - self.limit;
            candles.drain(..excess);
        }

        *history = candles;
        true
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.symbols
            .read()
            .get(symbol)
            .map_or(0, |slot| slot.lock().len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
