//! Subscriber registry and best-effort fan-out.
//!
//! Delivery never waits on a subscriber: sinks are non-blocking, and any sink
//! that refuses a message (queue full or connection gone) is removed from the
//! registry on the spot.  A slow client loses its subscription instead of
//! stalling the feed for everyone else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::error::SendFailed;

/// Identity of one connected subscriber.
pub type SubscriberId = Uuid;

/// Anything that can accept a serialised frame without blocking.
pub trait SubscriberSink: Send + Sync {
    fn send(&self, message: Arc<str>) -> Result<(), SendFailed>;
}

/// Sink backed by a bounded mpsc queue.  The transport drains the receiver
/// into the socket; a full queue means the client is not keeping up.
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Arc<str>>) -> Self {
        Self { tx }
    }

    /// Convenience for the transport and for tests: a sink and the queue it
    /// feeds.
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx)), rx)
    }
}

impl SubscriberSink for ChannelSink {
    fn send(&self, message: Arc<str>) -> Result<(), SendFailed> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailed::Saturated,
            mpsc::error::TrySendError::Closed(_) => SendFailed::Closed,
        })
    }
}

struct Subscription {
    sink: Arc<dyn SubscriberSink>,
    /// Symbols whose updates this subscriber receives.  A symbol is added
    /// only after its snapshot has been delivered.
    symbols: HashSet<String>,
}

/// Registry of connected subscribers.
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscription>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink under a fresh id.  It receives advisory notices at once
    /// but no candle updates until a symbol is attached.
    pub fn register(&self, sink: Arc<dyn SubscriberSink>) -> SubscriberId {
        let id = Uuid::new_v4();
        self.subscribers.write().insert(
            id,
            Subscription {
                sink,
                symbols: HashSet::new(),
            },
        );
        debug!(subscriber = %id, "subscriber registered");
        id
    }

    /// Start delivering updates for `symbol` to `id`.  Returns `false` when
    /// the subscriber is no longer registered.
    pub fn attach(&self, id: SubscriberId, symbol: &str) -> bool {
        match self.subscribers.write().get_mut(&id) {
            Some(sub) => {
                sub.symbols.insert(symbol.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a subscriber.  Idempotent; returns whether it was present.
    pub fn leave(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "subscriber left");
        }
        removed
    }

    /// Drop every subscriber.  Their queues close once the last sender goes.
    pub fn clear(&self) -> usize {
        let mut subs = self.subscribers.write();
        let count = subs.len();
        subs.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    /// Deliver a frame to one subscriber, dropping it on failure.
    pub fn send_to(&self, id: SubscriberId, message: Arc<str>) -> Result<(), SendFailed> {
        let result = match self.subscribers.read().get(&id) {
            Some(sub) => sub.sink.send(message),
            None => Err(SendFailed::Closed),
        };
        if let Err(reason) = result {
            self.evict(&[(id, reason)]);
        }
        result
    }

    /// Deliver `message` to every subscriber attached to `symbol`.  Returns
    /// the number of successful deliveries.
    pub fn publish(&self, symbol: &str, message: Arc<str>) -> usize {
        self.fan_out(message, |sub| sub.symbols.contains(symbol))
    }

    /// Deliver an advisory frame to every registered subscriber.
    pub fn notify_all(&self, message: Arc<str>) -> usize {
        self.fan_out(message, |_| true)
    }

    fn fan_out(&self, message: Arc<str>, wants: impl Fn(&Subscription) -> bool) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter().filter(|(_, sub)| wants(sub)) {
                match sub.sink.send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(reason) => failed.push((*id, reason)),
                }
            }
        }
        if !failed.is_empty() {
            self.evict(&failed);
        }
        delivered
    }

    fn evict(&self, failed: &[(SubscriberId, SendFailed)]) {
        let mut subs = self.subscribers.write();
        for (id, reason) in failed {
            if subs.remove(id).is_some() {
                warn!(subscriber = %id, reason = %reason, "dropping subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sink that always fails with the given reason.
    struct Broken(SendFailed);

    impl SubscriberSink for Broken {
        fn send(&self, _message: Arc<str>) -> Result<(), SendFailed> {
            Err(self.0)
        }
    }

    /// Sink that counts what it receives.
    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl SubscriberSink for Counting {
        fn send(&self, _message: Arc<str>) -> Result<(), SendFailed> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn msg(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn publish_reaches_only_attached_symbols() {
        let hub = BroadcastHub::new();
        let (btc_sink, mut btc_rx) = ChannelSink::channel(8);
        let (sol_sink, mut sol_rx) = ChannelSink::channel(8);
        let btc = hub.register(btc_sink);
        let sol = hub.register(sol_sink);
        assert!(hub.attach(btc, "BTCUSDT"));
        assert!(hub.attach(sol, "SOLUSDT"));

        assert_eq!(hub.publish("BTCUSDT", msg("b1")), 1);
        assert_eq!(btc_rx.try_recv().unwrap().as_ref(), "b1");
        assert!(sol_rx.try_recv().is_err());
    }

    #[test]
    fn unattached_subscriber_gets_notices_but_not_updates() {
        let hub = BroadcastHub::new();
        let (sink, mut rx) = ChannelSink::channel(8);
        hub.register(sink);

        assert_eq!(hub.publish("BTCUSDT", msg("update")), 0);
        assert_eq!(hub.notify_all(msg("notice")), 1);
        assert_eq!(rx.try_recv().unwrap().as_ref(), "notice");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn leave_is_idempotent() {
        let hub = BroadcastHub::new();
        let (sink, _rx) = ChannelSink::channel(1);
        let id = hub.register(sink);
        assert!(hub.leave(id));
        assert!(!hub.leave(id));
        assert_eq!(hub.len(), 0);
        assert!(!hub.attach(id, "BTCUSDT"));
    }

    #[test]
    fn failing_subscriber_is_dropped_without_affecting_others() {
        let hub = BroadcastHub::new();
        let good = Arc::new(Counting::default());
        let good_id = hub.register(good.clone());
        let closed_id = hub.register(Arc::new(Broken(SendFailed::Closed)));
        let full_id = hub.register(Arc::new(Broken(SendFailed::Saturated)));
        for id in [good_id, closed_id, full_id] {
            hub.attach(id, "BTCUSDT");
        }

        assert_eq!(hub.publish("BTCUSDT", msg("u1")), 1);
        assert_eq!(hub.publish("BTCUSDT", msg("u2")), 1);

        assert_eq!(good.0.load(Ordering::SeqCst), 2);
        assert!(hub.contains(good_id));
        assert!(!hub.contains(closed_id));
        assert!(!hub.contains(full_id));
    }

    #[test]
    fn saturated_channel_sink_is_evicted_and_order_is_kept_for_others() {
        let hub = BroadcastHub::new();
        let (slow_sink, _slow_rx) = ChannelSink::channel(2);
        let (fast_sink, mut fast_rx) = ChannelSink::channel(64);
        let slow = hub.register(slow_sink);
        let fast = hub.register(fast_sink);
        hub.attach(slow, "BTCUSDT");
        hub.attach(fast, "BTCUSDT");

        for i in 0..10 {
            hub.publish("BTCUSDT", Arc::from(i.to_string()));
        }

        assert!(!hub.contains(slow));
        assert!(hub.contains(fast));
        let received: Vec<String> = std::iter::from_fn(|| fast_rx.try_recv().ok())
            .map(|m| m.to_string())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn dropped_receiver_counts_as_closed() {
        let hub = BroadcastHub::new();
        let (sink, rx) = ChannelSink::channel(4);
        let id = hub.register(sink);
        drop(rx);
        assert_eq!(hub.send_to(id, msg("hello")), Err(SendFailed::Closed));
        assert!(!hub.contains(id));
    }
}
