// =============================================================================
// Relay — composition root for the market-data relay
// =============================================================================
//
// One `Relay` owns the history cache, the broadcast hub, the stream ingestor
// and the backfill fetcher.  The transport constructs it once at startup and
// hands a clone to every connection handler.
//
// Lifecycle:  Init ──start──▶ Running ──shutdown──▶ ShutDown
//
// Joins are only accepted while running.  Shutdown aborts the ingestion
// tasks and drops every subscriber, which closes their outbound queues.
// =============================================================================

pub mod backfill;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod pipeline;
pub mod upstream;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::runtime_config::RuntimeConfig;
use crate::types::{ServerMessage, SymbolHistory};

use self::backfill::BackfillFetcher;
use self::error::RelayError;
use self::hub::{SubscriberId, SubscriberSink};
use self::ingest::{FeedState, StreamIngestor};
use self::pipeline::Pipeline;
use self::upstream::UpstreamFeed;

pub const CONNECTED_MESSAGE: &str = "Connected to relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Init,
    Running,
    ShutDown,
}

/// Result of a successful join: the subscriber's id (needed for `leave`)
/// and the snapshot delivered for each symbol, in delivery order.
#[derive(Debug)]
pub struct Joined {
    pub id: SubscriberId,
    pub snapshot: Vec<(String, SymbolHistory)>,
}

struct RelayInner {
    symbols: Vec<String>,
    subscriber_queue: usize,
    pipeline: Arc<Pipeline>,
    backfill: BackfillFetcher,
    ingestor: StreamIngestor,
    lifecycle: RwLock<Lifecycle>,
}

/// Cheaply cloneable handle to one relay instance.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(config: &RuntimeConfig, upstream: Arc<dyn UpstreamFeed>) -> Self {
        let pipeline = Arc::new(Pipeline::new(config.history_limit, config.interval.clone()));
        let backfill = BackfillFetcher::new(
            upstream.clone(),
            config.interval.clone(),
            config.history_limit,
        );
        let ingestor = StreamIngestor::new(upstream, pipeline.clone());

        Self {
            inner: Arc::new(RelayInner {
                symbols: config.symbols.clone(),
                subscriber_queue: config.subscriber_queue,
                pipeline,
                backfill,
                ingestor,
                lifecycle: RwLock::new(Lifecycle::Init),
            }),
        }
    }

    /// Move to `Running` and start the upstream subscription of every
    /// configured symbol.  Calling it again is a no-op.
    pub fn start(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.write();
            if *lifecycle != Lifecycle::Init {
                return;
            }
            *lifecycle = Lifecycle::Running;
        }

        for symbol in &self.inner.symbols {
            self.inner.ingestor.ensure_started(symbol);
        }
        info!(
            symbols = ?self.inner.symbols,
            interval = %self.inner.pipeline.interval(),
            history_limit = self.inner.pipeline.cache().limit(),
            "relay running"
        );
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read()
    }

    /// Register a subscriber, deliver its snapshots and subscribe it to
    /// updates.
    ///
    /// `symbols` scopes the join; `None` means every configured symbol.
    /// Requested symbols the relay does not carry get an advisory error.  A
    /// cold symbol is backfilled before its snapshot is sent; if backfill
    /// fails the subscriber is told so and receives an empty snapshot.
    pub async fn join(
        &self,
        sink: Arc<dyn SubscriberSink>,
        symbols: Option<&[String]>,
    ) -> Result<Joined, RelayError> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(RelayError::NotRunning);
        }

        let pipeline = &self.inner.pipeline;
        let id = pipeline.hub().register(sink);
        pipeline.notify(id, ServerMessage::info(CONNECTED_MESSAGE))?;

        let wanted = self.resolve_symbols(id, symbols)?;
        let mut snapshot = Vec::with_capacity(wanted.len());

        for symbol in wanted {
            self.inner.ingestor.ensure_started(&symbol);

            if let Err(e) = self.inner.backfill.ensure_history(&symbol, pipeline.cache()).await {
                warn!(symbol = %symbol, subscriber = %id, error = %e, "backfill failed");
                pipeline.notify(
                    id,
                    ServerMessage::error(format!("No history available for {symbol}: {e}")),
                )?;
            }

            let history = pipeline.attach(id, &symbol)?;
            snapshot.push((symbol, history));
        }

        info!(
            subscriber = %id,
            symbols = snapshot.len(),
            subscribers = pipeline.hub().len(),
            "subscriber joined"
        );
        Ok(Joined { id, snapshot })
    }

    fn resolve_symbols(
        &self,
        id: SubscriberId,
        requested: Option<&[String]>,
    ) -> Result<Vec<String>, RelayError> {
        let Some(requested) = requested else {
            return Ok(self.inner.symbols.clone());
        };

        let mut wanted: Vec<String> = Vec::new();
        for raw in requested {
            let symbol = raw.trim().to_uppercase();
            if symbol.is_empty() || wanted.contains(&symbol) {
                continue;
            }
            if self.inner.symbols.contains(&symbol) {
                wanted.push(symbol);
            } else {
                self.inner.pipeline.notify(
                    id,
                    ServerMessage::error(format!("Unknown symbol {symbol}")),
                )?;
            }
        }
        Ok(wanted)
    }

    /// Remove a subscriber.  Idempotent.
    pub fn leave(&self, id: SubscriberId) -> bool {
        self.inner.pipeline.hub().leave(id)
    }

    /// Stop ingestion and drop every subscriber.
    pub fn shutdown(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.write();
            if *lifecycle == Lifecycle::ShutDown {
                return;
            }
            *lifecycle = Lifecycle::ShutDown;
        }

        self.inner.ingestor.shutdown();
        let dropped = self.inner.pipeline.hub().clear();
        info!(
            subscribers = dropped,
            feeds = ?self.inner.ingestor.states(),
            "relay shut down"
        );
    }

    pub fn history(&self, symbol: &str) -> SymbolHistory {
        self.inner.pipeline.cache().get(symbol)
    }

    /// Feed state of every configured symbol, in configuration order.
    pub fn feed_states(&self) -> Vec<(String, FeedState)> {
        self.inner
            .symbols
            .iter()
            .map(|sym| (sym.clone(), self.inner.ingestor.state(sym)))
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.pipeline.hub().len()
    }

    pub fn symbols(&self) -> &[String] {
        &self.inner.symbols
    }

    pub fn interval(&self) -> &str {
        self.inner.pipeline.interval()
    }

    /// Capacity of the outbound queue the transport should give each
    /// subscriber.
    pub fn subscriber_queue(&self) -> usize {
        self.inner.subscriber_queue
    }
}
