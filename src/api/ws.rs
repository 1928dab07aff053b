// =============================================================================
// WebSocket Handler — relay subscribers
// =============================================================================
//
// Clients connect to `/api/ws` (optionally `?symbols=BTCUSDT,SOLUSDT`) and
// receive:
//   1. `{"type":"info","message":"Connected to relay"}`.
//   2. One `history` frame per symbol.
//   3. An `update` frame for every tick after that.
//
// Each connection walks  Connecting → Open → Closed | Errored.  Outbound
// frames go through a bounded queue drained by a writer task; the relay drops
// the connection if that queue fills up.
// =============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::relay::error::RelayError;
use crate::relay::hub::ChannelSink;
use crate::relay::Relay;

// =============================================================================
// Connection state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The relay accepted the join and delivered the snapshots.
    Joined,
    /// Close frame from the client or end of its stream.
    ClientClosed,
    /// The relay stopped feeding this connection (evicted or shut down).
    RelayClosed,
    /// Read or write failure on the socket, or a failed join.
    Failed,
}

impl ConnectionState {
    pub fn next(self, event: ConnectionEvent) -> Self {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Connecting, Joined) => Open,
            (Connecting | Open, ClientClosed | RelayClosed) => Closed,
            (Connecting | Open, Failed) => Errored,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

// =============================================================================
// Upgrade handler
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    symbols: Option<String>,
}

impl WsQuery {
    fn symbols(&self) -> Option<Vec<String>> {
        let raw = self.symbols.as_deref()?;
        let list: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        (!list.is_empty()).then_some(list)
    }
}

/// `/api/ws`.  Upgrades WebSocket requests; a plain GET gets `{"ok":true}`.
pub async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    State(relay): State<Relay>,
    Query(query): Query<WsQuery>,
) -> Response {
    let Some(ws) = ws else {
        return Json(serde_json::json!({ "ok": true })).into_response();
    };

    let symbols = query.symbols();
    debug!(symbols = ?symbols, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_connection(socket, relay, symbols))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_connection(socket: WebSocket, relay: Relay, symbols: Option<Vec<String>>) {
    let mut state = ConnectionState::Connecting;
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut outbound) = ChannelSink::channel(relay.subscriber_queue());

    // Writer: drains the subscriber queue into the socket.  Ends when the
    // relay drops the sink or the socket refuses a write.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
                debug!(error = %e, "WebSocket send failed");
                return ConnectionEvent::Failed;
            }
        }
        let _ = sender.close().await;
        ConnectionEvent::RelayClosed
    });

    let joined = match relay.join(sink, symbols.as_deref()).await {
        Ok(joined) => joined,
        Err(e) => {
            let event = match e {
                RelayError::NotRunning => ConnectionEvent::RelayClosed,
                RelayError::Delivery(_) => ConnectionEvent::Failed,
            };
            state = state.next(event);
            warn!(error = %e, state = ?state, "WebSocket join rejected");
            writer.abort();
            return;
        }
    };
    state = state.next(ConnectionEvent::Joined);
    let id = joined.id;
    info!(subscriber = %id, symbols = joined.snapshot.len(), "WebSocket connection open");

    while !state.is_terminal() {
        let event = tokio::select! {
            ended = &mut writer => ended.unwrap_or(ConnectionEvent::Failed),
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!(subscriber = %id, msg = %text, "WebSocket text message ignored");
                    continue;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => continue,
                Some(Ok(Message::Close(_))) | None => ConnectionEvent::ClientClosed,
                Some(Err(e)) => {
                    warn!(subscriber = %id, error = %e, "WebSocket receive error");
                    ConnectionEvent::Failed
                }
            },
        };
        state = state.next(event);
    }

    relay.leave(id);
    if !writer.is_finished() {
        writer.abort();
    }
    info!(subscriber = %id, state = ?state, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;
    use ConnectionState::*;

    #[test]
    fn join_opens_a_connecting_socket() {
        assert_eq!(Connecting.next(Joined), Open);
    }

    #[test]
    fn close_and_failure_are_terminal() {
        assert_eq!(Open.next(ClientClosed), Closed);
        assert_eq!(Open.next(RelayClosed), Closed);
        assert_eq!(Open.next(Failed), Errored);
        assert_eq!(Connecting.next(Failed), Errored);

        assert_eq!(Closed.next(Joined), Closed);
        assert_eq!(Errored.next(ClientClosed), Errored);
        assert!(Closed.is_terminal() && Errored.is_terminal());
        assert!(!Open.is_terminal());
    }

    #[test]
    fn symbols_query_is_split_and_trimmed() {
        let query = WsQuery {
            symbols: Some(" btcusdt, ,SOLUSDT ".into()),
        };
        assert_eq!(
            query.symbols(),
            Some(vec!["btcusdt".to_string(), "SOLUSDT".to_string()])
        );
        assert_eq!(WsQuery { symbols: Some(",".into()) }.symbols(), None);
        assert_eq!(WsQuery::default().symbols(), None);
    }
}
