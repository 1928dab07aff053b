// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/`.  None of them require authentication.
//
// CORS is configured permissively; the relay only serves public market data.
// =============================================================================

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::relay::ingest::FeedState;
use crate::relay::{Lifecycle, Relay};
use crate::types::ServerMessage;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and the relay as state.
pub fn router(relay: Relay) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/history/:symbol", get(history))
        .route("/api/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(relay)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct FeedHealth {
    symbol: String,
    state: FeedState,
    candles: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    lifecycle: Lifecycle,
    interval: String,
    subscribers: usize,
    feeds: Vec<FeedHealth>,
    server_time: i64,
}

async fn health(State(relay): State<Relay>) -> impl IntoResponse {
    let feeds = relay
        .feed_states()
        .into_iter()
        .map(|(symbol, state)| FeedHealth {
            candles: relay.history(&symbol).len(),
            symbol,
            state,
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        lifecycle: relay.lifecycle(),
        interval: relay.interval().to_string(),
        subscribers: relay.subscriber_count(),
        feeds,
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// History snapshot
// =============================================================================

async fn history(State(relay): State<Relay>, Path(symbol): Path<String>) -> Response {
    let symbol = symbol.trim().to_uppercase();
    if !relay.symbols().contains(&symbol) {
        let body = ServerMessage::error(format!("Unknown symbol {symbol}"));
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    }

    let candles = relay.history(&symbol);
    Json(ServerMessage::history(&symbol, relay.interval(), candles)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::error::UpstreamError;
    use crate::relay::upstream::{TickStream, UpstreamFeed};
    use crate::runtime_config::RuntimeConfig;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait]
    impl UpstreamFeed for Offline {
        async fn subscribe(&self, _symbol: &str, _interval: &str) -> Result<TickStream, UpstreamError> {
            Err(UpstreamError("offline".into()))
        }

        async fn fetch_klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn relay() -> Relay {
        Relay::new(&RuntimeConfig::default(), Arc::new(Offline))
    }

    async fn get(relay: Relay, uri: &str) -> (StatusCode, Value) {
        let resp = router(relay)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_every_configured_feed() {
        let (status, body) = get(relay(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["lifecycle"], "init");
        assert_eq!(body["subscribers"], 0);
        assert_eq!(body["feeds"][0]["symbol"], "BTCUSDT");
        assert_eq!(body["feeds"][0]["state"], "not_started");
    }

    #[tokio::test]
    async fn plain_get_on_ws_endpoint_answers_ok() {
        let (status, body) = get(relay(), "/api/ws").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "ok": true }));
    }

    #[tokio::test]
    async fn history_returns_a_snapshot_frame() {
        let (status, body) = get(relay(), "/api/history/solusdt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "history");
        assert_eq!(body["symbol"], "SOLUSDT");
        assert_eq!(body["interval"], "1m");
        assert_eq!(body["candles"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn history_for_unknown_symbol_is_not_found() {
        let (status, body) = get(relay(), "/api/history/DOGEUSDT").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "error");
    }
}
