//! Axum router construction per family (spec §6 HTTP surface table).
//!
//! The `/ws/realtime` handler's split-socket / `tokio::select!` shape is
//! grounded in the teacher's `api/monitoring.rs::handle_monitoring_stream`:
//! one task forwards the RequestLog's broadcast events out to the client,
//! another drains inbound client frames (here, just to detect close), and
//! `select!` tears down whichever finishes first.

use std::process;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Family, SharedConfigStore};
use crate::log::RequestLog;
use crate::pipeline::Pipeline;

pub struct AppState {
    pub family: Family,
    pub config: SharedConfigStore,
    pub log: RequestLog,
    pub pipeline: Pipeline,
}

pub type SharedAppState = Arc<AppState>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pid: u32,
    active_config: Option<String>,
}

async fn health(State(state): State<SharedAppState>) -> impl IntoResponse {
    let configs = state.config.configs(state.family);
    let active_config = configs.values().find(|c| c.active).map(|c| c.name.clone());
    Json(HealthResponse {
        status: "ok",
        pid: process::id(),
        active_config,
    })
}

async fn forward(
    State(state): State<SharedAppState>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    state
        .pipeline
        .handle(method.as_str(), uri.path(), headers, body)
        .await
}

async fn realtime_ws(ws: WebSocketUpgrade, State(state): State<SharedAppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_realtime(socket, state))
}

async fn handle_realtime(socket: WebSocket, state: SharedAppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.log.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// `POST /api/codex/build-body` — returns the adapted body/headers without
/// forwarding, so operator tooling can preview what the adapter produces.
async fn codex_build_body(State(state): State<SharedAppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return Json(json!({"error": e.to_string()})),
    };
    let model = parsed.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let stream = parsed.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let adapted = state.pipeline.adapter.adapt_body(parsed, model, stream);
    Json(json!({ "json": adapted.body }))
}

/// `POST /api/codex/quick-send` — forwards through the same pipeline as the
/// canonical route and reports just the status code and raw response lines,
/// a lighter-weight probe for operator scripts.
async fn codex_quick_send(
    State(state): State<SharedAppState>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let response = state.pipeline.handle("POST", "/v1/responses", headers, body).await;
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let lines: Vec<String> = String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect();
    Json(json!({ "status_code": status, "lines": lines }))
}

pub fn build_router(state: SharedAppState) -> Router {
    let family = state.family;
    let mut router = Router::new().route("/health", get(health)).route("/ws/realtime", get(realtime_ws));

    router = router.route(canonical_path_for(family), post(forward));
    for alt in alternate_paths(family) {
        router = router.route(alt, post(forward));
    }

    if family == Family::Codex {
        router = router
            .route("/api/codex/build-body", post(codex_build_body))
            .route("/api/codex/quick-send", post(codex_quick_send));
    }

    // The monitoring UI (out of scope here) polls `/health` and opens
    // `/ws/realtime` from a separate origin; `TraceLayer` gives each route
    // the same request/response span logging the rest of the pipeline uses.
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

fn canonical_path_for(family: Family) -> &'static str {
    match family {
        Family::Claude => "/v1/messages",
        Family::Codex => "/v1/responses",
        Family::Legacy => "/v1/chat/completions",
    }
}

/// Alternate routes per spec §6: Claude additionally answers on the Chat
/// Completions path, adapting on the way in.
fn alternate_paths(family: Family) -> &'static [&'static str] {
    match family {
        Family::Claude => &["/v1/chat/completions"],
        Family::Codex | Family::Legacy => &[],
    }
}
