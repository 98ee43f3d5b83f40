//! Public HTTP surface and tunnel WebSocket endpoint

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Request, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use porthole_shared::protocol::{validate_tunnel_id, CLOSE_MISSING_TUNNEL_ID, TUNNEL_ENDPOINT};
use porthole_shared::Message;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::correlator::{forwardable_headers, split_tunnel_path, Correlator, DispatchError, InboundRequest};
use crate::metrics::Metrics;
use crate::registry::TunnelRegistry;
use crate::rewrite;
use crate::tunnel::Tunnel;

/// Length of issued tunnel ids
const TUNNEL_ID_LEN: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub correlator: Correlator,
    pub metrics: Metrics,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = TunnelRegistry::new();
        let correlator = Correlator::with_timeout(registry.clone(), config.request_timeout);
        Self {
            registry,
            correlator,
            metrics: Metrics::new(),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(TUNNEL_ENDPOINT, get(ws_handler))
        .route("/api/tunnels", post(issue_tunnel))
        .route("/api/tunnels/:id", get(tunnel_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(public_handler)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let id = params
        .id
        .filter(|id| validate_tunnel_id(id).is_ok());
    let max_message = porthole_shared::protocol::MAX_MESSAGE_SIZE;
    ws.max_message_size(max_message).on_upgrade(move |socket| async move {
        match id {
            Some(id) => handle_socket(socket, state, id).await,
            None => reject(socket).await,
        }
    })
}

async fn reject(mut socket: WebSocket) {
    warn!("Tunnel connection without a valid id, closing");
    let frame = CloseFrame {
        code: CLOSE_MISSING_TUNNEL_ID,
        reason: "missing or invalid tunnel id".into(),
    };
    let _ = socket.send(WsMessage::Close(Some(frame))).await;
}

/// Drive one tunnel connection from registration until it closes
async fn handle_socket(socket: WebSocket, state: AppState, tunnel_id: String) {
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.channel_capacity);
    let tunnel = Tunnel::new(tunnel_id.clone(), state.registry.next_generation(), tx);

    if let Some(prior) = state.registry.register(tunnel.clone()) {
        info!("Tunnel {} superseded connection #{}", tunnel_id, prior.generation);
    }
    state.metrics.tunnel_opened();

    let (mut sender, mut receiver) = socket.split();

    let connected = Message::Connected { tunnel_id: tunnel_id.clone() };
    let sent = match connected.encode() {
        Ok(text) => sender.send(WsMessage::Text(text)).await.is_ok(),
        Err(_) => false,
    };

    if sent {
        info!("Tunnel active: {} (connection #{})", tunnel_id, tunnel.generation);

        let mut keepalive = interval(state.config.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => handle_frame(&tunnel, Message::decode(&text)),
                        Some(Ok(WsMessage::Binary(data))) => handle_frame(&tunnel, Message::decode_bytes(&data)),
                        // The websocket layer queues the pong and flushes it on the next read.
                        Some(Ok(WsMessage::Ping(_))) => debug!("[{}] Ping from client", tunnel_id),
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("[{}] WebSocket error: {}", tunnel_id, e);
                            break;
                        }
                        _ => {}
                    }
                }
                Some(out) = rx.recv() => {
                    match out.encode() {
                        Ok(text) => {
                            if sender.send(WsMessage::Text(text)).await.is_err() { break; }
                        }
                        Err(e) => warn!("[{}] Failed to encode {}: {}", tunnel_id, out.kind(), e),
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = sender.send(WsMessage::Ping(Vec::new())).await {
                        debug!("[{}] Keepalive ping failed: {}", tunnel_id, e);
                    }
                }
            }
        }
    }

    // Close the writer first so dispatches racing this teardown fail fast
    // instead of parking requests nobody will answer.
    rx.close();
    let failed = Correlator::fail_pending(&tunnel);
    if failed > 0 {
        warn!("Tunnel {} closed with {} request(s) in flight", tunnel_id, failed);
    }
    state.registry.release(&tunnel);
    state.metrics.tunnel_closed();
    info!("Tunnel {} closed (connection #{})", tunnel_id, tunnel.generation);
}

fn handle_frame(tunnel: &Tunnel, msg: porthole_shared::Result<Message>) {
    match msg {
        Ok(Message::Response(frame)) => {
            let req_id = frame.req_id.clone();
            if !Correlator::resolve(tunnel, frame) {
                debug!("[{}] Ignoring response for settled request {}", tunnel.id, req_id);
            }
        }
        Ok(other) => warn!("[{}] Unexpected {} message from client", tunnel.id, other.kind()),
        Err(e) => warn!("[{}] Dropping malformed message: {}", tunnel.id, e),
    }
}

async fn public_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let Some((tunnel_id, path)) = split_tunnel_path(&path_and_query) else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    let tunnel_id = tunnel_id.to_string();

    let method = req.method().to_string();
    let headers = forwardable_headers(req.headers());

    let body = match axum::body::to_bytes(req.into_body(), state.config.max_body_bytes).await {
        Ok(b) if !b.is_empty() => Some(b.to_vec()),
        Ok(_) => None,
        Err(_) => {
            return error_page(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload Too Large",
                "The request body exceeds what this relay will tunnel.",
            );
        }
    };
    let bytes_in = body.as_ref().map(|b| b.len() as u64).unwrap_or(0);

    let request = InboundRequest { method, path, headers, body };
    match state.correlator.dispatch(&tunnel_id, request).await {
        Ok(frame) => {
            let bytes_out = frame.body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
            state.metrics.record_forwarded(frame.status, bytes_in, bytes_out);
            rewrite::finalize(frame, &tunnel_id)
        }
        Err(err) => {
            state.metrics.record_failure(err, bytes_in);
            failure_page(err, &tunnel_id)
        }
    }
}

fn failure_page(err: DispatchError, tunnel_id: &str) -> Response {
    let detail = match err {
        DispatchError::Offline => match validate_tunnel_id(tunnel_id) {
            Ok(id) => format!(
                "No client is connected for tunnel <code>{}</code>. Start the porthole client and try again.",
                id
            ),
            Err(_) => "No client is connected for this tunnel.".to_string(),
        },
        DispatchError::SendFailed => {
            "The tunnel connection failed while forwarding this request. Retry once it reconnects.".to_string()
        }
        DispatchError::TimedOut => "The local service did not answer within the deadline.".to_string(),
        DispatchError::Disconnected => {
            "The tunnel client disconnected before the request completed.".to_string()
        }
    };
    let title = match err {
        DispatchError::Offline => "Tunnel Offline".to_string(),
        other => other.to_string(),
    };
    error_page(err.status(), &title, &detail)
}

fn error_page(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head>\
         <body><h1>{code} {title}</h1><p>{detail}</p></body></html>",
        title = title,
        code = status.as_u16(),
        detail = detail,
    );
    (status, Html(body)).into_response()
}

async fn issue_tunnel() -> impl IntoResponse {
    let id = gen_tunnel_id();
    info!("Issued tunnel id {}", id);
    Json(json!({ "tunnelId": id }))
}

async fn tunnel_status(Path(id): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.lookup(&id).filter(|t| t.is_open()) {
        Some(tunnel) => Json(json!({
            "tunnelId": id,
            "connected": true,
            "connectedAt": tunnel.connected_at.to_rfc3339(),
            "pending": tunnel.pending_count(),
        })),
        None => Json(json!({ "tunnelId": id, "connected": false, "pending": 0 })),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "tunnels": state.registry.len() }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.to_prometheus()
}

fn gen_tunnel_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TUNNEL_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_tunnel_id() {
        let id = gen_tunnel_id();
        assert_eq!(id.len(), TUNNEL_ID_LEN);
        assert!(validate_tunnel_id(&id).is_ok());
        assert!(id.chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_offline_page() {
        let resp = failure_page(DispatchError::Offline, "abc123");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Tunnel Offline"));
        assert!(text.contains("abc123"));
    }

    #[test]
    fn test_failure_statuses() {
        assert_eq!(failure_page(DispatchError::SendFailed, "x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(failure_page(DispatchError::TimedOut, "x").status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            failure_page(DispatchError::Disconnected, "x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
