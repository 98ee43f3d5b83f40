//! Request/response correlation for tunneled HTTP exchanges
//!
//! Every public request becomes a pending entry keyed by a fresh correlation
//! id. Exactly one of three events settles it: the matching `response`, the
//! deadline, or the tunnel closing. Each of them must win a
//! `DashMap::remove` on the pending map before it may act, so the losers are
//! no-ops.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header::HOST, HeaderMap, StatusCode};
use porthole_shared::protocol::{Headers, PATH_PREFIX, REQUEST_TIMEOUT};
use porthole_shared::{Message, RequestFrame, ResponseFrame};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::TunnelRegistry;
use crate::tunnel::{Delivery, PendingMap, Tunnel};

/// Why a tunneled request produced no client response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Tunnel Offline")]
    Offline,
    #[error("Failed to send the request through the tunnel")]
    SendFailed,
    #[error("The tunnel client did not respond in time")]
    TimedOut,
    #[error("The tunnel disconnected before responding")]
    Disconnected,
}

impl DispatchError {
    pub fn status(self) -> StatusCode {
        match self {
            DispatchError::Offline | DispatchError::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::SendFailed => StatusCode::BAD_GATEWAY,
            DispatchError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Metric label
    pub fn label(self) -> &'static str {
        match self {
            DispatchError::Offline => "offline",
            DispatchError::SendFailed => "dispatch_failed",
            DispatchError::TimedOut => "timed_out",
            DispatchError::Disconnected => "disconnected",
        }
    }
}

/// A public request, already stripped of its `/t/<id>` prefix
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct Correlator {
    registry: TunnelRegistry,
    timeout: Duration,
}

impl Correlator {
    pub fn new(registry: TunnelRegistry) -> Self {
        Self::with_timeout(registry, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(registry: TunnelRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Send `request` down the tunnel and wait for its single outcome
    pub async fn dispatch(
        &self,
        tunnel_id: &str,
        request: InboundRequest,
    ) -> Result<ResponseFrame, DispatchError> {
        let tunnel = match self.registry.lookup(tunnel_id) {
            Some(t) if t.is_open() => t,
            _ => {
                debug!("No live tunnel: {}", tunnel_id);
                return Err(DispatchError::Offline);
            }
        };

        let req_id = Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + self.timeout;
        let (tx, mut rx) = oneshot::channel();
        tunnel.pending.insert(req_id.clone(), tx);
        let _guard = PendingGuard {
            pending: tunnel.pending.clone(),
            req_id: req_id.clone(),
        };

        debug!("[{}] {} {} -> {}", tunnel.id, request.method, request.path, req_id);
        let frame = RequestFrame {
            req_id: req_id.clone(),
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        };

        match timeout_at(deadline, tunnel.send(Message::Request(frame))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!("[{}] Tunnel send failed for {}", tunnel.id, req_id);
                return match tunnel.pending.remove(&req_id) {
                    Some(_) => Err(DispatchError::SendFailed),
                    None => settle(rx.await),
                };
            }
            Err(_) => return expire(&tunnel, &req_id, rx).await,
        }

        match timeout_at(deadline, &mut rx).await {
            Ok(delivery) => settle(delivery),
            Err(_) => expire(&tunnel, &req_id, rx).await,
        }
    }

    /// Deliver a `response` to its waiter. Returns false for unknown or
    /// already settled ids, which are ignored.
    pub fn resolve(tunnel: &Tunnel, frame: ResponseFrame) -> bool {
        match tunnel.pending.remove(&frame.req_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(Delivery::Response(frame));
                true
            }
            None => false,
        }
    }

    /// Fail every request still pending on `tunnel`; returns how many
    pub fn fail_pending(tunnel: &Tunnel) -> usize {
        let ids: Vec<String> = tunnel.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, waiter)) = tunnel.pending.remove(&id) {
                let _ = waiter.send(Delivery::Disconnected);
                failed += 1;
            }
        }
        failed
    }
}

/// Deadline path: claim the entry, or take the outcome of whoever did
async fn expire(
    tunnel: &Tunnel,
    req_id: &str,
    rx: oneshot::Receiver<Delivery>,
) -> Result<ResponseFrame, DispatchError> {
    if tunnel.pending.remove(req_id).is_some() {
        warn!("[{}] Request {} timed out", tunnel.id, req_id);
        return Err(DispatchError::TimedOut);
    }
    settle(rx.await)
}

fn settle(
    delivery: Result<Delivery, oneshot::error::RecvError>,
) -> Result<ResponseFrame, DispatchError> {
    match delivery {
        Ok(Delivery::Response(frame)) => Ok(frame),
        Ok(Delivery::Disconnected) | Err(_) => Err(DispatchError::Disconnected),
    }
}

/// Drops the pending entry if the public caller goes away mid-wait
struct PendingGuard {
    pending: Arc<PendingMap>,
    req_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.req_id);
    }
}

/// Split `/t/<id>/<rest>?<query>` into the tunnel id and the path to forward
pub fn split_tunnel_path(path_and_query: &str) -> Option<(&str, String)> {
    let rest = path_and_query.strip_prefix(PATH_PREFIX)?;
    let end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
    let (id, tail) = rest.split_at(end);
    if id.is_empty() {
        return None;
    }
    let forward = if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{}", tail)
    };
    Some((id, forward))
}

/// Request headers worth forwarding; `host` names the relay, not the target
pub fn forwardable_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| **name != HOST)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
