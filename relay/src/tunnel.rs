//! Tunnel connection handle for Porthole Relay

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use porthole_shared::{Message, ResponseFrame};
use tokio::sync::{mpsc, oneshot};

/// Unique tunnel identifier
pub type TunnelId = String;

/// Terminal outcome delivered to a waiting public request
#[derive(Debug)]
pub enum Delivery {
    /// The client agent answered
    Response(ResponseFrame),
    /// The tunnel connection closed first
    Disconnected,
}

/// Pending request correlation map: reqId -> waiter
pub type PendingMap = DashMap<String, oneshot::Sender<Delivery>>;

/// Represents one live tunnel connection
#[derive(Clone)]
pub struct Tunnel {
    /// Tunnel id the client connected with
    pub id: TunnelId,
    /// Distinguishes successive connections for the same id
    pub generation: u64,
    /// When the connection was registered
    pub connected_at: DateTime<Utc>,
    /// Channel to the connection's writer
    tx: mpsc::Sender<Message>,
    /// In-flight requests awaiting a `response`
    pub pending: Arc<PendingMap>,
}

impl Tunnel {
    pub fn new(id: TunnelId, generation: u64, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            generation,
            connected_at: Utc::now(),
            tx,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// True while the connection's writer is still accepting messages
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message for the client agent
    pub async fn send(&self, msg: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.tx.send(msg).await
    }

    /// Number of requests still waiting on this connection
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
