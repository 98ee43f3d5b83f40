//! Tunnel registry: tunnel id -> live connection
//!
//! State lives only in process memory. A relay restart drops every tunnel
//! along with its in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::tunnel::Tunnel;

#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Tunnel>>,
    generations: Arc<AtomicU64>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a generation number for a new connection
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install `tunnel` as the live connection for its id.
    ///
    /// Returns the connection it superseded, if any. The superseded
    /// connection is left open; its own close handler fails its pending
    /// requests.
    pub fn register(&self, tunnel: Tunnel) -> Option<Tunnel> {
        self.tunnels.insert(tunnel.id.clone(), tunnel)
    }

    pub fn lookup(&self, id: &str) -> Option<Tunnel> {
        self.tunnels.get(id).map(|entry| entry.value().clone())
    }

    /// Remove the tunnel entirely, whichever connection holds it
    pub fn unregister(&self, id: &str) -> Option<Tunnel> {
        self.tunnels.remove(id).map(|(_, tunnel)| tunnel)
    }

    /// Remove `tunnel` only if it is still the registered connection
    pub fn release(&self, tunnel: &Tunnel) -> bool {
        self.tunnels
            .remove_if(&tunnel.id, |_, current| current.generation == tunnel.generation)
            .is_some()
    }

    /// Whether `id` currently has an open connection
    pub fn is_live(&self, id: &str) -> bool {
        self.tunnels.get(id).map(|t| t.is_open()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
