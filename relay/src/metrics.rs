//! Metrics Collection for Porthole Relay
//!
//! Atomic counters rendered in Prometheus text format at `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::correlator::DispatchError;

/// Relay-wide metrics
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    /// Total tunneled requests
    total_requests: AtomicU64,
    /// Terminal outcomes
    forwarded: AtomicU64,
    offline: AtomicU64,
    dispatch_failed: AtomicU64,
    timed_out: AtomicU64,
    disconnected: AtomicU64,
    /// Status classes of delivered responses
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Public request bytes in, delivered body bytes out
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Open tunnel connections
    active_tunnels: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request the client agent answered
    pub fn record_forwarded(&self, status: u16, bytes_in: u64, bytes_out: u64) {
        let inner = &self.inner;
        inner.total_requests.fetch_add(1, Ordering::Relaxed);
        inner.forwarded.fetch_add(1, Ordering::Relaxed);
        inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        match status / 100 {
            2 => { inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }
    }

    /// Record a request that ended without a client response
    pub fn record_failure(&self, err: DispatchError, bytes_in: u64) {
        let inner = &self.inner;
        inner.total_requests.fetch_add(1, Ordering::Relaxed);
        inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        let counter = match err {
            DispatchError::Offline => &inner.offline,
            DispatchError::SendFailed => &inner.dispatch_failed,
            DispatchError::TimedOut => &inner.timed_out,
            DispatchError::Disconnected => &inner.disconnected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.total_requests.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub fn to_prometheus(&self) -> String {
        let i = &self.inner;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
r#"# HELP porthole_requests_total Total number of tunneled requests
# TYPE porthole_requests_total counter
porthole_requests_total {}

# HELP porthole_requests_by_outcome Tunneled requests by terminal outcome
# TYPE porthole_requests_by_outcome counter
porthole_requests_by_outcome{{outcome="forwarded"}} {}
porthole_requests_by_outcome{{outcome="{}"}} {}
porthole_requests_by_outcome{{outcome="{}"}} {}
porthole_requests_by_outcome{{outcome="{}"}} {}
porthole_requests_by_outcome{{outcome="{}"}} {}

# HELP porthole_requests_by_status Delivered responses by HTTP status class
# TYPE porthole_requests_by_status counter
porthole_requests_by_status{{status="2xx"}} {}
porthole_requests_by_status{{status="3xx"}} {}
porthole_requests_by_status{{status="4xx"}} {}
porthole_requests_by_status{{status="5xx"}} {}

# HELP porthole_bytes_total Total body bytes transferred
# TYPE porthole_bytes_total counter
porthole_bytes_total{{direction="in"}} {}
porthole_bytes_total{{direction="out"}} {}

# HELP porthole_active_tunnels Number of open tunnel connections
# TYPE porthole_active_tunnels gauge
porthole_active_tunnels {}
"#,
            load(&i.total_requests),
            load(&i.forwarded),
            DispatchError::Offline.label(),
            load(&i.offline),
            DispatchError::SendFailed.label(),
            load(&i.dispatch_failed),
            DispatchError::TimedOut.label(),
            load(&i.timed_out),
            DispatchError::Disconnected.label(),
            load(&i.disconnected),
            load(&i.status_2xx),
            load(&i.status_3xx),
            load(&i.status_4xx),
            load(&i.status_5xx),
            load(&i.bytes_in),
            load(&i.bytes_out),
            load(&i.active_tunnels),
        )
    }
}
