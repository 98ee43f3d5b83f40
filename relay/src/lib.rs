//! Porthole Relay
//!
//! Publicly reachable side of the tunnel: accepts client agent connections,
//! correlates public HTTP requests with tunneled responses, and rewrites
//! responses for delivery under `/t/<tunnelId>/`.

pub mod config;
pub mod correlator;
pub mod metrics;
pub mod registry;
pub mod rewrite;
pub mod server;
pub mod tunnel;

pub use config::RelayConfig;
pub use server::{router, AppState};
