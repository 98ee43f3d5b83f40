//! Porthole client agent: keeps a tunnel open to the relay and forwards
//! tunneled requests to a local HTTP service.

pub mod api;
pub mod config;
pub mod connection;
pub mod forward;

pub use api::RelayAddr;
pub use config::PortholeConfig;
pub use connection::{Backoff, ClientEvent, ConnectionState, TunnelClient};
pub use forward::Forwarder;
