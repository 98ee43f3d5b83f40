//! Error types for Porthole.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Invalid tunnel id: {0:?}")]
    InvalidTunnelId(String),

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),
}
