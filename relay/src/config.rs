//! Relay configuration, read from the environment at startup

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use porthole_shared::protocol::REQUEST_TIMEOUT;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the public listener binds to
    pub bind: SocketAddr,
    /// Deadline for a tunneled request
    pub request_timeout: Duration,
    /// Interval between keepalive pings on tunnel connections
    pub ping_interval: Duration,
    /// Largest public request body that will be tunneled
    pub max_body_bytes: usize,
    /// Outbound message buffer per tunnel connection
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout: REQUEST_TIMEOUT,
            ping_interval: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            channel_capacity: 100,
        }
    }
}

impl RelayConfig {
    /// Load from `PORT` and `PORTHOLE_*` variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = parse::<u16>(&lookup, "PORT")? {
            config.bind.set_port(port);
        }
        if let Some(secs) = parse::<u64>(&lookup, "PORTHOLE_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "PORTHOLE_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse::<usize>(&lookup, "PORTHOLE_MAX_BODY_BYTES")? {
            config.max_body_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            anyhow::bail!("Request timeout must be greater than zero");
        }
        if self.ping_interval.is_zero() {
            anyhow::bail!("Ping interval must be greater than zero");
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}
