//! Configuration file parser for Porthole
//!
//! Supports porthole.yml with the relay address, local target, tunnel id,
//! and reconnect backoff tuning. CLI flags override file values.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use porthole_shared::protocol::validate_tunnel_id;
use serde::{Deserialize, Serialize};

use crate::connection::Backoff;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortholeConfig {
    /// Relay WebSocket base URL
    #[serde(default = "default_relay")]
    pub relay: String,

    /// Local service base URL or bare port
    pub target: Option<String>,

    /// Tunnel id to claim; issued by the relay when absent
    pub tunnel_id: Option<String>,

    /// Reconnect backoff settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Reconnect backoff: delay starts at `floor_ms`, grows by `factor`, stops at `cap_ms`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_floor_ms")]
    pub floor_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

impl Default for PortholeConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            target: None,
            tunnel_id: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            floor_ms: default_floor_ms(),
            factor: default_factor(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.floor_ms),
            self.factor,
            Duration::from_millis(self.cap_ms),
        )
    }
}

fn default_relay() -> String {
    "ws://localhost:8080".to_string()
}

fn default_floor_ms() -> u64 {
    2_000
}

fn default_factor() -> f64 {
    1.5
}

fn default_cap_ms() -> u64 {
    15_000
}

impl PortholeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: PortholeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let scheme = self.relay.split("://").next().unwrap_or("");
        if !self.relay.contains("://") || !matches!(scheme, "ws" | "wss" | "http" | "https") {
            anyhow::bail!("Relay must be a ws://, wss://, http:// or https:// URL, got '{}'", self.relay);
        }

        if let Some(id) = &self.tunnel_id {
            validate_tunnel_id(id)?;
        }

        let r = &self.reconnect;
        if r.floor_ms == 0 {
            anyhow::bail!("reconnect.floor_ms must be greater than zero");
        }
        if r.factor.is_nan() || r.factor < 1.0 {
            anyhow::bail!("reconnect.factor must be at least 1.0");
        }
        if r.cap_ms < r.floor_ms {
            anyhow::bail!("reconnect.cap_ms must not be below reconnect.floor_ms");
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = ["porthole.yml", "porthole.yaml", ".porthole.yml", ".porthole.yaml"];

        // Check current directory
        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// Expand a bare port into a localhost URL; add `http://` when no scheme is given
pub fn normalize_target(target: &str) -> String {
    let target = target.trim();
    if !target.is_empty() && target.bytes().all(|b| b.is_ascii_digit()) {
        format!("http://localhost:{}", target)
    } else if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
relay: wss://porthole.example.com
target: http://localhost:3000
tunnel_id: my-app
reconnect:
  floor_ms: 1000
  cap_ms: 8000
"#;
        let config: PortholeConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.relay, "wss://porthole.example.com");
        assert_eq!(config.tunnel_id.as_deref(), Some("my-app"));
        assert_eq!(config.reconnect.floor_ms, 1000);
        assert_eq!(config.reconnect.factor, 1.5);
        assert_eq!(config.reconnect.cap_ms, 8000);
    }

    #[test]
    fn test_defaults() {
        let config: PortholeConfig = serde_yaml::from_str("target: '8000'").unwrap();
        assert_eq!(config.relay, "ws://localhost:8080");
        assert_eq!(config.reconnect, ReconnectConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let mut config = PortholeConfig::default();
        config.reconnect.factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = PortholeConfig::default();
        config.reconnect.cap_ms = 10;
        assert!(config.validate().is_err());

        let config = PortholeConfig {
            relay: "localhost:8080".into(),
            ..PortholeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PortholeConfig {
            tunnel_id: Some("bad id".into()),
            ..PortholeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalize_target() {
        assert_eq!(normalize_target("3000"), "http://localhost:3000");
        assert_eq!(normalize_target("127.0.0.1:8000"), "http://127.0.0.1:8000");
        assert_eq!(normalize_target("https://app.local"), "https://app.local");
    }
}
