//! Relay addressing and HTTP API calls (tunnel issuance, status)

use anyhow::{Context, Result};
use porthole_shared::protocol::{PATH_PREFIX, TUNNEL_ENDPOINT, TUNNEL_ID_PARAM};
use reqwest::Url;
use serde::Deserialize;

/// `GET /api/tunnels/{id}` body
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelStatus {
    #[serde(rename = "tunnelId")]
    pub tunnel_id: String,
    pub connected: bool,
    #[serde(rename = "connectedAt")]
    pub connected_at: Option<String>,
    #[serde(default)]
    pub pending: usize,
}

#[derive(Debug, Deserialize)]
struct IssuedTunnel {
    #[serde(rename = "tunnelId")]
    tunnel_id: String,
}

/// Scheme and authority of the relay, in `ws`/`wss` and `http`/`https` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddr {
    ws_base: String,
    http_base: String,
}

impl RelayAddr {
    /// Parse a relay URL; `ws`, `wss`, `http` and `https` are all accepted
    pub fn parse(relay: &str) -> Result<Self> {
        let url = Url::parse(relay).with_context(|| format!("Invalid relay URL: {}", relay))?;
        let (ws, http) = match url.scheme() {
            "ws" | "http" => ("ws", "http"),
            "wss" | "https" => ("wss", "https"),
            other => anyhow::bail!("Unsupported relay scheme '{}'", other),
        };
        let host = url.host_str().context("Relay URL has no host")?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok(Self {
            ws_base: format!("{}://{}", ws, authority),
            http_base: format!("{}://{}", http, authority),
        })
    }

    /// WebSocket URL a client agent connects to for `tunnel_id`
    pub fn tunnel_endpoint(&self, tunnel_id: &str) -> String {
        format!("{}{}?{}={}", self.ws_base, TUNNEL_ENDPOINT, TUNNEL_ID_PARAM, tunnel_id)
    }

    /// Public URL the tunneled service is reachable at
    pub fn public_url(&self, tunnel_id: &str) -> String {
        format!("{}{}{}/", self.http_base, PATH_PREFIX, tunnel_id)
    }

    pub fn http_base(&self) -> &str {
        &self.http_base
    }
}

/// Ask the relay for a fresh tunnel id
pub async fn issue_tunnel_id(client: &reqwest::Client, relay: &RelayAddr) -> Result<String> {
    let url = format!("{}/api/tunnels", relay.http_base);
    let issued: IssuedTunnel = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach relay at {}", relay.http_base))?
        .error_for_status()
        .context("Relay refused to issue a tunnel id")?
        .json()
        .await
        .context("Failed to parse tunnel issuance response")?;
    Ok(issued.tunnel_id)
}

/// Query whether `tunnel_id` currently has a live connection
pub async fn tunnel_status(
    client: &reqwest::Client,
    relay: &RelayAddr,
    tunnel_id: &str,
) -> Result<TunnelStatus> {
    let url = format!("{}/api/tunnels/{}", relay.http_base, tunnel_id);
    client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach relay at {}", relay.http_base))?
        .error_for_status()
        .context("Relay status request failed")?
        .json()
        .await
        .context("Failed to parse tunnel status")
}
