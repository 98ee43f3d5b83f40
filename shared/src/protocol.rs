//! Wire protocol for Porthole tunnel connections.
//!
//! Every message travels as a single WebSocket text frame holding a JSON
//! object tagged by `"type"`. Bodies are opaque bytes carried as base64.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Path of the relay's tunnel WebSocket endpoint
pub const TUNNEL_ENDPOINT: &str = "/tunnel";

/// Query parameter carrying the tunnel id on the tunnel endpoint
pub const TUNNEL_ID_PARAM: &str = "id";

/// Prefix of every tunneled public path: `/t/<tunnelId>/...`
pub const PATH_PREFIX: &str = "/t/";

/// How long the relay waits for a `response` before answering 504
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code sent when a tunnel connection arrives without a usable id
pub const CLOSE_MISSING_TUNNEL_ID: u16 = 1008;

/// Longest accepted tunnel id
pub const MAX_TUNNEL_ID_LEN: usize = 64;

/// Ordered header list; repeated names are preserved.
pub type Headers = Vec<(String, String)>;

/// Messages exchanged over the tunnel connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Relay → client, once the tunnel is registered
    Connected {
        #[serde(rename = "tunnelId")]
        tunnel_id: String,
    },
    /// Relay → client, a public request to replay against the local service
    Request(RequestFrame),
    /// Client → relay, the answer to a prior `request` with the same `reqId`
    Response(ResponseFrame),
}

/// Public request forwarded through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub method: String,
    /// Path and query relative to the local target, always starting with `/`
    pub path: String,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

/// Local service response travelling back to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "reqId")]
    pub req_id: String,
    pub status: u16,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

impl Message {
    /// Serialize to the JSON text carried in a WebSocket frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse a binary frame holding the same JSON
    pub fn decode_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connected { .. } => "connected",
            Message::Request(_) => "request",
            Message::Response(_) => "response",
        }
    }
}

impl ResponseFrame {
    /// Plain-text response, used for failures synthesized on either side
    pub fn text(req_id: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            req_id: req_id.into(),
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: Some(body.into().into_bytes()),
        }
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// First value of `name` in a header list, matched case-insensitively
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Check that a tunnel id is usable in a URL path segment
pub fn validate_tunnel_id(id: &str) -> Result<&str> {
    let ok = !id.is_empty()
        && id.len() <= MAX_TUNNEL_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(id)
    } else {
        Err(Error::InvalidTunnelId(id.to_string()))
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| STANDARD.decode(encoded).map_err(D::Error::custom))
            .transpose()
    }
}
