//! Forwards tunneled requests to the local service

use porthole_shared::protocol::Headers;
use porthole_shared::{Error, RequestFrame, ResponseFrame};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use reqwest::{redirect, Method, Url};
use tracing::{debug, info, warn};

/// Inbound headers that are never copied to the local request
const HOP_BY_HOP: &[&str] = &["connection", "transfer-encoding", "upgrade", "keep-alive"];

pub struct Forwarder {
    client: reqwest::Client,
    /// `scheme://host[:port]` of the local target
    origin: String,
    authority: String,
}

impl Forwarder {
    pub fn new(target: &str) -> porthole_shared::Result<Self> {
        let url = Url::parse(target).map_err(|e| Error::InvalidTarget(format!("{}: {}", target, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidTarget(format!("{}: scheme must be http or https", target)));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidTarget(format!("{}: missing host", target)))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        // Redirects go back to the public caller untouched.
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::InvalidTarget(e.to_string()))?;

        Ok(Self {
            client,
            origin: url.origin().ascii_serialization(),
            authority,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Local URL for a tunneled path (path and query come from the request)
    pub fn target_url(&self, path: &str) -> Option<Url> {
        if !path.starts_with('/') {
            return None;
        }
        Url::parse(&format!("{}{}", self.origin, path)).ok()
    }

    /// Run `req` against the local service. Always yields a response: local
    /// failures become a 502 carried back over the tunnel.
    pub async fn forward(&self, req: RequestFrame) -> ResponseFrame {
        let req_id = req.req_id;

        let Ok(method) = Method::from_bytes(req.method.as_bytes()) else {
            warn!("Rejecting request {} with invalid method {:?}", req_id, req.method);
            return ResponseFrame::text(req_id, 400, format!("Invalid method: {}", req.method));
        };
        let Some(url) = self.target_url(&req.path) else {
            warn!("Rejecting request {} with invalid path {:?}", req_id, req.path);
            return ResponseFrame::text(req_id, 400, format!("Invalid path: {}", req.path));
        };

        info!("{} {} -> {}", method, req.path, self.origin);

        let mut builder = self.client.request(method, url);
        for (name, value) in &req.headers {
            if is_skipped(name) {
                continue;
            }
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Dropping unrepresentable header {:?}", name),
            }
        }
        builder = builder.header(HOST, self.authority.as_str());
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Local target {} unreachable: {}", self.origin, e);
                return ResponseFrame::text(
                    req_id,
                    502,
                    format!("Bad Gateway: could not reach {}: {}", self.origin, e),
                );
            }
        };

        let status = resp.status().as_u16();
        let headers: Headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();

        match resp.bytes().await {
            Ok(body) => {
                debug!("Request {} answered {} ({} bytes)", req_id, status, body.len());
                ResponseFrame {
                    req_id,
                    status,
                    headers,
                    body: (!body.is_empty()).then(|| body.to_vec()),
                }
            }
            Err(e) => {
                warn!("Failed reading local response body: {}", e);
                ResponseFrame::text(req_id, 502, format!("Bad Gateway: response from {} was cut short: {}", self.origin, e))
            }
        }
    }
}

fn is_skipped(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || name.eq_ignore_ascii_case(HOST.as_str())
        || name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
}
