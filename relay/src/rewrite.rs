//! Response rewriting for delivery under `/t/<tunnelId>/`
//!
//! Strips framing headers that do not survive re-transmission and, for HTML
//! payloads, prefixes root-relative references so a tunneled site can load
//! its own assets. This is a best-effort textual transform: URLs built by
//! scripts are not touched.

use std::sync::OnceLock;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use porthole_shared::protocol::{header_value, PATH_PREFIX};
use porthole_shared::ResponseFrame;
use regex::{Captures, Regex, Replacer};
use tracing::debug;

/// Headers recomputed or owned by the relay's own connection
const STRIPPED_HEADERS: [&str; 4] = ["transfer-encoding", "connection", "keep-alive", "content-length"];

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(\s(?:src|href|action|content|data-[a-z0-9_.:-]+)\s*=\s*["'])(/[^"']*)"#)
            .expect("attribute pattern")
    })
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)(url\(\s*["']?)(/[^"')\s]*)"#).expect("css url pattern"))
}

fn head_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<head(?:\s[^>]*)?>").expect("head pattern"))
}

/// Build the public response for a client agent's answer
pub fn finalize(frame: ResponseFrame, tunnel_id: &str) -> Response {
    let status = StatusCode::from_u16(frame.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = frame.headers;
    // A bodiless answer (HEAD, 304) still describes the real entity length.
    let declared_length = match frame.body {
        None => header_value(&headers, "content-length").map(str::to_string),
        Some(_) => None,
    };
    strip_framing_headers(&mut headers);
    if let Some(len) = declared_length {
        headers.push(("content-length".to_string(), len));
    }

    let mut body = frame.body.unwrap_or_default();
    if is_html(&headers) {
        if let Some(rewritten) = rewrite_html_bytes(&body, tunnel_id) {
            body = rewritten;
            upsert(&mut headers, "content-length", &body.len().to_string());
        }
    }

    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in headers {
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_bytes(v.as_bytes())) {
                (Ok(name), Ok(value)) => {
                    headers_mut.append(name, value);
                }
                _ => debug!("Dropping invalid response header {:?}", k),
            }
        }
    }

    match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

/// Remove hop-by-hop and framing headers
pub fn strip_framing_headers(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| !STRIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)));
}

pub fn is_html(headers: &[(String, String)]) -> bool {
    header_value(headers, "content-type")
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Rewrite an HTML body; `None` when it is not UTF-8 or nothing changed
pub fn rewrite_html_bytes(body: &[u8], tunnel_id: &str) -> Option<Vec<u8>> {
    let html = std::str::from_utf8(body).ok()?;
    let rewritten = rewrite_html(html, tunnel_id);
    (rewritten != html).then(|| rewritten.into_bytes())
}

/// Prefix root-relative references with `/t/<tunnelId>` and inject a `<base>`
pub fn rewrite_html(html: &str, tunnel_id: &str) -> String {
    let prefix = format!("{}{}", PATH_PREFIX, tunnel_id);
    let html = attr_regex().replace_all(html, PrefixRoot(&prefix));
    let html = css_url_regex().replace_all(&html, PrefixRoot(&prefix));

    match head_regex().find(&html) {
        Some(head) => {
            let mut out = String::with_capacity(html.len() + prefix.len() + 16);
            out.push_str(&html[..head.end()]);
            out.push_str(&format!("<base href=\"{}/\">", prefix));
            out.push_str(&html[head.end()..]);
            out
        }
        None => html.into_owned(),
    }
}

/// Prefixes capture group 2 (a root-relative path) unless it is
/// protocol-relative or already under the tunnel prefix
struct PrefixRoot<'p>(&'p str);

impl Replacer for PrefixRoot<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let value = &caps[2];
        if value.starts_with("//") || is_prefixed(value, self.0) {
            dst.push_str(&caps[0]);
        } else {
            dst.push_str(&caps[1]);
            dst.push_str(self.0);
            dst.push_str(value);
        }
    }
}

fn is_prefixed(value: &str, prefix: &str) -> bool {
    value
        .strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with(|c: char| matches!(c, '/' | '?' | '#')))
        .unwrap_or(false)
}

/// Insert or update a header
fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html_frame(body: &str) -> ResponseFrame {
        ResponseFrame {
            req_id: "r".into(),
            status: 200,
            headers: vec![
                ("Content-Type".into(), "text/html; charset=utf-8".into()),
                ("Content-Length".into(), "1".into()),
            ],
            body: Some(body.as_bytes().to_vec()),
        }
    }

    #[test]
    fn test_strip_framing_headers() {
        let mut h = vec![
            ("Transfer-Encoding".into(), "chunked".into()),
            ("Connection".into(), "keep-alive".into()),
            ("Keep-Alive".into(), "timeout=5".into()),
            ("Content-Length".into(), "10".into()),
            ("X-Custom".into(), "yes".into()),
        ];
        strip_framing_headers(&mut h);
        assert_eq!(h, vec![("X-Custom".to_string(), "yes".to_string())]);
    }

    #[test]
    fn test_rewrites_root_relative_attributes() {
        let out = rewrite_html(
            r#"<img src="/logo.png"><a href='/about'>x</a><form action="/login"><div data-url="/api">"#,
            "abc123",
        );
        assert!(out.contains(r#"src="/t/abc123/logo.png""#));
        assert!(out.contains(r#"href='/t/abc123/about'"#));
        assert!(out.contains(r#"action="/t/abc123/login""#));
        assert!(out.contains(r#"data-url="/t/abc123/api""#));
    }

    #[test]
    fn test_root_path_and_meta_content() {
        let out = rewrite_html(r#"<a href="/">home</a><meta content="/og.png">"#, "abc123");
        assert!(out.contains(r#"href="/t/abc123/""#));
        assert!(out.contains(r#"content="/t/abc123/og.png""#));
    }

    #[test]
    fn test_protocol_relative_untouched() {
        let html = r#"<script src="//cdn.example.com/x.js"></script><style>a{background:url(//cdn.example.com/a.png)}</style>"#;
        assert_eq!(rewrite_html(html, "abc123"), html);
    }

    #[test]
    fn test_css_urls() {
        let out = rewrite_html(
            r#"<style>.a{background:url(/a.png)} .b{background:url("/b.png")} .c{background:url( '/c.png' )}</style>"#,
            "abc123",
        );
        assert!(out.contains("url(/t/abc123/a.png)"));
        assert!(out.contains(r#"url("/t/abc123/b.png")"#));
        assert!(out.contains("url( '/t/abc123/c.png' )"));
    }

    #[test]
    fn test_base_injected_after_head() {
        let out = rewrite_html("<html><head lang=\"en\"><title>t</title></head></html>", "abc123");
        assert_eq!(
            out,
            "<html><head lang=\"en\"><base href=\"/t/abc123/\"><title>t</title></head></html>"
        );
        // <header> is not <head>
        assert_eq!(rewrite_html("<header>x</header>", "abc123"), "<header>x</header>");
    }

    #[test]
    fn test_no_absolute_refs_only_gains_base() {
        let html = r#"<html><head><link href="style.css"></head><body><a href="https://example.com/x">x</a><img src="img/a.png"></body></html>"#;
        let out = rewrite_html(html, "abc123");
        assert_eq!(out.replacen(r#"<base href="/t/abc123/">"#, "", 1), html);
    }

    #[test]
    fn test_already_prefixed_left_alone() {
        let html = r#"<a href="/t/abc123/page">x</a>"#;
        assert_eq!(rewrite_html(html, "abc123"), html);
    }

    #[test]
    fn test_unrelated_attributes_untouched() {
        let html = r#"<input value="/not-a-link"><a title="/x">t</a>"#;
        assert_eq!(rewrite_html(html, "abc123"), html);
    }

    #[tokio::test]
    async fn test_finalize_recomputes_content_length() {
        let resp = finalize(html_frame(r#"<img src="/a.png">"#), "abc123");
        assert_eq!(resp.status(), StatusCode::OK);
        let expected = r#"<img src="/t/abc123/a.png">"#;
        assert_eq!(
            resp.headers().get("content-length").unwrap(),
            &expected.len().to_string()
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], expected.as_bytes());
    }

    #[tokio::test]
    async fn test_finalize_passes_binary_through() {
        let bytes: Vec<u8> = (0..=255).collect();
        let frame = ResponseFrame {
            req_id: "r".into(),
            status: 201,
            headers: vec![
                ("content-type".into(), "application/octet-stream".into()),
                ("set-cookie".into(), "a=1".into()),
                ("set-cookie".into(), "b=2".into()),
                ("transfer-encoding".into(), "chunked".into()),
            ],
            body: Some(bytes.clone()),
        };
        let resp = finalize(frame, "abc123");
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get_all("set-cookie").iter().count(), 2);
        assert!(resp.headers().get("transfer-encoding").is_none());
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.to_vec(), bytes);
    }

    #[tokio::test]
    async fn test_finalize_empty_body_and_bad_status() {
        let frame = ResponseFrame {
            req_id: "r".into(),
            status: 42,
            headers: vec![],
            body: None,
        };
        let resp = finalize(frame, "abc123");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_finalize_keeps_declared_length_without_body() {
        let frame = ResponseFrame {
            req_id: "r".into(),
            status: 200,
            headers: vec![
                ("Content-Type".into(), "text/html".into()),
                ("Content-Length".into(), "12345".into()),
                ("Connection".into(), "keep-alive".into()),
            ],
            body: None,
        };
        let resp = finalize(frame, "abc123");
        assert_eq!(resp.headers().get("content-length").unwrap(), "12345");
        assert!(resp.headers().get("connection").is_none());
    }
}
