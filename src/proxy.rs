//! Request forwarding for proxied paths.
//!
//! The engine only sees the [`Forwarder`] trait; [`HttpForwarder`] is the
//! reqwest-backed implementation used by the binary.

use crate::content::Content;
use crate::context::RequestDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Headers that describe the inbound connection rather than the request.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding failure.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy request to {target}: {reason}")]
    InvalidRequest { target: String, reason: String },

    #[error("upstream {target} failed: {source}")]
    Upstream {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// What the upstream answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ProxyResponse {
    /// Upstream body as response content: JSON when declared and valid,
    /// text when UTF-8, raw bytes otherwise.
    pub fn into_content(self) -> Content {
        let declared_json = self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("json"));
        if declared_json {
            if let Ok(value) = serde_json::from_slice(&self.body) {
                return Content::Json(value);
            }
        }
        match String::from_utf8(self.body.to_vec()) {
            Ok(text) => Content::Text(text),
            Err(_) => Content::Bytes(self.body),
        }
    }
}

/// Sends a request to an upstream URL.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        target: &str,
        request: &RequestDescriptor,
    ) -> Result<ProxyResponse, ProxyError>;
}

/// Forwarder backed by a shared reqwest client.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// Create a forwarder whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProxyError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        target: &str,
        request: &RequestDescriptor,
    ) -> Result<ProxyResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            ProxyError::InvalidRequest {
                target: target.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut builder = self.client.request(method, target);
        for (name, value) in &request.headers {
            if !HOP_HEADERS.contains(&name.as_str()) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        debug!(target = %target, method = %request.method, "Forwarding request");

        let upstream_error = |source| ProxyError::Upstream {
            target: target.to_string(),
            source,
        };
        let response = builder.send().await.map_err(upstream_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await.map_err(upstream_error)?;

        Ok(ProxyResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content_type: Option<&str>, body: &'static [u8]) -> ProxyResponse {
        ProxyResponse {
            status: 200,
            content_type: content_type.map(String::from),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_json_body_becomes_json_content() {
        let content = response(Some("application/json"), br#"{"ok":true}"#).into_content();
        assert_eq!(content, Content::Json(serde_json::json!({"ok": true})));
    }

    #[test]
    fn test_invalid_json_falls_back_to_text() {
        let content = response(Some("application/json"), b"not json").into_content();
        assert_eq!(content, Content::Text("not json".into()));
    }

    #[test]
    fn test_binary_body_stays_bytes() {
        let content = response(None, b"\xff\xfe\x00").into_content();
        assert_eq!(content, Content::Bytes(Bytes::from_static(b"\xff\xfe\x00")));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_an_error() {
        let forwarder = HttpForwarder::new(Duration::from_millis(500)).unwrap();
        let request = RequestDescriptor::new("GET", "/x");
        // Port 9 (discard) is closed on test hosts.
        let result = forwarder.forward("http://127.0.0.1:9/", &request).await;
        assert!(matches!(result, Err(ProxyError::Upstream { .. })));
    }
}
