//! Request descriptors and per-request context.

use crate::content::Content;
use crate::history::HistoryEntry;
use crate::store::EffectiveConfig;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;

/// A parsed incoming request, as handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub method: String,
    /// Path without query string
    pub path: String,
    /// Raw query string, without the leading '?'
    pub query: Option<String>,
    /// Header names are lowercase; repeated headers are joined with ", "
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RequestDescriptor {
    /// Build a descriptor from a method and a path with optional query.
    pub fn new(method: impl Into<String>, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };
        Self {
            method: method.into().to_ascii_uppercase(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header, merging with any previous value of the same name.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Path plus query string.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Cookies from the `Cookie` header.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.header("cookie")
            .map(|raw| {
                raw.split(';')
                    .filter_map(|pair| {
                        let (name, value) = pair.split_once('=')?;
                        let name = name.trim();
                        if name.is_empty() {
                            return None;
                        }
                        Some((name.to_string(), value.trim().to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Body as text, with invalid UTF-8 replaced.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

/// Everything known about one request while it is being resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub request_number: u64,
    pub time: DateTime<Local>,
    pub method: String,
    pub url: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: String,
    /// Frozen configuration for this request
    #[serde(skip)]
    pub config: EffectiveConfig,
}

impl RequestContext {
    /// Capture a request with its frozen configuration.
    pub fn new(
        request: &RequestDescriptor,
        request_number: u64,
        config: EffectiveConfig,
    ) -> Self {
        Self {
            request_number,
            time: Local::now(),
            method: request.method.clone(),
            url: request.url(),
            path: request.path.clone(),
            query: request.query.clone(),
            headers: request.headers.clone(),
            cookies: request.cookies(),
            body: request.body_text(),
            config,
        }
    }

    /// Self-description used when nothing else produced content.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Wrap `content` in a description of the exchange.
    pub fn echo(&self, content: &Content, status: u16) -> serde_json::Value {
        serde_json::json!({
            "method": self.method,
            "url": self.url,
            "headers": self.headers,
            "cookies": self.cookies,
            "body": content,
            "statusCode": status,
        })
    }

    /// Freeze this context into a history entry.
    pub fn into_history(self, status: u16, faulted: bool, content: &Content) -> HistoryEntry {
        HistoryEntry {
            request_number: self.request_number,
            time: self.time,
            method: self.method,
            url: self.url,
            headers: self.headers,
            cookies: self.cookies,
            body: self.body,
            status_code: status,
            faulted,
            delay_ms: self.config.delay_ms,
            content_type: content.content_type().to_string(),
            content: content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseDefaults;

    #[test]
    fn test_descriptor_splits_query() {
        let request = RequestDescriptor::new("get", "/a/b?x=1&y=2");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/a/b");
        assert_eq!(request.query.as_deref(), Some("x=1&y=2"));
        assert_eq!(request.url(), "/a/b?x=1&y=2");

        let bare = RequestDescriptor::new("GET", "");
        assert_eq!(bare.path, "/");
        assert_eq!(bare.url(), "/");
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = RequestDescriptor::new("GET", "/")
            .with_header("X-Trace", "a")
            .with_header("x-trace", "b");
        assert_eq!(request.header("X-TRACE"), Some("a, b"));
    }

    #[test]
    fn test_cookies_parsed() {
        let request =
            RequestDescriptor::new("GET", "/").with_header("Cookie", "session=abc; theme=dark;junk");
        let cookies = request.cookies();
        assert_eq!(cookies["session"], "abc");
        assert_eq!(cookies["theme"], "dark");
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_describe_omits_config() {
        let request = RequestDescriptor::new("POST", "/x?q=1").with_body("payload");
        let config = EffectiveConfig::merge(&ResponseDefaults::default(), None);
        let ctx = RequestContext::new(&request, 3, config);
        let description = ctx.describe();
        assert_eq!(description["requestNumber"], 3);
        assert_eq!(description["method"], "POST");
        assert_eq!(description["url"], "/x?q=1");
        assert_eq!(description["body"], "payload");
        assert!(description.get("config").is_none());
    }

    #[test]
    fn test_echo_wraps_content() {
        let request = RequestDescriptor::new("GET", "/x");
        let config = EffectiveConfig::merge(&ResponseDefaults::default(), None);
        let ctx = RequestContext::new(&request, 1, config);
        let echoed = ctx.echo(&Content::Text("hi".into()), 201);
        assert_eq!(echoed["body"], "hi");
        assert_eq!(echoed["statusCode"], 201);
        assert_eq!(echoed["method"], "GET");
    }
}
