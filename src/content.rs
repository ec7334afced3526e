//! Response payloads and the random content generator.
//!
//! Strings are drawn from `[A-Za-z0-9]`, buffers from the full byte range.
//! Cached payloads are keyed by requested length and never evicted, so memory
//! grows with the number of distinct lengths requested over the process
//! lifetime.

use base64::Engine as _;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Final content of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Plain text
    Text(String),
    /// Any structured value, sent as JSON
    Json(serde_json::Value),
    /// Raw bytes
    Bytes(Bytes),
}

impl Content {
    /// Get content type for this payload.
    pub fn content_type(&self) -> &'static str {
        match self {
            Content::Text(_) => "text/plain; charset=utf-8",
            Content::Json(_) => "application/json; charset=utf-8",
            Content::Bytes(_) => "application/octet-stream",
        }
    }

    /// Encode the payload for the wire.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Content::Text(text) => Bytes::from(text.clone()),
            Content::Json(value) => serde_json::to_vec_pretty(value)
                .map(Bytes::from)
                .unwrap_or_default(),
            Content::Bytes(bytes) => bytes.clone(),
        }
    }

    /// Payload length in bytes once encoded.
    pub fn len(&self) -> usize {
        match self {
            Content::Text(text) => text.len(),
            Content::Bytes(bytes) => bytes.len(),
            Content::Json(_) => self.to_bytes().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Content::Json(value)
    }
}

// Buffers go out as base64 so history stays valid JSON.
impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Content::Text(text) => serializer.serialize_str(text),
            Content::Json(value) => value.serialize(serializer),
            Content::Bytes(bytes) => serializer
                .serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }
}

/// Random payload generator with per-length caches.
#[derive(Default)]
pub struct ContentGenerator {
    strings: RwLock<HashMap<usize, Arc<str>>>,
    buffers: RwLock<HashMap<usize, Bytes>>,
}

impl ContentGenerator {
    /// Create a generator with empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new random alphanumeric string.
    pub fn fresh_string(&self, length: usize) -> String {
        random_string(length)
    }

    /// Generate a new random buffer.
    pub fn fresh_buffer(&self, length: usize) -> Bytes {
        random_buffer(length)
    }

    /// Return the cached string for `length`, generating it on first use.
    pub async fn cached_string(&self, length: usize) -> Arc<str> {
        if let Some(existing) = self.strings.read().await.get(&length) {
            return existing.clone();
        }

        // Re-check under the write lock; a concurrent request may have won.
        let mut strings = self.strings.write().await;
        strings
            .entry(length)
            .or_insert_with(|| Arc::from(random_string(length)))
            .clone()
    }

    /// Return the cached buffer for `length`, generating it on first use.
    pub async fn cached_buffer(&self, length: usize) -> Bytes {
        if let Some(existing) = self.buffers.read().await.get(&length) {
            return existing.clone();
        }

        let mut buffers = self.buffers.write().await;
        buffers
            .entry(length)
            .or_insert_with(|| random_buffer(length))
            .clone()
    }

    /// Number of cached strings and buffers.
    pub async fn cached_entries(&self) -> (usize, usize) {
        (self.strings.read().await.len(), self.buffers.read().await.len())
    }
}

fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn random_buffer(length: usize) -> Bytes {
    let mut buffer = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut buffer);
    Bytes::from(buffer)
}
