//! Request history.
//!
//! One entry is appended per completed request, after status and content are
//! resolved and before the response is written.

use crate::content::Content;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Immutable record of one request/response exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Global request counter value assigned to this request
    pub request_number: u64,
    pub time: DateTime<Local>,
    pub method: String,
    /// Path plus query string, as received
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    /// Request body
    pub body: String,
    pub status_code: u16,
    pub faulted: bool,
    pub delay_ms: u64,
    pub content_type: String,
    /// Response content
    pub content: Content,
}

/// Append-only request history with optional FIFO retention.
#[derive(Debug)]
pub struct HistoryLog {
    entries: VecDeque<Arc<HistoryEntry>>,
    /// Maximum retained entries (0 = unbounded)
    limit: usize,
    appended: u64,
}

impl HistoryLog {
    /// Create a log retaining at most `limit` entries (0 = unbounded).
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            appended: 0,
        }
    }

    /// Append an entry, dropping the oldest one if the log is full.
    pub fn append(&mut self, entry: HistoryEntry) {
        if self.limit > 0 && self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(Arc::new(entry));
        self.appended += 1;
    }

    /// The last `count` entries whose URL contains `filter`, oldest first.
    pub fn tail(&self, count: usize, filter: Option<&str>) -> Vec<Arc<HistoryEntry>> {
        let mut selected: Vec<_> = self
            .entries
            .iter()
            .rev()
            .filter(|entry| filter.map_or(true, |needle| entry.url.contains(needle)))
            .take(count)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries ever appended, including ones no longer retained.
    pub fn appended(&self) -> u64 {
        self.appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(number: u64, url: &str) -> HistoryEntry {
        HistoryEntry {
            request_number: number,
            time: Local::now(),
            method: "GET".to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: String::new(),
            status_code: 200,
            faulted: false,
            delay_ms: 0,
            content_type: "text/plain; charset=utf-8".to_string(),
            content: Content::Text(String::new()),
        }
    }

    fn numbers(entries: &[Arc<HistoryEntry>]) -> Vec<u64> {
        entries.iter().map(|e| e.request_number).collect()
    }

    #[test]
    fn test_tail_returns_most_recent_in_order() {
        let mut log = HistoryLog::new(0);
        for n in 1..=10 {
            log.append(entry(n, &format!("/item/{}", n)));
        }
        assert_eq!(numbers(&log.tail(3, None)), vec![8, 9, 10]);
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn test_tail_shorter_history() {
        let mut log = HistoryLog::new(0);
        log.append(entry(1, "/a"));
        log.append(entry(2, "/b"));
        assert_eq!(numbers(&log.tail(10, None)), vec![1, 2]);
        assert!(log.tail(0, None).is_empty());
    }

    #[test]
    fn test_tail_with_filter() {
        let mut log = HistoryLog::new(0);
        log.append(entry(1, "/users/1"));
        log.append(entry(2, "/orders/1"));
        log.append(entry(3, "/users/2"));
        log.append(entry(4, "/orders/2"));
        log.append(entry(5, "/users/3?x=1"));

        assert_eq!(numbers(&log.tail(2, Some("users"))), vec![3, 5]);
        assert_eq!(numbers(&log.tail(10, Some("orders"))), vec![2, 4]);
        assert!(log.tail(10, Some("nothing")).is_empty());
    }

    #[test]
    fn test_tail_does_not_mutate() {
        let mut log = HistoryLog::new(0);
        for n in 1..=4 {
            log.append(entry(n, "/x"));
        }
        let _ = log.tail(2, None);
        assert_eq!(numbers(&log.tail(4, None)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let mut log = HistoryLog::new(3);
        for n in 1..=5 {
            log.append(entry(n, "/x"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.appended(), 5);
        assert_eq!(numbers(&log.tail(10, None)), vec![3, 4, 5]);
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let value = serde_json::to_value(entry(7, "/x")).unwrap();
        assert_eq!(value["requestNumber"], 7);
        assert_eq!(value["statusCode"], 200);
        assert_eq!(value["url"], "/x");
    }
}
