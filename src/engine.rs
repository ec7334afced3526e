//! Response resolution.
//!
//! Turns a request descriptor plus the live configuration into a response
//! decision: status (with periodic fault injection), content, headers, and
//! the delay before delivery.

use crate::config::StubServerConfig;
use crate::content::{Content, ContentGenerator};
use crate::context::{RequestContext, RequestDescriptor};
use crate::directive::{
    ConsoleMode, ContentRequest, DirectiveParser, DirectiveSet, Scope, StatsScope,
};
use crate::fault;
use crate::history::{HistoryEntry, HistoryLog};
use crate::proxy::Forwarder;
use crate::store::{ConfigStore, EffectiveConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Header listing directives that were ignored as malformed.
pub const REJECTED_HEADER: &str = "x-stub-rejected";

/// Header carrying the upstream status of a proxied response.
pub const UPSTREAM_STATUS_HEADER: &str = "x-upstream-status";

/// Internal failure while resolving a request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to encode response content: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Resolved response, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct StubResponse {
    pub status: u16,
    pub content: Content,
    /// Extra headers besides `Content-Type`
    pub headers: Vec<(String, String)>,
}

impl StubResponse {
    pub fn content_type(&self) -> &'static str {
        self.content.content_type()
    }

    /// Header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response to be delivered once its delay has elapsed.
#[derive(Debug)]
#[must_use = "a pending response does nothing until delivered"]
pub struct PendingResponse {
    delay: Duration,
    response: StubResponse,
}

impl PendingResponse {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn response(&self) -> &StubResponse {
        &self.response
    }

    /// Wait out the delay without blocking the runtime, then hand over
    /// the response.
    pub async fn deliver(self) -> StubResponse {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response
    }
}

/// Store-derived content, computed under the store lock.
enum StoreContent {
    Stats(serde_json::Value),
    Settings(serde_json::Value),
}

/// Stub response engine.
///
/// Owns the configuration store, the request history and the content
/// caches. Shared between request tasks behind an `Arc`.
pub struct Engine {
    parser: DirectiveParser,
    store: Mutex<ConfigStore>,
    history: RwLock<HistoryLog>,
    generator: ContentGenerator,
    forwarder: Option<Arc<dyn Forwarder>>,
    /// Total requests resolved.
    requests_total: AtomicU64,
    /// Total requests answered with an injected error status.
    requests_faulted: AtomicU64,
    /// Total directives ignored as malformed.
    directives_rejected: AtomicU64,
}

impl Engine {
    /// Create an engine seeded from the given configuration.
    pub fn new(config: &StubServerConfig) -> Self {
        info!(
            seeded_paths = config.paths.len(),
            control_path = %config.settings.control_path,
            history_limit = config.settings.history_limit,
            "Stub engine initialized"
        );

        Self {
            parser: DirectiveParser::new(&config.settings),
            store: Mutex::new(ConfigStore::new(config)),
            history: RwLock::new(HistoryLog::new(config.settings.history_limit)),
            generator: ContentGenerator::new(),
            forwarder: None,
            requests_total: AtomicU64::new(0),
            requests_faulted: AtomicU64::new(0),
            directives_rejected: AtomicU64::new(0),
        }
    }

    /// Use `forwarder` for paths configured with a proxy target.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Get total requests resolved.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests with an injected error status.
    pub fn total_faulted(&self) -> u64 {
        self.requests_faulted.load(Ordering::Relaxed)
    }

    /// Get total directives rejected as malformed.
    pub fn total_rejected(&self) -> u64 {
        self.directives_rejected.load(Ordering::Relaxed)
    }

    /// Number of cached strings and buffers.
    pub async fn cached_content(&self) -> (usize, usize) {
        self.generator.cached_entries().await
    }

    /// Current effective configuration for `path`, without counting a request.
    pub async fn effective_config(&self, path: &str) -> EffectiveConfig {
        self.store.lock().await.get(path)
    }

    /// Method counters for `path`.
    pub async fn stats(&self, path: &str) -> std::collections::BTreeMap<String, u64> {
        self.store.lock().await.stats(path)
    }

    /// Last `count` history entries whose URL contains `filter`.
    pub async fn history_tail(&self, count: usize, filter: Option<&str>) -> Vec<Arc<HistoryEntry>> {
        self.history.read().await.tail(count, filter)
    }

    /// Resolve a request into a response that is delivered after the
    /// configured delay.
    pub async fn resolve(&self, request: RequestDescriptor) -> Result<PendingResponse, EngineError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let parsed = self.parser.parse(&request);
        let directives = parsed.directives;
        for rejected in &directives.rejected {
            warn!(path = %request.path, error = %rejected, "Ignoring malformed directive");
        }
        self.directives_rejected
            .fetch_add(directives.rejected.len() as u64, Ordering::Relaxed);

        // Snapshot, count and mutate under one lock so concurrent requests
        // never interleave between these steps.
        let (mut config, request_number, store_content, console) = {
            let mut store = self.store.lock().await;
            let config = store.get(&parsed.path);
            let request_number = store.next_request();
            store.record_hit(&parsed.path, &request.method);
            apply_mutations(&mut store, &directives);
            let store_content = store_content(&store, &directives)?;
            (
                config,
                request_number,
                store_content,
                (store.console_log(), store.compact_log()),
            )
        };
        config.layer(&directives.request_overrides());

        let ctx = RequestContext::new(&request, request_number, config);
        let verdict = fault::decide(&ctx.config, request_number);
        let mut status = verdict.status();
        if verdict.is_faulted() {
            self.requests_faulted.fetch_add(1, Ordering::Relaxed);
            debug!(request_number, status, path = %parsed.path, "Injecting fault");
        }

        let mut headers = Vec::new();
        if !directives.rejected.is_empty() {
            headers.push((
                REJECTED_HEADER.to_string(),
                directives.rejected_keys().join(","),
            ));
        }

        let mut content = match (&directives.content, store_content) {
            (_, Some(StoreContent::Stats(value) | StoreContent::Settings(value))) => {
                Content::Json(value)
            }
            (Some(request_content), None) => {
                self.generate(request_content, &directives).await?
            }
            (None, None) => {
                self.default_content(&ctx, &request, &mut status, &mut headers)
                    .await?
            }
        };

        if ctx.config.echo_context {
            content = Content::Json(ctx.echo(&content, status));
        }

        log_request(&ctx, status, console);

        let delay = Duration::from_millis(ctx.config.delay_ms);
        let entry = ctx.into_history(status, verdict.is_faulted(), &content);
        self.history.write().await.append(entry);

        Ok(PendingResponse {
            delay,
            response: StubResponse {
                status,
                content,
                headers,
            },
        })
    }

    /// Content for a directive that does not need the store.
    async fn generate(
        &self,
        request: &ContentRequest,
        directives: &DirectiveSet,
    ) -> Result<Content, EngineError> {
        let content = match request {
            ContentRequest::FreshString(length) => {
                Content::Text(self.generator.fresh_string(*length))
            }
            ContentRequest::CachedString(length) => {
                Content::Text(self.generator.cached_string(*length).await.to_string())
            }
            ContentRequest::FreshBuffer(length) => {
                Content::Bytes(self.generator.fresh_buffer(*length))
            }
            ContentRequest::CachedBuffer(length) => {
                Content::Bytes(self.generator.cached_buffer(*length).await)
            }
            ContentRequest::Log(count) => {
                let entries = self
                    .history
                    .read()
                    .await
                    .tail(*count, directives.log_filter.as_deref());
                let entries: Vec<&HistoryEntry> = entries.iter().map(Arc::as_ref).collect();
                Content::Json(serde_json::to_value(entries)?)
            }
            // Resolved under the store lock.
            ContentRequest::Stats(_) | ContentRequest::Settings => Content::Json(serde_json::Value::Null),
        };
        Ok(content)
    }

    /// Content when no directive asked for any: literal body, echoed body,
    /// proxied body, then the request's own description.
    async fn default_content(
        &self,
        ctx: &RequestContext,
        request: &RequestDescriptor,
        status: &mut u16,
        headers: &mut Vec<(String, String)>,
    ) -> Result<Content, EngineError> {
        if let Some(body) = &ctx.config.body {
            return Ok(Content::Text(body.clone()));
        }
        if ctx.config.echo_body && !request.is_get() {
            return Ok(Content::Text(request.body_text()));
        }
        if let Some(target) = &ctx.config.proxy {
            return Ok(self.proxy(target, request, status, headers).await);
        }
        Ok(Content::Json(ctx.describe()))
    }

    async fn proxy(
        &self,
        target: &str,
        request: &RequestDescriptor,
        status: &mut u16,
        headers: &mut Vec<(String, String)>,
    ) -> Content {
        let Some(forwarder) = &self.forwarder else {
            warn!(target = %target, "Proxy target configured but forwarding is disabled");
            *status = 502;
            return proxy_failure(target, "forwarding is disabled");
        };

        match forwarder.forward(target, request).await {
            Ok(upstream) => {
                headers.push((
                    UPSTREAM_STATUS_HEADER.to_string(),
                    upstream.status.to_string(),
                ));
                upstream.into_content()
            }
            Err(e) => {
                warn!(target = %target, error = %e, "Proxy request failed");
                *status = 502;
                proxy_failure(target, &e.to_string())
            }
        }
    }
}

fn proxy_failure(target: &str, message: &str) -> Content {
    Content::Json(serde_json::json!({
        "error": "proxy_failed",
        "target": target,
        "message": message,
    }))
}

/// Apply reset, field updates and logging switches to the store.
fn apply_mutations(store: &mut ConfigStore, directives: &DirectiveSet) {
    if directives.reset {
        match &directives.target {
            Some(path) => store.reset_path(path),
            None => store.reset_all(),
        }
    }

    for (scope, update) in &directives.updates {
        match (scope, &directives.target) {
            (Scope::Target, Some(path)) => store.set_path_field(path, update),
            (Scope::Target, None) | (Scope::Global, _) => {
                store.set_default_field(update);
            }
            (Scope::Request, _) => {}
        }
    }

    if let Some(mode) = directives.console {
        match mode {
            ConsoleMode::Off => store.set_logging(false, None),
            ConsoleMode::On => store.set_logging(true, None),
            ConsoleMode::Compact => store.set_logging(true, Some(true)),
            ConsoleMode::Verbose => store.set_logging(true, Some(false)),
        }
    }
}

/// Content that reads the store, computed after mutations apply.
fn store_content(
    store: &ConfigStore,
    directives: &DirectiveSet,
) -> Result<Option<StoreContent>, EngineError> {
    let content = match &directives.content {
        Some(ContentRequest::Stats(scope)) => {
            let path = match scope {
                StatsScope::All => None,
                StatsScope::Path(path) => Some(path.as_str()),
                StatsScope::Target => directives.target.as_deref(),
            };
            let value = match path {
                Some(path) => serde_json::to_value(store.stats(path))?,
                None => {
                    let mut all = serde_json::Map::new();
                    for (path, counters) in store.stats_all() {
                        all.insert(path, serde_json::to_value(counters)?);
                    }
                    serde_json::Value::Object(all)
                }
            };
            Some(StoreContent::Stats(value))
        }
        Some(ContentRequest::Settings) => Some(StoreContent::Settings(serde_json::to_value(
            store.describe(),
        )?)),
        _ => None,
    };
    Ok(content)
}

fn log_request(ctx: &RequestContext, status: u16, (enabled, compact): (bool, bool)) {
    if !enabled {
        return;
    }
    let time = ctx.time.format("%Y-%m-%d %H:%M:%S");
    if compact {
        info!(target: "stub_server::requests", "{} {} {} {}", time, status, ctx.method, ctx.url);
    } else {
        info!(
            target: "stub_server::requests",
            request_number = ctx.request_number,
            status,
            method = %ctx.method,
            url = %ctx.url,
            headers = ?ctx.headers,
            body = %ctx.body,
            "{} {} {} {}",
            time,
            status,
            ctx.method,
            ctx.url
        );
    }
}
