//! Directive parsing.
//!
//! Directives arrive through three channels and share one key table:
//!
//! - query parameters on the control path (`/.config?path=/a&delay=100`),
//!   which persist into the store for the `path` target, or the global
//!   defaults when no path is given;
//! - headers with the directive prefix (`x-cmd-statuscode: 401`);
//! - leading URL segments (`/:errorcode/500/4/orders`).
//!
//! Header and segment directives apply to the in-flight request only,
//! except the `global*` keys which also persist into the defaults.
//! Keys are case-insensitive everywhere.

use crate::config::{PathOverrides, ServerSettings};
use crate::context::RequestDescriptor;
use crate::store::{normalize_path, FieldUpdate};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Where a directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Query,
    Header,
    Segment,
}

/// Recognized directive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKey {
    Path,
    Reset,
    Delay,
    StatusCode,
    ErrorCode,
    ErrorPeriod,
    Body,
    EchoBody,
    EchoContext,
    String,
    StringCache,
    Buffer,
    BufferCache,
    Stats,
    Log,
    LogFilter,
    Proxy,
    ConsoleLog,
    Settings,
    GlobalDelay,
    GlobalStatusCode,
    GlobalErrorCode,
}

impl DirectiveKey {
    /// Canonical query-parameter spelling.
    pub fn name(&self) -> &'static str {
        match self {
            DirectiveKey::Path => "path",
            DirectiveKey::Reset => "reset",
            DirectiveKey::Delay => "delay",
            DirectiveKey::StatusCode => "statusCode",
            DirectiveKey::ErrorCode => "errorCode",
            DirectiveKey::ErrorPeriod => "errorPct",
            DirectiveKey::Body => "body",
            DirectiveKey::EchoBody => "echoBody",
            DirectiveKey::EchoContext => "echoContext",
            DirectiveKey::String => "string",
            DirectiveKey::StringCache => "stringCache",
            DirectiveKey::Buffer => "buffer",
            DirectiveKey::BufferCache => "bufferCache",
            DirectiveKey::Stats => "stats",
            DirectiveKey::Log => "log",
            DirectiveKey::LogFilter => "logFilter",
            DirectiveKey::Proxy => "proxy",
            DirectiveKey::ConsoleLog => "consoleLog",
            DirectiveKey::Settings => "settings",
            DirectiveKey::GlobalDelay => "globalDelay",
            DirectiveKey::GlobalStatusCode => "globalStatusCode",
            DirectiveKey::GlobalErrorCode => "globalErrorCode",
        }
    }

    /// Keys that carry no value in the segment dialect.
    fn is_flag(&self) -> bool {
        matches!(self, DirectiveKey::Reset | DirectiveKey::Settings)
    }

    fn takes_period(&self) -> bool {
        matches!(self, DirectiveKey::ErrorCode | DirectiveKey::GlobalErrorCode)
    }

    fn is_global(&self) -> bool {
        matches!(
            self,
            DirectiveKey::GlobalDelay | DirectiveKey::GlobalStatusCode | DirectiveKey::GlobalErrorCode
        )
    }
}

impl FromStr for DirectiveKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.to_ascii_lowercase().as_str() {
            "path" => DirectiveKey::Path,
            "reset" => DirectiveKey::Reset,
            "delay" => DirectiveKey::Delay,
            "statuscode" => DirectiveKey::StatusCode,
            "errorcode" => DirectiveKey::ErrorCode,
            "errorpct" | "errorperiod" => DirectiveKey::ErrorPeriod,
            "body" => DirectiveKey::Body,
            "echobody" => DirectiveKey::EchoBody,
            "echocontext" => DirectiveKey::EchoContext,
            "string" | "randomstring" => DirectiveKey::String,
            "stringcache" | "cachedstring" => DirectiveKey::StringCache,
            "buffer" | "randombuffer" => DirectiveKey::Buffer,
            "buffercache" | "cachedbuffer" => DirectiveKey::BufferCache,
            "stats" => DirectiveKey::Stats,
            "log" => DirectiveKey::Log,
            "logfilter" => DirectiveKey::LogFilter,
            "proxy" => DirectiveKey::Proxy,
            "consolelog" => DirectiveKey::ConsoleLog,
            "settings" => DirectiveKey::Settings,
            "globaldelay" => DirectiveKey::GlobalDelay,
            "globalstatuscode" => DirectiveKey::GlobalStatusCode,
            "globalerrorcode" => DirectiveKey::GlobalErrorCode,
            _ => return Err(()),
        };
        Ok(key)
    }
}

/// Which configuration a field update lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The `path` target if given, otherwise the global defaults
    Target,
    /// The in-flight request only
    Request,
    /// The global defaults and the in-flight request
    Global,
}

/// Which counters a stats request reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsScope {
    All,
    Path(String),
    /// Whatever `path` names, or all paths without one
    Target,
}

/// Content produced by a directive instead of normal resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRequest {
    CachedString(usize),
    CachedBuffer(usize),
    FreshString(usize),
    FreshBuffer(usize),
    Stats(StatsScope),
    Log(usize),
    Settings,
}

impl ContentRequest {
    /// Higher rank wins when several content directives are present.
    fn rank(&self) -> u8 {
        match self {
            ContentRequest::CachedString(_) | ContentRequest::CachedBuffer(_) => 1,
            ContentRequest::FreshString(_) | ContentRequest::FreshBuffer(_) => 2,
            ContentRequest::Stats(_) => 3,
            ContentRequest::Log(_) => 4,
            ContentRequest::Settings => 5,
        }
    }
}

/// Console logging switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    Off,
    On,
    Compact,
    Verbose,
}

/// One parsed directive.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Path(String),
    Reset,
    Update { scope: Scope, update: FieldUpdate },
    Content(ContentRequest),
    LogFilter(String),
    ConsoleLog(ConsoleMode),
}

/// A directive value that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("{key}: {value:?} is not a valid integer")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key}: {value:?} is not a valid boolean")]
    InvalidBool { key: &'static str, value: String },

    #[error("{key}: status {value} is outside 200..=999")]
    InvalidStatus { key: &'static str, value: u16 },

    #[error("{key}: length {length} exceeds the limit of {limit}")]
    TooLarge {
        key: &'static str,
        length: usize,
        limit: usize,
    },

    #[error("{key}: invalid URL {value:?}")]
    InvalidUrl { key: &'static str, value: String },

    #[error("{key}: {value:?} is not a console log mode")]
    InvalidConsoleMode { key: &'static str, value: String },

    #[error("{key}: missing value")]
    MissingValue { key: &'static str },

    #[error("{key}: requires a path target")]
    MissingPath { key: &'static str },
}

impl DirectiveError {
    /// Name of the rejected directive.
    pub fn key(&self) -> &'static str {
        match self {
            DirectiveError::InvalidNumber { key, .. }
            | DirectiveError::InvalidBool { key, .. }
            | DirectiveError::InvalidStatus { key, .. }
            | DirectiveError::TooLarge { key, .. }
            | DirectiveError::InvalidUrl { key, .. }
            | DirectiveError::InvalidConsoleMode { key, .. }
            | DirectiveError::MissingValue { key }
            | DirectiveError::MissingPath { key } => *key,
        }
    }
}

/// All directives found on one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectiveSet {
    pub target: Option<String>,
    pub reset: bool,
    pub updates: Vec<(Scope, FieldUpdate)>,
    pub content: Option<ContentRequest>,
    pub log_filter: Option<String>,
    pub console: Option<ConsoleMode>,
    pub rejected: Vec<DirectiveError>,
}

impl DirectiveSet {
    /// Record a directive. Mutations accumulate; content keeps the
    /// highest-ranked request, the later one on ties.
    pub fn push(&mut self, directive: Directive) {
        match directive {
            Directive::Path(path) => self.target = Some(path),
            Directive::Reset => self.reset = true,
            Directive::Update { scope, update } => self.updates.push((scope, update)),
            Directive::Content(request) => {
                let replace = self
                    .content
                    .as_ref()
                    .map_or(true, |current| request.rank() >= current.rank());
                if replace {
                    self.content = Some(request);
                }
            }
            Directive::LogFilter(filter) => self.log_filter = Some(filter),
            Directive::ConsoleLog(mode) => self.console = Some(mode),
        }
    }

    /// Overrides layered over the frozen snapshot of the in-flight request.
    pub fn request_overrides(&self) -> PathOverrides {
        let mut overrides = PathOverrides::default();
        for (scope, update) in &self.updates {
            if matches!(scope, Scope::Request | Scope::Global) {
                update.apply_to(&mut overrides);
            }
        }
        overrides
    }

    /// Move targeted path-only updates without a path into `rejected`.
    fn finish(&mut self) {
        if self.target.is_some() {
            return;
        }
        let (kept, orphaned): (Vec<_>, Vec<_>) = self
            .updates
            .drain(..)
            .partition(|(scope, update)| *scope != Scope::Target || !update.is_path_only());
        self.updates = kept;
        for (_, update) in orphaned {
            self.rejected.push(DirectiveError::MissingPath {
                key: update_key(&update),
            });
        }
    }

    /// Names of rejected directives, for the response header.
    pub fn rejected_keys(&self) -> Vec<&'static str> {
        self.rejected.iter().map(DirectiveError::key).collect()
    }
}

fn update_key(update: &FieldUpdate) -> &'static str {
    match update {
        FieldUpdate::Delay(_) => DirectiveKey::Delay.name(),
        FieldUpdate::StatusCode(_) => DirectiveKey::StatusCode.name(),
        FieldUpdate::ErrorCode(_) => DirectiveKey::ErrorCode.name(),
        FieldUpdate::ErrorPeriod(_) => DirectiveKey::ErrorPeriod.name(),
        FieldUpdate::Body(_) => DirectiveKey::Body.name(),
        FieldUpdate::EchoBody(_) => DirectiveKey::EchoBody.name(),
        FieldUpdate::EchoContext(_) => DirectiveKey::EchoContext.name(),
        FieldUpdate::Proxy(_) => DirectiveKey::Proxy.name(),
    }
}

/// Result of parsing a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    /// Path key the request is resolved and counted under
    pub path: String,
    pub is_control: bool,
    pub directives: DirectiveSet,
}

/// Directive parser for all three channels.
#[derive(Debug, Clone)]
pub struct DirectiveParser {
    control_path: String,
    header_prefix: String,
    segment_prefix: String,
    max_content_length: usize,
}

impl DirectiveParser {
    /// Create a parser from the engine settings.
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            control_path: settings.control_path.clone(),
            header_prefix: settings.header_prefix.to_ascii_lowercase(),
            segment_prefix: settings.segment_prefix.clone(),
            max_content_length: settings.max_content_length,
        }
    }

    /// Whether `path` addresses the configuration endpoint.
    pub fn is_control_path(&self, path: &str) -> bool {
        path.contains(&self.control_path)
    }

    /// Extract every directive from a request.
    pub fn parse(&self, request: &RequestDescriptor) -> ParsedRequest {
        let mut set = DirectiveSet::default();

        let (path, segment_directives) = self.split_segments(&request.path, &mut set);
        for (key, args) in segment_directives {
            self.push_parsed(&mut set, key, &args, Channel::Segment);
        }

        for (name, value) in &request.headers {
            let Some(raw_key) = name.strip_prefix(&self.header_prefix) else {
                continue;
            };
            match raw_key.parse::<DirectiveKey>() {
                Ok(key) => {
                    let args: Vec<&str> = if key.takes_period() {
                        value.splitn(2, '/').collect()
                    } else {
                        vec![value.as_str()]
                    };
                    self.push_parsed(&mut set, key, &args, Channel::Header);
                }
                Err(()) => debug!(header = %name, "Ignoring unknown directive header"),
            }
        }

        let is_control = self.is_control_path(&path);
        if is_control {
            if let Some(query) = &request.query {
                for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                    let Ok(key) = name.parse::<DirectiveKey>() else {
                        debug!(key = %name, "Ignoring unknown query directive");
                        continue;
                    };
                    let value = if key == DirectiveKey::Body
                        && !request.is_get()
                        && !request.body.is_empty()
                    {
                        request.body_text()
                    } else {
                        value.into_owned()
                    };
                    self.push_parsed(&mut set, key, &[value.as_str()], Channel::Query);
                }
            }
        }

        set.finish();
        ParsedRequest {
            path,
            is_control,
            directives: set,
        }
    }

    /// Parse one directive from its key and raw value.
    ///
    /// Returns `Ok(None)` for values that switch nothing on (empty values,
    /// `reset=false`).
    pub fn parse_directive(
        &self,
        key: DirectiveKey,
        value: &str,
        channel: Channel,
    ) -> Result<Option<Directive>, DirectiveError> {
        let name = key.name();
        let value = value.trim();
        if value.is_empty() && !key.is_flag() {
            return Ok(None);
        }

        let scope = scope_for(key, channel);
        let update = |update| Ok(Some(Directive::Update { scope, update }));

        match key {
            DirectiveKey::Path => Ok(Some(Directive::Path(normalize_path(value)))),
            DirectiveKey::Reset | DirectiveKey::Settings => {
                let on = value.is_empty() || parse_bool(name, value)?;
                let directive = match key {
                    DirectiveKey::Reset => Directive::Reset,
                    _ => Directive::Content(ContentRequest::Settings),
                };
                Ok(on.then_some(directive))
            }
            DirectiveKey::Delay | DirectiveKey::GlobalDelay => {
                update(FieldUpdate::Delay(parse_number(name, value)?))
            }
            DirectiveKey::StatusCode | DirectiveKey::GlobalStatusCode => {
                update(FieldUpdate::StatusCode(parse_status(name, value)?))
            }
            DirectiveKey::ErrorCode | DirectiveKey::GlobalErrorCode => {
                let code: u16 = parse_number(name, value)?;
                if code != 0 {
                    check_status(name, code)?;
                }
                update(FieldUpdate::ErrorCode(code))
            }
            DirectiveKey::ErrorPeriod => update(FieldUpdate::ErrorPeriod(parse_number(name, value)?)),
            DirectiveKey::Body => update(FieldUpdate::Body(value.to_string())),
            DirectiveKey::EchoBody => update(FieldUpdate::EchoBody(parse_bool(name, value)?)),
            DirectiveKey::EchoContext => update(FieldUpdate::EchoContext(parse_bool(name, value)?)),
            DirectiveKey::Proxy => {
                let target = url::Url::parse(value)
                    .ok()
                    .filter(|url| matches!(url.scheme(), "http" | "https"))
                    .ok_or_else(|| DirectiveError::InvalidUrl {
                        key: name,
                        value: value.to_string(),
                    })?;
                update(FieldUpdate::Proxy(target.to_string()))
            }
            DirectiveKey::String => self.content_length(name, value).map(|n| {
                Some(Directive::Content(ContentRequest::FreshString(n)))
            }),
            DirectiveKey::StringCache => self.content_length(name, value).map(|n| {
                Some(Directive::Content(ContentRequest::CachedString(n)))
            }),
            DirectiveKey::Buffer => self.content_length(name, value).map(|n| {
                Some(Directive::Content(ContentRequest::FreshBuffer(n)))
            }),
            DirectiveKey::BufferCache => self.content_length(name, value).map(|n| {
                Some(Directive::Content(ContentRequest::CachedBuffer(n)))
            }),
            DirectiveKey::Stats => {
                let scope = match value.to_ascii_lowercase().as_str() {
                    "*" | "all" => StatsScope::All,
                    "true" | "1" => StatsScope::Target,
                    _ => StatsScope::Path(normalize_path(value)),
                };
                Ok(Some(Directive::Content(ContentRequest::Stats(scope))))
            }
            DirectiveKey::Log => Ok(Some(Directive::Content(ContentRequest::Log(
                parse_number(name, value)?,
            )))),
            DirectiveKey::LogFilter => Ok(Some(Directive::LogFilter(value.to_string()))),
            DirectiveKey::ConsoleLog => {
                let mode = match value.to_ascii_lowercase().as_str() {
                    "compact" => ConsoleMode::Compact,
                    "verbose" | "full" => ConsoleMode::Verbose,
                    other => match parse_bool(name, other) {
                        Ok(true) => ConsoleMode::On,
                        Ok(false) => ConsoleMode::Off,
                        Err(_) => {
                            return Err(DirectiveError::InvalidConsoleMode {
                                key: name,
                                value: value.to_string(),
                            })
                        }
                    },
                };
                Ok(Some(Directive::ConsoleLog(mode)))
            }
        }
    }

    /// Parse `key` with its arguments and record the outcome in `set`.
    /// A second argument on an error code is its period.
    fn push_parsed(&self, set: &mut DirectiveSet, key: DirectiveKey, args: &[&str], channel: Channel) {
        let value = args.first().copied().unwrap_or_default();
        match self.parse_directive(key, value, channel) {
            Ok(Some(directive)) => set.push(directive),
            Ok(None) => {}
            Err(e) => set.rejected.push(e),
        }

        let Some(period) = args.get(1).filter(|_| key.takes_period()) else {
            return;
        };
        match parse_number(DirectiveKey::ErrorPeriod.name(), period) {
            Ok(period) => set.push(Directive::Update {
                scope: scope_for(key, channel),
                update: FieldUpdate::ErrorPeriod(period),
            }),
            Err(e) => set.rejected.push(e),
        }
    }

    /// Split leading `/:key/value` segments off a path. Returns the
    /// remaining path and the directives found, in order.
    fn split_segments<'a>(
        &self,
        path: &'a str,
        set: &mut DirectiveSet,
    ) -> (String, Vec<(DirectiveKey, Vec<&'a str>)>) {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut directives = Vec::new();
        let mut index = 0;

        while let Some(segment) = segments.get(index) {
            let Some(key) = segment
                .strip_prefix(&self.segment_prefix)
                .and_then(|name| name.parse::<DirectiveKey>().ok())
            else {
                break;
            };
            index += 1;

            if key.is_flag() {
                directives.push((key, Vec::new()));
                continue;
            }

            let Some(value) = segments.get(index) else {
                set.rejected.push(DirectiveError::MissingValue { key: key.name() });
                break;
            };
            index += 1;
            let mut args = vec![*value];

            if key.takes_period() {
                if let Some(period) = segments
                    .get(index)
                    .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
                {
                    args.push(*period);
                    index += 1;
                }
            }
            directives.push((key, args));
        }

        if index == 0 {
            return (path.to_string(), directives);
        }
        (format!("/{}", segments[index..].join("/")), directives)
    }

    fn content_length(&self, key: &'static str, value: &str) -> Result<usize, DirectiveError> {
        let length: usize = parse_number(key, value)?;
        if length > self.max_content_length {
            return Err(DirectiveError::TooLarge {
                key,
                length,
                limit: self.max_content_length,
            });
        }
        Ok(length)
    }
}

fn scope_for(key: DirectiveKey, channel: Channel) -> Scope {
    if key.is_global() {
        Scope::Global
    } else if channel == Channel::Query {
        Scope::Target
    } else {
        Scope::Request
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, DirectiveError> {
    value
        .trim()
        .parse()
        .map_err(|_| DirectiveError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, DirectiveError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DirectiveError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_status(key: &'static str, value: &str) -> Result<u16, DirectiveError> {
    let code = parse_number(key, value)?;
    check_status(key, code)?;
    Ok(code)
}

/// 1xx codes are informational and cannot end an exchange.
fn check_status(key: &'static str, code: u16) -> Result<(), DirectiveError> {
    if !(200..=999).contains(&code) {
        return Err(DirectiveError::InvalidStatus { key, value: code });
    }
    Ok(())
}
