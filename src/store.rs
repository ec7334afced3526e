//! Live configuration store.
//!
//! Holds the global response defaults, per-path overrides and hit counters,
//! and the process-wide request counter. The effective configuration for a
//! request is merged fresh from the defaults and the path override every
//! time; nothing caches the merge.

use crate::config::{PathOverrides, ResponseDefaults, StubServerConfig};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A single configuration field write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Delay(u64),
    StatusCode(u16),
    ErrorCode(u16),
    ErrorPeriod(u64),
    Body(String),
    EchoBody(bool),
    EchoContext(bool),
    Proxy(String),
}

impl FieldUpdate {
    /// Whether the field exists only on paths, not on the global defaults.
    pub fn is_path_only(&self) -> bool {
        matches!(
            self,
            FieldUpdate::Body(_) | FieldUpdate::EchoBody(_) | FieldUpdate::Proxy(_)
        )
    }

    /// Write this field into a set of overrides.
    pub fn apply_to(&self, overrides: &mut PathOverrides) {
        match self {
            FieldUpdate::Delay(ms) => overrides.delay_ms = Some(*ms),
            FieldUpdate::StatusCode(code) => overrides.status_code = Some(*code),
            FieldUpdate::ErrorCode(code) => overrides.error_code = Some(*code),
            FieldUpdate::ErrorPeriod(period) => overrides.error_period = Some(*period),
            FieldUpdate::Body(body) => overrides.body = Some(body.clone()),
            FieldUpdate::EchoBody(on) => overrides.echo_body = Some(*on),
            FieldUpdate::EchoContext(on) => overrides.echo_context = Some(*on),
            FieldUpdate::Proxy(target) => overrides.proxy = Some(target.clone()),
        }
    }

    /// Write this field into the global defaults. Returns false for
    /// path-only fields, which leave the defaults untouched.
    pub fn apply_to_defaults(&self, defaults: &mut ResponseDefaults) -> bool {
        match self {
            FieldUpdate::Delay(ms) => defaults.delay_ms = *ms,
            FieldUpdate::StatusCode(code) => defaults.status_code = *code,
            FieldUpdate::ErrorCode(code) => defaults.error_code = Some(*code),
            FieldUpdate::ErrorPeriod(period) => defaults.error_period = Some(*period),
            FieldUpdate::EchoContext(on) => defaults.echo_context = *on,
            FieldUpdate::Body(_) | FieldUpdate::EchoBody(_) | FieldUpdate::Proxy(_) => {
                return false
            }
        }
        true
    }
}

/// Configuration in force for one request: defaults overlaid with the
/// path override (and any request-scoped directives).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub delay_ms: u64,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub echo_body: bool,
    pub echo_context: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl EffectiveConfig {
    /// Field-wise merge: a field present in `overrides` wins.
    pub fn merge(defaults: &ResponseDefaults, overrides: Option<&PathOverrides>) -> Self {
        let mut config = Self {
            delay_ms: defaults.delay_ms,
            status_code: defaults.status_code,
            error_code: defaults.error_code,
            error_period: defaults.error_period,
            body: None,
            echo_body: false,
            echo_context: defaults.echo_context,
            proxy: None,
        };
        if let Some(overrides) = overrides {
            config.layer(overrides);
        }
        config
    }

    /// Overlay another set of overrides on top of this configuration.
    pub fn layer(&mut self, overrides: &PathOverrides) {
        if let Some(ms) = overrides.delay_ms {
            self.delay_ms = ms;
        }
        if let Some(code) = overrides.status_code {
            self.status_code = code;
        }
        if let Some(code) = overrides.error_code {
            self.error_code = Some(code);
        }
        if let Some(period) = overrides.error_period {
            self.error_period = Some(period);
        }
        if let Some(body) = &overrides.body {
            self.body = Some(body.clone());
        }
        if let Some(on) = overrides.echo_body {
            self.echo_body = on;
        }
        if let Some(on) = overrides.echo_context {
            self.echo_context = on;
        }
        if let Some(target) = &overrides.proxy {
            self.proxy = Some(target.clone());
        }
    }
}

/// Override and hit counters for one path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathConfig {
    pub overrides: PathOverrides,
    /// Hits per HTTP method
    pub counters: BTreeMap<String, u64>,
}

/// What `resetAll` restores.
#[derive(Debug, Clone)]
struct Baseline {
    console_log: bool,
    compact_log: bool,
    defaults: ResponseDefaults,
    paths: BTreeMap<String, PathOverrides>,
}

/// Process-wide mutable configuration.
#[derive(Debug)]
pub struct ConfigStore {
    baseline: Baseline,
    request_counter: u64,
    console_log: bool,
    compact_log: bool,
    defaults: ResponseDefaults,
    paths: HashMap<String, PathConfig>,
    /// Path keys in creation order, for enumeration
    order: Vec<String>,
}

impl ConfigStore {
    /// Create a store seeded from the startup configuration.
    pub fn new(config: &StubServerConfig) -> Self {
        let baseline = Baseline {
            console_log: config.settings.console_log,
            compact_log: config.settings.compact_log,
            defaults: config.defaults.clone(),
            paths: config
                .paths
                .iter()
                .map(|(path, overrides)| (normalize_path(path), overrides.clone()))
                .collect(),
        };
        let mut store = Self {
            baseline,
            request_counter: 0,
            console_log: false,
            compact_log: false,
            defaults: ResponseDefaults::default(),
            paths: HashMap::new(),
            order: Vec::new(),
        };
        store.reset_all();
        store
    }

    /// Effective configuration for `path`. Unknown paths get pure defaults.
    pub fn get(&self, path: &str) -> EffectiveConfig {
        EffectiveConfig::merge(
            &self.defaults,
            self.paths.get(path).map(|config| &config.overrides),
        )
    }

    /// Increment the global request counter and return the new value.
    pub fn next_request(&mut self) -> u64 {
        self.request_counter += 1;
        self.request_counter
    }

    pub fn request_counter(&self) -> u64 {
        self.request_counter
    }

    pub fn console_log(&self) -> bool {
        self.console_log
    }

    pub fn compact_log(&self) -> bool {
        self.compact_log
    }

    /// Set the console logging flags.
    pub fn set_logging(&mut self, enabled: bool, compact: Option<bool>) {
        self.console_log = enabled;
        if let Some(compact) = compact {
            self.compact_log = compact;
        }
    }

    /// Path configuration, if the path has been seen or configured.
    pub fn path(&self, path: &str) -> Option<&PathConfig> {
        self.paths.get(path)
    }

    /// Known paths in creation order.
    pub fn paths(&self) -> impl Iterator<Item = (&str, &PathConfig)> {
        self.order
            .iter()
            .filter_map(|path| self.paths.get(path).map(|config| (path.as_str(), config)))
    }

    /// Write a field on `path`, creating its entry if needed.
    pub fn set_path_field(&mut self, path: &str, update: &FieldUpdate) {
        debug!(path = %path, update = ?update, "Setting path field");
        update.apply_to(&mut self.entry(path).overrides);
    }

    /// Write a field on the global defaults. Returns false for path-only fields.
    pub fn set_default_field(&mut self, update: &FieldUpdate) -> bool {
        debug!(update = ?update, "Setting default field");
        update.apply_to_defaults(&mut self.defaults)
    }

    /// Count a request to `path` with `method`.
    pub fn record_hit(&mut self, path: &str, method: &str) {
        *self
            .entry(path)
            .counters
            .entry(method.to_string())
            .or_insert(0) += 1;
    }

    /// Restore the startup baseline and zero every counter.
    pub fn reset_all(&mut self) {
        debug!("Resetting configuration store");
        self.request_counter = 0;
        self.console_log = self.baseline.console_log;
        self.compact_log = self.baseline.compact_log;
        self.defaults = self.baseline.defaults.clone();
        self.paths.clear();
        self.order.clear();

        let seeded: Vec<_> = self
            .baseline
            .paths
            .iter()
            .map(|(path, overrides)| (path.clone(), overrides.clone()))
            .collect();
        for (path, overrides) in seeded {
            self.entry(&path).overrides = overrides;
        }
    }

    /// Clear the override and the hit counters of one path.
    pub fn reset_path(&mut self, path: &str) {
        debug!(path = %path, "Resetting path configuration");
        *self.entry(path) = PathConfig::default();
    }

    /// Method counters for one path.
    pub fn stats(&self, path: &str) -> BTreeMap<String, u64> {
        self.paths
            .get(path)
            .map(|config| config.counters.clone())
            .unwrap_or_default()
    }

    /// Method counters for every path that has been hit.
    pub fn stats_all(&self) -> Vec<(String, BTreeMap<String, u64>)> {
        self.paths()
            .filter(|(_, config)| !config.counters.is_empty())
            .map(|(path, config)| (path.to_string(), config.counters.clone()))
            .collect()
    }

    /// Full store description for the `settings` directive.
    pub fn describe(&self) -> StoreSettings<'_> {
        StoreSettings {
            request_counter: self.request_counter,
            console_log: self.console_log,
            compact_log: self.compact_log,
            defaults: EffectiveConfig::merge(&self.defaults, None),
            paths: PathSettingsMap(self),
        }
    }

    fn entry(&mut self, path: &str) -> &mut PathConfig {
        if !self.paths.contains_key(path) {
            self.order.push(path.to_string());
        }
        self.paths.entry(path.to_string()).or_default()
    }
}

/// Serialized view of the whole store, as dumped by `settings`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings<'a> {
    pub request_counter: u64,
    pub console_log: bool,
    pub compact_log: bool,
    /// Defaults as they apply to a path without overrides
    pub defaults: EffectiveConfig,
    paths: PathSettingsMap<'a>,
}

/// Paths in creation order.
#[derive(Debug)]
struct PathSettingsMap<'a>(&'a ConfigStore);

impl Serialize for PathSettingsMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.0
                .paths()
                .map(|(path, config)| (path, PathSettings::from(config))),
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PathSettings<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    echo_body: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    echo_context: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'a str>,
    counters: &'a BTreeMap<String, u64>,
}

impl<'a> From<&'a PathConfig> for PathSettings<'a> {
    fn from(config: &'a PathConfig) -> Self {
        let overrides = &config.overrides;
        Self {
            delay_ms: overrides.delay_ms,
            status_code: overrides.status_code,
            error_code: overrides.error_code,
            error_period: overrides.error_period,
            body: overrides.body.as_deref(),
            echo_body: overrides.echo_body,
            echo_context: overrides.echo_context,
            proxy: overrides.proxy.as_deref(),
            counters: &config.counters,
        }
    }
}

/// Normalize a path key: drop any query or fragment and ensure a leading '/'.
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let end = trimmed.find(&['?', '#'][..]).unwrap_or(trimmed.len());
    let path = &trimmed[..end];
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::new(&StubServerConfig::default())
    }

    #[test]
    fn test_unknown_path_yields_defaults() {
        let store = store();
        let config = store.get("/nowhere");
        assert_eq!(config.status_code, 200);
        assert_eq!(config.delay_ms, 0);
        assert_eq!(config.error_code, None);
        assert_eq!(config.body, None);
        assert!(store.path("/nowhere").is_none());
    }

    #[test]
    fn test_override_wins_field_wise() {
        let mut store = store();
        store.set_default_field(&FieldUpdate::Delay(50));
        store.set_default_field(&FieldUpdate::StatusCode(202));
        store.set_path_field("/a", &FieldUpdate::StatusCode(404));

        let a = store.get("/a");
        assert_eq!(a.status_code, 404);
        assert_eq!(a.delay_ms, 50);

        let b = store.get("/b");
        assert_eq!(b.status_code, 202);
    }

    #[test]
    fn test_path_only_fields_rejected_on_defaults() {
        let mut store = store();
        assert!(!store.set_default_field(&FieldUpdate::Body("x".into())));
        assert!(!store.set_default_field(&FieldUpdate::Proxy("http://x".into())));
        assert!(store.set_default_field(&FieldUpdate::EchoContext(true)));
        assert!(store.get("/any").echo_context);
    }

    #[test]
    fn test_record_hit_creates_entry() {
        let mut store = store();
        store.record_hit("/x", "GET");
        store.record_hit("/x", "GET");
        store.record_hit("/x", "POST");
        let stats = store.stats("/x");
        assert_eq!(stats["GET"], 2);
        assert_eq!(stats["POST"], 1);
        assert_eq!(store.path("/x").unwrap().counters.values().sum::<u64>(), 3);
        assert!(store.stats("/y").is_empty());
    }

    #[test]
    fn test_reset_all_restores_defaults() {
        let mut store = store();
        store.next_request();
        store.record_hit("/x", "GET");
        store.set_path_field("/x", &FieldUpdate::Delay(10));
        store.set_default_field(&FieldUpdate::StatusCode(500));
        store.set_logging(false, Some(true));

        store.reset_all();

        assert_eq!(store.request_counter(), 0);
        assert!(store.stats_all().is_empty());
        assert_eq!(store.get("/x").delay_ms, 0);
        assert_eq!(store.get("/x").status_code, 200);
        assert!(store.console_log());
        assert!(!store.compact_log());
    }

    #[test]
    fn test_reset_all_restores_seeded_paths() {
        let config = StubServerConfig::from_yaml(
            r#"
paths:
  /seeded:
    body: "seed"
"#,
        )
        .unwrap();
        let mut store = ConfigStore::new(&config);
        store.set_path_field("/seeded", &FieldUpdate::Body("changed".into()));
        store.reset_all();
        assert_eq!(store.get("/seeded").body.as_deref(), Some("seed"));
    }

    #[test]
    fn test_reset_path_clears_override_and_counters() {
        let mut store = store();
        store.set_path_field("/a", &FieldUpdate::StatusCode(418));
        store.record_hit("/a", "GET");
        store.set_path_field("/b", &FieldUpdate::StatusCode(419));
        store.record_hit("/b", "GET");

        store.reset_path("/a");

        assert_eq!(store.get("/a").status_code, 200);
        assert!(store.stats("/a").is_empty());
        assert_eq!(store.get("/b").status_code, 419);
        assert_eq!(store.stats("/b")["GET"], 1);
    }

    #[test]
    fn test_paths_enumerate_in_creation_order() {
        let mut store = store();
        store.record_hit("/z", "GET");
        store.record_hit("/a", "GET");
        store.record_hit("/m", "GET");
        let order: Vec<_> = store.paths().map(|(p, _)| p.to_string()).collect();
        assert_eq!(order, vec!["/z", "/a", "/m"]);
    }

    #[test]
    fn test_describe_includes_counters() {
        let mut store = store();
        store.next_request();
        store.record_hit("/a", "GET");
        store.set_path_field("/a", &FieldUpdate::Delay(5));
        let description = serde_json::to_value(store.describe()).unwrap();
        assert_eq!(description["requestCounter"], 1);
        assert_eq!(description["paths"]["/a"]["counters"]["GET"], 1);
        assert_eq!(description["paths"]["/a"]["delayMs"], 5);
        assert_eq!(description["defaults"]["statusCode"], 200);
        assert_eq!(description["defaults"]["echoBody"], false);
        assert_eq!(description["defaults"]["echoContext"], false);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b"), "/a/b");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a?x=1"), "/a");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path(" /a#frag "), "/a");
    }
}
