//! Configuration for the stub server.
//!
//! Defines the startup settings file: engine settings, the global response
//! defaults, and any path overrides to seed the store with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Main configuration for the stub server.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StubServerConfig {
    /// Engine settings
    #[serde(default)]
    pub settings: ServerSettings,

    /// Response defaults for every path without an override
    #[serde(default)]
    pub defaults: ResponseDefaults,

    /// Path overrides seeded at startup
    #[serde(default)]
    pub paths: BTreeMap<String, PathOverrides>,
}

impl StubServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings.validate()?;
        self.defaults
            .validate()
            .map_err(|e| anyhow::anyhow!("defaults: {}", e))?;
        for (path, overrides) in &self.paths {
            if !path.starts_with('/') {
                anyhow::bail!("Path {:?} must start with '/'", path);
            }
            overrides
                .validate()
                .map_err(|e| anyhow::anyhow!("Path {}: {}", path, e))?;
        }
        Ok(())
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Log every processed request
    #[serde(default = "default_true")]
    pub console_log: bool,

    /// One line per request instead of headers and body
    #[serde(default)]
    pub compact_log: bool,

    /// Number of history entries retained (0 = unbounded)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Path marker for query-string configuration requests
    #[serde(default = "default_control_path")]
    pub control_path: String,

    /// Header name prefix for header directives
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,

    /// Segment prefix for URL directives (`/:delay/100`)
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,

    /// Largest generated string or buffer, in bytes
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Timeout for forwarded requests
    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            console_log: true,
            compact_log: false,
            history_limit: default_history_limit(),
            control_path: default_control_path(),
            header_prefix: default_header_prefix(),
            segment_prefix: default_segment_prefix(),
            max_content_length: default_max_content_length(),
            proxy_timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

impl ServerSettings {
    /// Validate the settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.control_path.starts_with('/') || self.control_path.len() < 2 {
            anyhow::bail!("control_path must start with '/' and name a path");
        }
        if self.header_prefix.is_empty() {
            anyhow::bail!("header_prefix cannot be empty");
        }
        if self.segment_prefix.is_empty() || self.segment_prefix.contains('/') {
            anyhow::bail!("segment_prefix must be non-empty and contain no '/'");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    1000
}

fn default_control_path() -> String {
    "/.config".to_string()
}

fn default_header_prefix() -> String {
    "x-cmd-".to_string()
}

fn default_segment_prefix() -> String {
    ":".to_string()
}

fn default_max_content_length() -> usize {
    16 * 1024 * 1024
}

fn default_proxy_timeout_ms() -> u64 {
    10_000
}

fn default_status() -> u16 {
    200
}

/// Global response defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefaults {
    /// Delay before the response is sent
    #[serde(default)]
    pub delay_ms: u64,

    /// HTTP status code
    #[serde(default = "default_status")]
    pub status_code: u16,

    /// Status substituted on faulted requests (absent or 0 = never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,

    /// Fault every Nth request (absent = every request, 0 = never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_period: Option<u64>,

    /// Wrap content in a description of the exchange
    #[serde(default)]
    pub echo_context: bool,
}

impl Default for ResponseDefaults {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            status_code: default_status(),
            error_code: None,
            error_period: None,
            echo_context: false,
        }
    }
}

impl ResponseDefaults {
    /// Validate the defaults.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_status(self.status_code)?;
        if let Some(code) = self.error_code.filter(|c| *c != 0) {
            validate_status(code)?;
        }
        Ok(())
    }
}

/// Per-path overrides. Absent fields inherit the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PathOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_period: Option<u64>,

    /// Literal response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Answer non-GET requests with their own body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo_body: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo_context: Option<bool>,

    /// Forward requests to this URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl PathOverrides {
    /// Validate the overrides.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(code) = self.status_code {
            validate_status(code)?;
        }
        if let Some(code) = self.error_code.filter(|c| *c != 0) {
            validate_status(code)?;
        }
        if let Some(target) = &self.proxy {
            url::Url::parse(target)
                .map_err(|e| anyhow::anyhow!("Invalid proxy URL {}: {}", target, e))?;
        }
        Ok(())
    }
}

fn validate_status(code: u16) -> anyhow::Result<()> {
    if !(200..=999).contains(&code) {
        anyhow::bail!("Invalid status code: {}", code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StubServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, StubServerConfig::default());
        assert_eq!(config.defaults.status_code, 200);
        assert_eq!(config.settings.control_path, "/.config");
        assert_eq!(config.settings.history_limit, 1000);
    }

    #[test]
    fn test_informational_status_invalid() {
        assert!(StubServerConfig::from_yaml("defaults:\n  status_code: 101").is_err());
        assert!(StubServerConfig::from_yaml("paths:\n  /a:\n    error_code: 150").is_err());
        assert!(StubServerConfig::from_yaml("defaults:\n  status_code: 204").is_ok());
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config =
            StubServerConfig::from_yaml(include_str!("../config/default-config.yaml")).unwrap();
        assert_eq!(
            config.paths["/hello"].body.as_deref(),
            Some("Hello, World!")
        );
        assert_eq!(config.settings.segment_prefix, ":");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
settings:
  console_log: false
  compact_log: true
  history_limit: 50
defaults:
  delay_ms: 25
  status_code: 204
  error_code: 503
  error_period: 3
paths:
  /hello:
    body: "Hello, World!"
    status_code: 201
  /upstream:
    proxy: "http://127.0.0.1:9000/api"
"#;
        let config = StubServerConfig::from_yaml(yaml).unwrap();
        assert!(!config.settings.console_log);
        assert!(config.settings.compact_log);
        assert_eq!(config.settings.history_limit, 50);
        assert_eq!(config.defaults.delay_ms, 25);
        assert_eq!(config.defaults.error_code, Some(503));
        assert_eq!(config.defaults.error_period, Some(3));
        assert_eq!(
            config.paths["/hello"].body.as_deref(),
            Some("Hello, World!")
        );
        assert_eq!(config.paths["/hello"].status_code, Some(201));
        assert!(config.paths["/upstream"].proxy.is_some());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let yaml = r#"
defaults:
  status: 200
"#;
        assert!(StubServerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_invalid_status() {
        let yaml = r#"
paths:
  /broken:
    status_code: 42
"#;
        let err = StubServerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("/broken"));
    }

    #[test]
    fn test_rejects_relative_path() {
        let yaml = r#"
paths:
  hello:
    body: "x"
"#;
        assert!(StubServerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_invalid_proxy_url() {
        let yaml = r#"
paths:
  /p:
    proxy: "not a url"
"#;
        assert!(StubServerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_bad_segment_prefix() {
        let mut config = StubServerConfig::default();
        config.settings.segment_prefix = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "defaults:\n  status_code: 418").unwrap();
        let config = StubServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.defaults.status_code, 418);
    }
}
