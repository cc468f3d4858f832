//! Configuration loading and validation for Quarry.
//!
//! Loads configuration from `~/.quarry/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.quarry/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Text-completion service
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Query pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Queried database and transcript store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// HTTP surface
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name used in logs
    #[serde(default = "default_provider_name")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// OpenAI-compatible base URL (without `/chat/completions`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Temperature for the free-form answers
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on generate/validate iterations per request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Validator confidence needed to accept a candidate
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Confidence a best-effort candidate needs after exhaustion
    #[serde(default = "default_fallback_confidence_threshold")]
    pub fallback_confidence_threshold: f64,

    /// Validation history ring buffer size
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// History entries shown to the generator
    #[serde(default = "default_recent_history_window")]
    pub recent_history_window: usize,

    /// Prior chat turns offered to the context resolver
    #[serde(default = "default_chat_history_limit")]
    pub chat_history_limit: usize,

    /// Upper bound on a stream consumer's idle wait
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for every completion call
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Rows shown to the validator and analyst
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,

    /// Generate personalized channel messages for accepted results
    #[serde(default = "default_true")]
    pub personalize: bool,

    /// Schema description handed to the generator and validator.
    /// Falls back to the built-in `customers` description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_file: Option<PathBuf>,
}

fn default_max_iterations() -> usize {
    10
}
fn default_confidence_threshold() -> f64 {
    0.8
}
fn default_fallback_confidence_threshold() -> f64 {
    0.5
}
fn default_history_capacity() -> usize {
    50
}
fn default_recent_history_window() -> usize {
    10
}
fn default_chat_history_limit() -> usize {
    50
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_sample_rows() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
            fallback_confidence_threshold: default_fallback_confidence_threshold(),
            history_capacity: default_history_capacity(),
            recent_history_window: default_recent_history_window(),
            chat_history_limit: default_chat_history_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            llm_timeout_secs: default_llm_timeout_secs(),
            sample_rows: default_sample_rows(),
            personalize: true,
            schema_file: None,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

/// Where chat transcripts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStoreKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL of the queried database (`postgres://…` or `sqlite:…`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Pool size for the queried database
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub chat_store: ChatStoreKind,

    /// SQLite URL for transcripts; defaults to `~/.quarry/history.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_store_url: Option<String>,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            chat_store: ChatStoreKind::default(),
            chat_store_url: None,
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &redact(&self.url))
            .field("max_connections", &self.max_connections)
            .field("chat_store", &self.chat_store)
            .field("chat_store_url", &self.chat_store_url)
            .finish()
    }
}

impl DatabaseConfig {
    /// The transcript store URL, resolved against the config directory.
    pub fn resolved_chat_store_url(&self) -> String {
        self.chat_store_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                AppConfig::config_dir().join("history.db").display()
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.quarry/config.toml).
    ///
    /// Environment variables take precedence over the file:
    /// - `QUARRY_API_KEY`, then `OPENAI_API_KEY`
    /// - `QUARRY_BASE_URL`, then `OPENAI_BASE_URL`
    /// - `QUARRY_MODEL`, then `OPENAI_MODEL`
    /// - `QUARRY_DATABASE_URL`, then `DATABASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// [`load`](Self::load)). Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .find(|value| !value.trim().is_empty())
        };

        if let Some(key) = first(&["QUARRY_API_KEY", "OPENAI_API_KEY"]) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = first(&["QUARRY_BASE_URL", "OPENAI_BASE_URL"]) {
            self.provider.base_url = url;
        }
        if let Some(model) = first(&["QUARRY_MODEL", "OPENAI_MODEL"]) {
            self.provider.model = model;
        }
        if let Some(url) = first(&["QUARRY_DATABASE_URL", "DATABASE_URL"]) {
            self.database.url = Some(url);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".quarry")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;

        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if p.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_iterations must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&p.confidence_threshold) {
            return Err(ConfigError::ValidationError(
                "pipeline.confidence_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&p.fallback_confidence_threshold) {
            return Err(ConfigError::ValidationError(
                "pipeline.fallback_confidence_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if p.fallback_confidence_threshold > p.confidence_threshold {
            return Err(ConfigError::ValidationError(
                "pipeline.fallback_confidence_threshold must not exceed confidence_threshold".into(),
            ));
        }
        if p.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.history_capacity must be at least 1".into(),
            ));
        }
        if p.poll_interval_ms == 0 || p.llm_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.poll_interval_ms and llm_timeout_secs must be positive".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.max_iterations, 10);
        assert_eq!(config.pipeline.history_capacity, 50);
        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.database.chat_store, ChatStoreKind::Sqlite);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.provider.model, config.provider.model);
        assert_eq!(parsed.pipeline.confidence_threshold, 0.8);
    }

    #[test]
    fn fallback_above_threshold_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.fallback_confidence_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.provider.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[provider]
model = "gpt-4o"

[pipeline]
max_iterations = 3
confidence_threshold = 0.9

[database]
chat_store = "memory"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.pipeline.max_iterations, 3);
        assert_eq!(config.pipeline.sample_rows, 10);
        assert_eq!(config.database.chat_store, ChatStoreKind::Memory);
    }

    #[test]
    fn invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nconfidence_threshold = 1.5").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline\n").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn overrides_prefer_quarry_keys() {
        let env: HashMap<&str, &str> = [
            ("QUARRY_API_KEY", "sk-quarry"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("OPENAI_MODEL", "gpt-4.1"),
            ("QUARRY_BASE_URL", "  "),
            ("DATABASE_URL", "postgres://localhost/crm"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.provider.api_key.as_deref(), Some("sk-quarry"));
        assert_eq!(config.provider.model, "gpt-4.1");
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/crm"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.provider.api_key = Some("sk-secret".into());
        config.database.url = Some("postgres://user:hunter2@db/crm".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("max_iterations = 10"));
    }
}
