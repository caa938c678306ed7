//! Runtime configuration.
//!
//! Loaded once at startup from a TOML file, then overridden from the environment. Each
//! component receives the section it needs by value; nothing reads configuration ambiently.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub ai: AiSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub database: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    /// Never serialized back out.
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Namespace whose tables are introspected and may be queried.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Enforced by the server through `statement_timeout`, not by the executor.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub read_only_session: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_allowed_models")]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_locale")]
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
    #[serde(default = "default_true")]
    pub use_compact_schema: bool,
    /// 0 = every table.
    #[serde(default = "default_max_prompt_tables")]
    pub max_prompt_tables: usize,
    /// 0 = unlimited.
    #[serde(default = "default_max_correction_attempts")]
    pub max_correction_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_path")]
    pub path: String,
    /// 0 = keep forever.
    #[serde(default)]
    pub retention_days: u32,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "postgres".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_statement_timeout_ms() -> u64 {
    20_000
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_allowed_models() -> Vec<String> {
    vec![
        "gpt-4o-mini".to_string(),
        "gpt-4o".to_string(),
        "gpt-4-turbo".to_string(),
    ]
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_ai_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_locale() -> String {
    "en_US".to_string()
}

fn default_page_size() -> u32 {
    25
}

fn default_max_page_size() -> u32 {
    200
}

fn default_max_prompt_tables() -> usize {
    100
}

fn default_max_correction_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_audit_path() -> String {
    "./data/query_log.db".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            database: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            ssl_mode: SslMode::default(),
            schema: default_schema(),
            statement_timeout_ms: default_statement_timeout_ms(),
            read_only_session: true,
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            allowed_models: default_allowed_models(),
            endpoint: default_endpoint(),
            timeout_secs: default_ai_timeout_secs(),
            max_tokens: default_max_tokens(),
            locale: default_locale(),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            use_compact_schema: true,
            max_prompt_tables: default_max_prompt_tables(),
            max_correction_attempts: default_max_correction_attempts(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_audit_path(),
            retention_days: 0,
        }
    }
}

impl AiSettings {
    /// The model to request. Anything outside the allow-list falls back to the default.
    pub fn effective_model(&self) -> &str {
        if !self.model.is_empty() && self.allowed_models.iter().any(|m| m == &self.model) {
            &self.model
        } else {
            DEFAULT_MODEL
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment overrides are applied separately via `apply_env_overrides()`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SQLSCOUT_HOST") {
            self.server.host = v;
        }
        if let Some(port) = lookup("SQLSCOUT_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(v) = lookup("SQLSCOUT_DB_HOST") {
            self.database.host = v;
        }
        if let Some(port) = lookup("SQLSCOUT_DB_PORT").and_then(|v| v.parse().ok()) {
            self.database.port = port;
        }
        if let Some(v) = lookup("SQLSCOUT_DB_NAME") {
            self.database.database = v;
        }
        if let Some(v) = lookup("SQLSCOUT_DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("SQLSCOUT_DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.ai.api_key = v;
        }
        if let Some(v) = lookup("SQLSCOUT_MODEL") {
            self.ai.model = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.query.max_page_size == 0 {
            return Err(anyhow::anyhow!("max_page_size cannot be 0"));
        }

        if self.query.default_page_size == 0 {
            return Err(anyhow::anyhow!("default_page_size cannot be 0"));
        }

        if self.query.default_page_size > self.query.max_page_size {
            return Err(anyhow::anyhow!(
                "default_page_size ({}) cannot exceed max_page_size ({})",
                self.query.default_page_size,
                self.query.max_page_size
            ));
        }

        if self.database.schema.trim().is_empty() {
            return Err(anyhow::anyhow!("database.schema cannot be empty"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["compact", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        Ok(())
    }
}
