//! Application-level configuration
//!
//! Defines the top-level configuration: storage, HTTP server, model
//! provider, logging, streaming and request limits.

use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::GenerationConfig;

/// Embedded default configuration file
pub const DEFAULT_CONFIG: &str = include_str!("../../forkline.config.toml");

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "forkline.config.toml";

/// Environment variable pointing at a configuration file
pub const CONFIG_PATH_ENV: &str = "FORKLINE_CONFIG";

const KNOWN_PROVIDERS: [&str; 2] = ["mock", "openai"];

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl AppConfig {
    /// Load configuration from the first file found, falling back to the
    /// embedded defaults.
    pub fn load() -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(CONFIG_FILE_NAME) {
            return Self::parse(&content, Path::new(CONFIG_FILE_NAME));
        }

        if let Some(base_dirs) = BaseDirs::new() {
            let home_config = base_dirs
                .home_dir()
                .join(".forkline")
                .join(CONFIG_FILE_NAME);
            if let Ok(content) = std::fs::read_to_string(&home_config) {
                return Self::parse(&content, &home_config);
            }
        }

        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(config_path);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {} from {}", CONFIG_PATH_ENV, path.display()))?;
            return Self::parse(&content, &path);
        }

        Self::embedded_default()
    }

    /// Full start-up resolution: an explicit path wins over the lookup
    /// chain, then environment overrides are applied and the result is
    /// validated.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    /// A missing file is created with the default settings.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "Configuration file not found at {}. Creating with default settings...",
                    path.display()
                );
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("Failed to create directory {}", parent.display())
                        })?;
                    }
                }
                std::fs::write(path, DEFAULT_CONFIG).with_context(|| {
                    format!("Failed to create config file at {}", path.display())
                })?;
                Self::embedded_default()
            }
            Err(e) => Err(anyhow!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            )),
        }
    }

    pub fn embedded_default() -> Result<Self> {
        toml::from_str(DEFAULT_CONFIG)
            .map_err(|e| anyhow!("Failed to parse embedded default config: {}", e))
    }

    fn parse(content: &str, origin: &Path) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| anyhow!("Failed to parse {}: {}", origin.display(), e))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.provider.is_empty() {
            return Err(anyhow!("Model provider cannot be empty"));
        }
        // Checked against known names regardless of compiled-in features
        let provider = self.model.provider.to_lowercase();
        if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
            return Err(anyhow!("Invalid model provider: {}", self.model.provider));
        }

        if self.model.temperature < 0.0 || self.model.temperature > 2.0 {
            return Err(anyhow!(
                "Temperature must be between 0.0 and 2.0, got {}",
                self.model.temperature
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow!("Invalid log level: {}", self.logging.level)),
        }

        if self.streaming.max_concurrent_streams == 0 {
            return Err(anyhow!("streaming.max_concurrent_streams must be at least 1"));
        }
        if self.streaming.keepalive_interval_secs == 0 {
            return Err(anyhow!("streaming.keepalive_interval_secs must be at least 1"));
        }
        if self.limits.max_traversal_steps == 0 {
            return Err(anyhow!("limits.max_traversal_steps must be at least 1"));
        }
        if self.server.host.trim().is_empty() {
            return Err(anyhow!("server.host cannot be empty"));
        }

        Ok(())
    }

    /// Apply FORKLINE_* environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|v| v.parse().ok())
        }

        if let Some(db_path) = var("FORKLINE_DB_PATH") {
            self.database.path = PathBuf::from(db_path);
        }
        if let Some(host) = var("FORKLINE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parsed("FORKLINE_PORT") {
            self.server.port = port;
        }
        if let Some(api_key) = var("FORKLINE_API_KEY") {
            self.server.api_key = Some(api_key);
        }
        if let Some(provider) = var("FORKLINE_PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(model_name) = var("FORKLINE_MODEL") {
            self.model.model_name = Some(model_name);
        }
        if let Some(source) = var("FORKLINE_API_KEY_SOURCE") {
            self.model.api_key_source = Some(source);
        }
        if let Some(temp) = parsed("FORKLINE_TEMPERATURE") {
            self.model.temperature = temp;
        }
        if let Some(level) = var("FORKLINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(streams) = parsed("FORKLINE_MAX_CONCURRENT_STREAMS") {
            self.streaming.max_concurrent_streams = streams;
        }
        if let Some(rpm) = parsed("FORKLINE_REQUESTS_PER_MINUTE") {
            self.limits.requests_per_minute = rpm;
        }
        if let Some(quota) = parsed("FORKLINE_TOKEN_QUOTA") {
            self.limits.token_quota = quota;
        }
    }

    /// Get a summary of the configuration
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        summary.push_str("Configuration loaded:\n");
        summary.push_str(&format!("Database: {}\n", self.database.path.display()));
        summary.push_str(&format!(
            "Server: {}:{} (auth: {})\n",
            self.server.host,
            self.server.port,
            if self.server.api_key.is_some() { "api key" } else { "none" }
        ));
        summary.push_str(&format!("Model Provider: {}\n", self.model.provider));
        if let Some(model) = &self.model.model_name {
            summary.push_str(&format!("Model Name: {}\n", model));
        }
        summary.push_str(&format!("Temperature: {}\n", self.model.temperature));
        summary.push_str(&format!("Logging Level: {}\n", self.logging.level));
        summary.push_str(&format!(
            "Streams per caller: {} (keepalive {}s)\n",
            self.streaming.max_concurrent_streams, self.streaming.keepalive_interval_secs
        ));
        summary.push_str(&format!(
            "Limits: {} req/min, {} token quota\n",
            self.limits.requests_per_minute, self.limits.token_quota
        ));
        summary
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the database file, or ":memory:"
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("forkline.duckdb"),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on every request when set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
            enable_cors: true,
        }
    }
}

/// Model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name ("mock" or "openai")
    pub provider: String,
    #[serde(default)]
    pub model_name: Option<String>,
    /// API key source (`env:VAR`, `file:PATH` or the key itself)
    #[serde(default)]
    pub api_key_source: Option<String>,
    /// Default temperature for model completions (0.0 to 2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Ask the model for titles instead of deriving them from the first message
    #[serde(default)]
    pub model_titles: bool,
}

fn default_temperature() -> f32 {
    0.7
}

impl ModelConfig {
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: Some(self.temperature),
            max_tokens: self.max_tokens,
            ..GenerationConfig::default()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model_name: None,
            api_key_source: None,
            temperature: default_temperature(),
            max_tokens: None,
            system_prompt: None,
            model_titles: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Streaming endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Concurrent streams allowed per caller
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

fn default_max_concurrent_streams() -> usize {
    4
}

fn default_keepalive_interval() -> u64 {
    15
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

/// Request limits. Zero disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub token_quota: u64,
    #[serde(default = "default_max_traversal_steps")]
    pub max_traversal_steps: usize,
}

fn default_max_traversal_steps() -> usize {
    100_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 0,
            token_quota: 0,
            max_traversal_steps: default_max_traversal_steps(),
        }
    }
}
