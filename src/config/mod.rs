pub mod app_config;

pub use app_config::{
    AppConfig, DatabaseConfig, LimitsConfig, LoggingConfig, ModelConfig, ServerConfig,
    StreamingConfig, CONFIG_FILE_NAME, CONFIG_PATH_ENV, DEFAULT_CONFIG,
};
