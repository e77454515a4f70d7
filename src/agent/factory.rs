//! Provider Factory
//!
//! Creates model provider instances based on configuration.

use crate::agent::model::{ModelProvider, ProviderKind};
use crate::agent::providers::MockProvider;
#[cfg(feature = "openai")]
use crate::agent::providers::OpenAIProvider;
use crate::config::ModelConfig;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::info;

/// Create a model provider from configuration
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn ModelProvider>> {
    let provider_kind = ProviderKind::from_str(&config.provider)
        .ok_or_else(|| anyhow!("Unknown provider: {}", config.provider))?;

    let provider: Arc<dyn ModelProvider> = match provider_kind {
        ProviderKind::Mock => {
            let provider = match &config.model_name {
                Some(model_name) => MockProvider::default().with_model_name(model_name.clone()),
                None => MockProvider::default(),
            };
            Arc::new(provider)
        }

        #[cfg(feature = "openai")]
        ProviderKind::OpenAI => {
            let api_key = match &config.api_key_source {
                Some(source) => resolve_api_key(source)?,
                None => load_api_key_from_env("OPENAI_API_KEY")?,
            };

            let mut provider = OpenAIProvider::with_api_key(api_key);
            if let Some(model_name) = &config.model_name {
                provider = provider.with_model(model_name.clone());
            }
            if let Some(system_prompt) = &config.system_prompt {
                provider = provider.with_system_message(system_prompt.clone());
            }
            Arc::new(provider)
        }
    };

    info!(
        provider = provider_kind.as_str(),
        model = provider.model_name(),
        "model provider ready"
    );
    Ok(provider)
}

/// Resolve API key from a source string
///
/// Supports the following formats:
/// - `env:VAR_NAME` - Load from environment variable
/// - `file:PATH` - Load from file
/// - Any other string - Use as-is (direct API key)
pub fn resolve_api_key(source: &str) -> Result<String> {
    if let Some(env_var) = source.strip_prefix("env:") {
        load_api_key_from_env(env_var)
    } else if let Some(path) = source.strip_prefix("file:") {
        load_api_key_from_file(path)
    } else {
        Ok(source.to_string())
    }
}

pub fn load_api_key_from_env(env_var: &str) -> Result<String> {
    std::env::var(env_var).context(format!("Environment variable {} not set", env_var))
}

pub fn load_api_key_from_file(path: &str) -> Result<String> {
    let expanded_path = match (path.strip_prefix("~/"), directories::BaseDirs::new()) {
        (Some(stripped), Some(base)) => base.home_dir().join(stripped),
        _ => std::path::PathBuf::from(path),
    };

    std::fs::read_to_string(&expanded_path)
        .context(format!("Failed to read API key from file: {}", path))
        .map(|s| s.trim().to_string())
}
