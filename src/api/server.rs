/// HTTP server implementation
use crate::agent::{create_provider, ModelProvider};
use crate::api::handlers::{
    append, branch_history, delete_node, generate_stream, get_branch, get_graph, health_check,
    inject, jump, replace_tip, send_stream, start_graph, AppState,
};
use crate::api::identity::HeaderIdentity;
use crate::config::AppConfig;
use crate::graph::BranchEngine;
use crate::persistence::Persistence;
use crate::services::{
    FixedWindowRateLimiter, HeuristicTitles, InMemoryQuota, ModelTitles, NamingService,
    QuotaService, RateLimiter, StreamSlots, TitleGenerator, Unlimited, UnlimitedQuota,
};
use crate::streaming::StreamingPipeline;
use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_key: None,
            enable_cors: true,
        }
    }
}

impl ApiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            api_key: config.server.api_key.clone(),
            enable_cors: config.server.enable_cors,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Wire the engine, pipeline and collaborator services described by `config`.
pub fn build_state(
    config: &AppConfig,
    persistence: Persistence,
    provider: Arc<dyn ModelProvider>,
) -> AppState {
    let engine =
        BranchEngine::new(persistence).with_max_traversal_steps(config.limits.max_traversal_steps);

    let rate_limiter: Arc<dyn RateLimiter> = match config.limits.requests_per_minute {
        0 => Arc::new(Unlimited),
        rpm => Arc::new(FixedWindowRateLimiter::per_minute(rpm)),
    };
    let quota: Arc<dyn QuotaService> = match config.limits.token_quota {
        0 => Arc::new(UnlimitedQuota),
        limit => Arc::new(InMemoryQuota::new(limit)),
    };
    let titles: Arc<dyn TitleGenerator> = if config.model.model_titles {
        Arc::new(ModelTitles::new(provider.clone()))
    } else {
        Arc::new(HeuristicTitles)
    };
    let naming = NamingService::new(engine.clone(), titles);

    let pipeline = StreamingPipeline::new(engine.clone(), provider)
        .with_generation_config(config.model.generation_config())
        .with_rate_limiter(rate_limiter.clone())
        .with_quota(quota)
        .with_slots(StreamSlots::new(config.streaming.max_concurrent_streams))
        .with_keepalive(Duration::from_secs(config.streaming.keepalive_interval_secs))
        .with_naming(naming.clone());

    let identity = Arc::new(HeaderIdentity::new(config.server.api_key.clone()));
    AppState::new(engine, pipeline, identity, rate_limiter, config.clone()).with_naming(naming)
}

/// Build the router with all routes
pub fn build_router(state: AppState, enable_cors: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        // Graphs
        .route("/graphs/start", post(start_graph))
        .route("/graphs/:id", get(get_graph))
        // Branches
        .route("/branches/:id", get(get_branch))
        .route("/branches/:id/history", get(branch_history))
        .route("/branches/:id/append", post(append))
        .route("/branches/:id/jump", post(jump))
        .route("/branches/:id/replace-tip", post(replace_tip))
        .route("/branches/:id/inject", post(inject))
        // Streaming
        .route("/branches/:id/generate/stream", post(generate_stream))
        .route("/branches/:id/send/stream", post(send_stream))
        // Nodes
        .route("/nodes/:id", delete(delete_node))
        .with_state(state);

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    router.layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Open the configured database and model provider and assemble the server.
    pub fn from_app_config(app_config: &AppConfig) -> Result<Self> {
        let persistence = Persistence::new(&app_config.database.path).with_context(|| {
            format!(
                "opening database at {}",
                app_config.database.path.display()
            )
        })?;
        let provider = create_provider(&app_config.model)?;
        let state = build_state(app_config, persistence, provider);
        Ok(Self::new(ApiConfig::from_app_config(app_config), state))
    }

    pub fn persistence(&self) -> &Persistence {
        self.state.engine.persistence()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone(), self.config.enable_cors)
    }

    /// Run the server
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let app = self.router();
        let bind_addr = self.config.bind_address();

        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {}", bind_addr))?;
        tracing::info!("forkline listening on {}", bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        if let Err(e) = self.persistence().checkpoint() {
            tracing::warn!("checkpoint on shutdown failed: {:#}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_default() {
        let config = ApiConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert!(config.api_key.is_none());
        assert!(config.enable_cors);
    }

    #[test]
    fn test_api_config_builder() {
        let config = ApiConfig::new()
            .with_host("0.0.0.0")
            .with_port(8080)
            .with_api_key("secret123")
            .with_cors(false);

        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.api_key, Some("secret123".to_string()));
        assert!(!config.enable_cors);
    }

    #[test]
    fn test_api_config_from_app_config() {
        let mut app = AppConfig::default();
        app.server.port = 4100;
        app.server.api_key = Some("k".into());
        let config = ApiConfig::from_app_config(&app);
        assert_eq!(config.port, 4100);
        assert_eq!(config.api_key.as_deref(), Some("k"));
    }
}
