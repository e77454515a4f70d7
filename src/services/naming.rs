//! Asynchronous graph and branch titles.
//!
//! Titles are produced after the mutation that created the graph or branch
//! has committed. The tasks are fire-and-forget: failures are logged and
//! never reach the request that triggered them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::{ChatMessage, GenerationConfig, ModelProvider};
use crate::graph::BranchEngine;
use crate::persistence::run_blocking;

const MAX_TITLE_CHARS: usize = 60;

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn title(&self, seed: &str) -> Result<String>;
}

/// First non-empty line of the seed text, cut to a readable length.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTitles;

#[async_trait]
impl TitleGenerator for HeuristicTitles {
    async fn title(&self, seed: &str) -> Result<String> {
        heuristic_title(seed).ok_or_else(|| anyhow!("no text to derive a title from"))
    }
}

pub fn heuristic_title(seed: &str) -> Option<String> {
    let line = seed.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= MAX_TITLE_CHARS {
        return Some(line);
    }
    let cut: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
    Some(format!("{}...", cut.trim_end()))
}

/// Asks the model for a short title, falling back to the heuristic.
pub struct ModelTitles {
    provider: Arc<dyn ModelProvider>,
}

impl ModelTitles {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TitleGenerator for ModelTitles {
    async fn title(&self, seed: &str) -> Result<String> {
        let messages = vec![
            ChatMessage::system(
                "Reply with a title of at most six words for the conversation below. \
                 No quotes, no punctuation at the end.",
            ),
            ChatMessage::user(seed),
        ];
        let config = GenerationConfig {
            temperature: Some(0.2),
            max_tokens: Some(24),
            ..GenerationConfig::default()
        };
        let response = self.provider.generate(&messages, &config).await?;
        let cleaned = response.content.trim().trim_matches('"').to_string();
        heuristic_title(&cleaned)
            .or_else(|| heuristic_title(seed))
            .ok_or_else(|| anyhow!("model returned an empty title"))
    }
}

/// Spawns supervised title tasks.
#[derive(Clone)]
pub struct NamingService {
    engine: BranchEngine,
    generator: Arc<dyn TitleGenerator>,
}

impl NamingService {
    pub fn new(engine: BranchEngine, generator: Arc<dyn TitleGenerator>) -> Self {
        Self { engine, generator }
    }

    pub fn spawn_graph_title(&self, graph_id: String, seed: String) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let generator = self.generator.clone();
        tokio::spawn(async move {
            match generator.title(&seed).await {
                Ok(title) => {
                    let id = graph_id.clone();
                    let stored = title.clone();
                    match run_blocking(move || engine.set_graph_title(&id, &stored)).await {
                        Ok(()) => debug!(graph_id = %graph_id, title = %title, "graph titled"),
                        Err(e) => warn!(graph_id = %graph_id, "failed to store graph title: {}", e),
                    }
                }
                Err(e) => warn!(graph_id = %graph_id, "title generation failed: {}", e),
            }
        })
    }

    pub fn spawn_branch_title(&self, branch_id: String, seed: String) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let generator = self.generator.clone();
        tokio::spawn(async move {
            match generator.title(&seed).await {
                Ok(title) => {
                    let id = branch_id.clone();
                    let stored = title.clone();
                    match run_blocking(move || engine.set_branch_title(&id, &stored)).await {
                        Ok(()) => debug!(branch_id = %branch_id, title = %title, "branch titled"),
                        Err(e) => {
                            warn!(branch_id = %branch_id, "failed to store branch title: {}", e)
                        }
                    }
                }
                Err(e) => warn!(branch_id = %branch_id, "title generation failed: {}", e),
            }
        })
    }
}
