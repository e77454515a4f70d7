//! Streaming generation pipeline.
//!
//! [`StreamingPipeline::open`] runs the admission checks (rate limit, stream
//! slot, quota) and hands the rest to a spawned task that talks back only
//! through the frame channel. The task replays a stored result or validates
//! the body, forwards provider chunks as `delta` frames and ends with exactly
//! one commit through [`BranchEngine::append`]. Database work runs on the
//! blocking pool.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frames::{FinalPayload, StreamFrame};
use crate::agent::{ChatMessage, GenerationConfig, ModelProvider};
use crate::error::{GraphError, GraphResult};
use crate::graph::engine::{estimate_tokens, validate_branch_name, validate_content};
use crate::graph::{AppendOutcome, AppendRequest, BranchEngine};
use crate::persistence::idempotency::IdempotencyKey;
use crate::persistence::{run_blocking, IdempotencyCache};
use crate::services::{
    NamingService, QuotaService, RateLimiter, StreamSlot, StreamSlots, Unlimited, UnlimitedQuota,
};
use crate::types::{BlockKind, Branch, Item};

const FRAME_BUFFER: usize = 64;
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Generate an assistant reply at the current tip.
    Generate,
    /// Append the user's message, then generate a reply to it.
    Send,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub expected_version: Option<i64>,
    pub fork_from_node_id: Option<String>,
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    pub user_message: JsonValue,
    pub expected_version: Option<i64>,
    pub fork_from_node_id: Option<String>,
    pub branch_name: Option<String>,
}

/// One incoming streaming request, as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub caller: String,
    pub branch_id: String,
    pub kind: StreamKind,
    /// Path used to scope the idempotency key.
    pub path: String,
    pub idempotency_token: Option<String>,
    /// Raw request body; validated after admission.
    pub body: Vec<u8>,
}

/// Validated body, whichever endpoint it came from.
#[derive(Debug, Clone)]
struct Plan {
    user_message: Option<JsonValue>,
    expected_version: Option<i64>,
    fork_from_node_id: Option<String>,
    branch_name: Option<String>,
}

impl Plan {
    fn parse(kind: StreamKind, raw: &[u8]) -> GraphResult<Self> {
        let value: JsonValue = if raw.iter().all(u8::is_ascii_whitespace) {
            json!({})
        } else {
            serde_json::from_slice(raw)
                .map_err(|e| GraphError::validation(format!("malformed JSON body: {}", e)))?
        };

        let plan = match kind {
            StreamKind::Generate => {
                let body: GenerateBody = serde_json::from_value(value)
                    .map_err(|e| GraphError::validation(e.to_string()))?;
                Plan {
                    user_message: None,
                    expected_version: body.expected_version,
                    fork_from_node_id: body.fork_from_node_id,
                    branch_name: body.branch_name,
                }
            }
            StreamKind::Send => {
                let body: SendBody = serde_json::from_value(value)
                    .map_err(|e| GraphError::validation(e.to_string()))?;
                validate_content(&body.user_message)?;
                Plan {
                    user_message: Some(body.user_message),
                    expected_version: body.expected_version,
                    fork_from_node_id: body.fork_from_node_id,
                    branch_name: body.branch_name,
                }
            }
        };

        if let Some(name) = &plan.branch_name {
            validate_branch_name(name)?;
        }
        if plan.branch_name.is_some() && plan.fork_from_node_id.is_none() {
            return Err(GraphError::validation(
                "branchName is only accepted together with forkFromNodeId",
            ));
        }
        if matches!(plan.expected_version, Some(v) if v < 0) {
            return Err(GraphError::validation("expectedVersion must not be negative"));
        }
        Ok(plan)
    }
}

/// Receiving half of an open stream. Dropping it tears the stream down.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<StreamFrame>,
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }

    /// Drain every remaining frame until the stream closes.
    pub async fn collect(mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = StreamFrame> + Send + 'static {
        let mut rx = self.rx;
        async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        }
    }
}

/// Releases the stream slot and logs the close exactly once, whichever way
/// the background task ends.
struct StreamGuard {
    slot: StreamSlot,
    caller: String,
    branch_id: String,
    started: Instant,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.slot.release();
        info!(
            caller = %self.caller,
            branch_id = %self.branch_id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stream closed"
        );
    }
}

enum Outcome {
    Finished,
    Cancelled,
}

/// The single write at the end of a generation, plus its idempotency record.
struct Commit {
    engine: BranchEngine,
    cache: IdempotencyCache,
    caller: String,
    branch_id: String,
    append: AppendRequest,
    items: Vec<Item>,
    forked: Option<Branch>,
    key: Option<IdempotencyKey>,
}

struct Committed {
    /// Body of the `final` frame.
    body: String,
    /// Set when this request performed the append; `None` when an earlier
    /// request with the same token already holds the result.
    fresh: Option<AppendOutcome>,
}

impl Commit {
    fn apply(self) -> GraphResult<Committed> {
        let Commit {
            engine,
            cache,
            caller,
            branch_id,
            append,
            mut items,
            forked,
            key,
        } = self;

        if let Some(key) = &key {
            if let Some(record) = cache.lookup(key)? {
                info!(token = %key.token, "same token committed meanwhile; reusing its result");
                return Ok(Committed {
                    body: record.body,
                    fresh: None,
                });
            }
        }

        let outcome = engine.append(&caller, &branch_id, append)?;
        items.push(outcome.item.clone());
        // A fork made by the user message has moved on to the assistant node.
        let branch = match forked {
            Some(mut branch) => {
                branch.tip_node_id = Some(outcome.new_tip.clone());
                branch.version = outcome.version;
                Some(branch)
            }
            None => outcome.branch.clone(),
        };
        let payload = FinalPayload {
            items,
            new_tip: outcome.new_tip.clone(),
            version: outcome.version,
            branch,
        };
        let mut body = serde_json::to_string(&payload)?;

        if let Some(key) = &key {
            let headers = HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]);
            match cache.store(key, 200, &headers, &body) {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(record) = cache.lookup(key)? {
                        body = record.body;
                    }
                }
                Err(e) => warn!(token = %key.token, "failed to store stream result: {}", e),
            }
        }

        Ok(Committed {
            body,
            fresh: Some(outcome),
        })
    }
}

#[derive(Clone)]
pub struct StreamingPipeline {
    engine: BranchEngine,
    idempotency: IdempotencyCache,
    provider: Arc<dyn ModelProvider>,
    generation: GenerationConfig,
    rate_limiter: Arc<dyn RateLimiter>,
    quota: Arc<dyn QuotaService>,
    slots: StreamSlots,
    naming: Option<NamingService>,
    keepalive: Duration,
}

impl StreamingPipeline {
    pub fn new(engine: BranchEngine, provider: Arc<dyn ModelProvider>) -> Self {
        let idempotency = engine.persistence().idempotency();
        Self {
            engine,
            idempotency,
            provider,
            generation: GenerationConfig::default(),
            rate_limiter: Arc::new(Unlimited),
            quota: Arc::new(UnlimitedQuota),
            slots: StreamSlots::new(4),
            naming: None,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation = config;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaService>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_slots(mut self, slots: StreamSlots) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_naming(mut self, naming: NamingService) -> Self {
        self.naming = Some(naming);
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval.max(Duration::from_millis(1));
        self
    }

    pub fn slots(&self) -> &StreamSlots {
        &self.slots
    }

    /// Admit a streaming request and start it.
    ///
    /// `Err` means the request was rejected before any stream existed
    /// (rate limit, no free slot, quota). Everything after that is reported
    /// as frames on the returned receiver.
    pub fn open(&self, request: StreamRequest) -> GraphResult<FrameReceiver> {
        self.rate_limiter.check(&request.caller)?;
        let slot = self.slots.try_acquire(&request.caller)?;
        self.quota.check(&request.caller)?;

        let key = request.idempotency_token.as_ref().map(|token| {
            IdempotencyKey::new(&request.caller, "POST", &request.path, token)
        });

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let guard = StreamGuard {
            slot,
            caller: request.caller.clone(),
            branch_id: request.branch_id.clone(),
            started: Instant::now(),
        };
        let pipeline = self.clone();
        info!(
            caller = %request.caller,
            branch_id = %request.branch_id,
            kind = ?request.kind,
            "stream opened"
        );
        tokio::spawn(async move {
            let _guard = guard;
            match pipeline.serve(&request, key, &tx).await {
                Outcome::Finished => debug!(branch_id = %request.branch_id, "stream finished"),
                Outcome::Cancelled => {
                    info!(branch_id = %request.branch_id, "client went away; generation cancelled")
                }
            }
        });

        Ok(FrameReceiver { rx })
    }

    /// Replay a stored result for a known token, otherwise validate the body
    /// and generate.
    async fn serve(
        &self,
        request: &StreamRequest,
        key: Option<IdempotencyKey>,
        tx: &mpsc::Sender<StreamFrame>,
    ) -> Outcome {
        if let Some(key) = key.clone() {
            let cache = self.idempotency.clone();
            match run_blocking(move || cache.lookup(&key)).await {
                Ok(Some(record)) => {
                    info!(path = %record.path, token = %record.token, "replaying stored stream result");
                    return self.finish(tx, record.body).await;
                }
                Ok(None) => {}
                Err(e) => return self.fail(tx, e).await,
            }
        }

        let plan = match Plan::parse(request.kind, &request.body) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(caller = %request.caller, "rejected stream body: {}", e);
                return self.fail(tx, e).await;
            }
        };

        self.run(request, plan, key, tx).await
    }

    async fn run(
        &self,
        request: &StreamRequest,
        plan: Plan,
        key: Option<IdempotencyKey>,
        tx: &mpsc::Sender<StreamFrame>,
    ) -> Outcome {
        let caller = request.caller.clone();
        let mut items: Vec<Item> = Vec::new();
        let mut forked: Option<Branch> = None;

        // Where the assistant block will be committed.
        let mut target_branch = request.branch_id.clone();
        let mut expected_version = plan.expected_version;
        let mut fork_at_commit = plan.fork_from_node_id.clone();

        let history = if let Some(message) = plan.user_message.clone() {
            let mut append = AppendRequest::new(BlockKind::User, message);
            append.expected_version = plan.expected_version;
            append.fork_from_node_id = plan.fork_from_node_id.clone();
            append.branch_name = plan.branch_name.clone();

            let branch_id = request.branch_id.clone();
            let who = caller.clone();
            let outcome = match self
                .with_engine(move |engine| engine.append(&who, &branch_id, append))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => return self.fail(tx, e).await,
            };
            if let Some(branch) = &outcome.branch {
                self.name_branch(branch, &outcome.item);
            }
            target_branch = outcome.branch_id.clone();
            expected_version = Some(outcome.version);
            fork_at_commit = None;
            forked = outcome.branch.clone();
            items.push(outcome.item.clone());
            if self.emit(tx, StreamFrame::Item(outcome.item)).await.is_err() {
                return Outcome::Cancelled;
            }
            let branch_id = target_branch.clone();
            let who = caller.clone();
            match self
                .with_engine(move |engine| engine.history(&who, &branch_id))
                .await
            {
                Ok(view) => view.items,
                Err(e) => return self.fail(tx, e).await,
            }
        } else if let Some(fork_node) = plan.fork_from_node_id.clone() {
            let branch_id = request.branch_id.clone();
            let who = caller.clone();
            let loaded = self
                .with_engine(move |engine| {
                    // Ownership of the source branch is still required.
                    engine.branch(&who, &branch_id)?;
                    engine.node_history(&who, &fork_node)
                })
                .await;
            match loaded {
                Ok(items) => items,
                Err(e) => return self.fail(tx, e).await,
            }
        } else {
            let branch_id = request.branch_id.clone();
            let who = caller.clone();
            match self
                .with_engine(move |engine| engine.history(&who, &branch_id))
                .await
            {
                Ok(view) => {
                    if let Some(expected) = plan.expected_version {
                        if expected != view.branch.version {
                            return self
                                .fail(
                                    tx,
                                    GraphError::TipMoved {
                                        branch_id: view.branch.id.clone(),
                                        current_tip: view.branch.tip_node_id.clone(),
                                        current_version: view.branch.version,
                                    },
                                )
                                .await;
                        }
                    }
                    // The version observed now is the one the commit must still see.
                    expected_version = Some(view.branch.version);
                    view.items
                }
                Err(e) => return self.fail(tx, e).await,
            }
        };

        let text = match self.generate(tx, &history).await {
            Ok(Some(text)) => text,
            Ok(None) => return Outcome::Cancelled,
            Err(e) => return self.fail(tx, e).await,
        };

        let tokens = estimate_tokens(&json!(text));
        let mut append = AppendRequest::new(BlockKind::Assistant, text)
            .with_model(self.provider.model_name())
            .with_token_count(tokens);
        match fork_at_commit {
            Some(node) => {
                append.fork_from_node_id = Some(node);
                append.branch_name = plan.branch_name.clone();
            }
            None => append.expected_version = expected_version,
        }

        // The commit runs to completion on the blocking pool even if the
        // client disconnects while it is in flight.
        let commit = Commit {
            engine: self.engine.clone(),
            cache: self.idempotency.clone(),
            caller: caller.clone(),
            branch_id: target_branch.clone(),
            append,
            items,
            forked,
            key,
        };
        let committed = match run_blocking(move || commit.apply()).await {
            Ok(committed) => committed,
            Err(e) => return self.fail(tx, e).await,
        };

        if let Some(fresh) = committed.fresh {
            if let Some(branch) = &fresh.branch {
                self.name_branch(branch, &fresh.item);
            }
            self.quota.record(&caller, tokens.max(0) as u64);
            info!(
                branch_id = %target_branch,
                node_id = %fresh.new_tip,
                version = fresh.version,
                "generation committed"
            );
        }

        self.finish(tx, committed.body).await
    }

    /// Forward provider chunks as `delta` frames with periodic keepalives.
    /// `Ok(None)` means the client went away and generation was abandoned.
    async fn generate(
        &self,
        tx: &mpsc::Sender<StreamFrame>,
        history: &[Item],
    ) -> GraphResult<Option<String>> {
        let messages = ChatMessage::from_items(history);
        let mut chunks = self
            .provider
            .stream(&messages, &self.generation)
            .await
            .map_err(|e| GraphError::Internal(format!("generation failed to start: {:#}", e)))?;

        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive,
            self.keepalive,
        );
        let mut text = String::new();

        loop {
            tokio::select! {
                _ = tx.closed() => return Ok(None),
                _ = keepalive.tick() => {
                    if self.emit(tx, StreamFrame::Keepalive).await.is_err() {
                        return Ok(None);
                    }
                }
                next = chunks.next() => match next {
                    Some(Ok(chunk)) => {
                        text.push_str(&chunk);
                        if self.emit(tx, StreamFrame::Delta(chunk)).await.is_err() {
                            return Ok(None);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(GraphError::Internal(format!("generation failed: {:#}", e)));
                    }
                    None => break,
                },
            }
        }

        if text.trim().is_empty() {
            return Err(GraphError::Internal("model returned no content".to_string()));
        }
        Ok(Some(text))
    }

    async fn with_engine<T, F>(&self, f: F) -> GraphResult<T>
    where
        F: FnOnce(BranchEngine) -> GraphResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        run_blocking(move || f(engine)).await
    }

    async fn finish(&self, tx: &mpsc::Sender<StreamFrame>, body: String) -> Outcome {
        match self.emit(tx, StreamFrame::Final(body)).await {
            Ok(()) => Outcome::Finished,
            Err(_) => Outcome::Cancelled,
        }
    }

    async fn emit(
        &self,
        tx: &mpsc::Sender<StreamFrame>,
        frame: StreamFrame,
    ) -> Result<(), mpsc::error::SendError<StreamFrame>> {
        tx.send(frame).await
    }

    async fn fail(&self, tx: &mpsc::Sender<StreamFrame>, err: GraphError) -> Outcome {
        match &err {
            GraphError::Storage(_) | GraphError::Serialization(_) | GraphError::Internal(_) => {
                warn!("stream failed: {}", err)
            }
            _ => debug!(code = err.code(), "stream rejected: {}", err),
        }
        let frame = StreamFrame::error(&err);
        drop(err);
        match self.emit(tx, frame).await {
            Ok(()) => Outcome::Finished,
            Err(_) => Outcome::Cancelled,
        }
    }

    fn name_branch(&self, branch: &Branch, item: &Item) {
        if let Some(naming) = &self.naming {
            naming.spawn_branch_title(branch.id.clone(), item.block.text());
        }
    }
}
