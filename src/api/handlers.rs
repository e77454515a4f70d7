/// API request handlers
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::api::identity::IdentityResolver;
use crate::api::models::*;
use crate::config::AppConfig;
use crate::error::{GraphError, GraphResult};
use crate::graph::{AppendRequest, BranchEngine, StartRequest};
use crate::persistence::idempotency::IdempotencyKey;
use crate::persistence::{run_blocking, IdempotencyCache};
use crate::services::{NamingService, RateLimiter};
use crate::streaming::{StreamKind, StreamRequest, StreamingPipeline};
use crate::types::{BlockKind, IdempotencyRecord};

/// Header carrying the client's idempotency token.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Set on responses served from the idempotency cache.
pub const REPLAY_HEADER: &str = "idempotent-replay";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: BranchEngine,
    pub pipeline: StreamingPipeline,
    pub idempotency: IdempotencyCache,
    pub identity: Arc<dyn IdentityResolver>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub naming: Option<NamingService>,
    pub config: AppConfig,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        engine: BranchEngine,
        pipeline: StreamingPipeline,
        identity: Arc<dyn IdentityResolver>,
        rate_limiter: Arc<dyn RateLimiter>,
        config: AppConfig,
    ) -> Self {
        let idempotency = engine.persistence().idempotency();
        Self {
            engine,
            pipeline,
            idempotency,
            identity,
            rate_limiter,
            naming: None,
            config,
            start_time: Instant::now(),
        }
    }

    pub fn with_naming(mut self, naming: NamingService) -> Self {
        self.naming = Some(naming);
        self
    }

    /// Resolve the caller and count the request against its rate limit.
    fn admit(&self, headers: &HeaderMap) -> GraphResult<String> {
        let caller = self.identity.resolve(headers)?;
        self.rate_limiter.check(&caller)?;
        Ok(caller)
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// POST /graphs/start
pub async fn start_graph(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let request: StartGraphRequest = parse_body(&body)?;

    let engine = state.engine.clone();
    let naming = state.naming.clone();
    let who = caller.clone();
    idempotent(&state, &caller, "POST", &uri, &headers, move || {
        let has_title = request.title.is_some();
        let outcome = engine.start(
            &who,
            StartRequest {
                content: request.content,
                author: request.author.unwrap_or(BlockKind::User),
                model: request.model,
                branch_name: request.branch_name,
                title: request.title,
            },
        )?;
        if !has_title {
            if let Some(naming) = &naming {
                naming.spawn_graph_title(outcome.graph.id.clone(), outcome.item.block.text());
            }
        }
        respond(StatusCode::CREATED, &outcome)
    })
    .await
}

/// POST /branches/:id/append
pub async fn append(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let request: AppendBody = parse_body(&body)?;

    let engine = state.engine.clone();
    let naming = state.naming.clone();
    let who = caller.clone();
    idempotent(&state, &caller, "POST", &uri, &headers, move || {
        let outcome = engine.append(
            &who,
            &branch_id,
            AppendRequest {
                author: request.author,
                content: request.content,
                model: request.model,
                token_count: request.token_count,
                expected_version: request.expected_version,
                fork_from_node_id: request.fork_from_node_id,
                branch_name: request.branch_name,
            },
        )?;
        if let (Some(branch), Some(naming)) = (&outcome.branch, &naming) {
            naming.spawn_branch_title(branch.id.clone(), outcome.item.block.text());
        }
        respond(StatusCode::OK, &outcome)
    })
    .await
}

/// POST /branches/:id/jump
pub async fn jump(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let request: JumpBody = parse_body(&body)?;

    let engine = state.engine.clone();
    let who = caller.clone();
    idempotent(&state, &caller, "POST", &uri, &headers, move || {
        let outcome = engine.jump(
            &who,
            &branch_id,
            &request.to_node_id,
            request.expected_version,
        )?;
        respond(StatusCode::OK, &outcome)
    })
    .await
}

/// POST /branches/:id/replace-tip
pub async fn replace_tip(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let request: ReplaceTipBody = parse_body(&body)?;

    let engine = state.engine.clone();
    let who = caller.clone();
    idempotent(&state, &caller, "POST", &uri, &headers, move || {
        let outcome = engine.replace_tip(
            &who,
            &branch_id,
            request.new_content,
            request.expected_version,
        )?;
        respond(StatusCode::OK, &outcome)
    })
    .await
}

/// POST /branches/:id/inject
pub async fn inject(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let request: InjectBody = parse_body(&body)?;

    let engine = state.engine.clone();
    let who = caller.clone();
    idempotent(&state, &caller, "POST", &uri, &headers, move || {
        let outcome = engine.inject(
            &who,
            &branch_id,
            &request.block_id,
            request.reuse_existing_node,
        )?;
        respond(StatusCode::OK, &outcome)
    })
    .await
}

/// DELETE /nodes/:id
pub async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let request: DeleteNodeBody = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteNodeBody::default()
    } else {
        parse_body(&body)?
    };

    let engine = state.engine.clone();
    let who = caller.clone();
    idempotent(&state, &caller, "DELETE", &uri, &headers, move || {
        let outcome = engine.delete_node(
            &who,
            &node_id,
            request.remove_references.unwrap_or(true),
            &request.expected_versions,
        )?;
        respond(StatusCode::OK, &outcome)
    })
    .await
}

/// GET /graphs/:id
pub async fn get_graph(
    State(state): State<AppState>,
    Path(graph_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let engine = state.engine.clone();
    let view = run_blocking(move || engine.graph(&caller, &graph_id)).await?;
    Ok(Json(view).into_response())
}

/// GET /branches/:id
pub async fn get_branch(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let engine = state.engine.clone();
    let branch = run_blocking(move || engine.branch(&caller, &branch_id)).await?;
    Ok(Json(serde_json::json!({ "branch": branch })).into_response())
}

/// GET /branches/:id/history
pub async fn branch_history(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let caller = state.admit(&headers)?;
    let engine = state.engine.clone();
    let view = run_blocking(move || engine.history(&caller, &branch_id)).await?;
    Ok(Json(view).into_response())
}

/// POST /branches/:id/generate/stream
pub async fn generate_stream(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    open_stream(&state, branch_id, StreamKind::Generate, &uri, &headers, body)
}

/// POST /branches/:id/send/stream
pub async fn send_stream(
    State(state): State<AppState>,
    Path(branch_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    open_stream(&state, branch_id, StreamKind::Send, &uri, &headers, body)
}

fn open_stream(
    state: &AppState,
    branch_id: String,
    kind: StreamKind,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    // Rate limiting for streams happens inside the pipeline.
    let caller = state.identity.resolve(headers)?;
    let frames = state.pipeline.open(StreamRequest {
        caller,
        branch_id,
        kind,
        path: uri.path().to_string(),
        idempotency_token: idempotency_token(headers),
        body: body.to_vec(),
    })?;

    let events = frames.into_stream().map(|frame| {
        Ok::<_, Infallible>(
            Event::default()
                .event(frame.event_name())
                .data(frame.data()),
        )
    });
    Ok(Sse::new(events).into_response())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> GraphResult<T> {
    serde_json::from_slice(body).map_err(|e| GraphError::validation(format!("invalid request body: {}", e)))
}

fn idempotency_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Serialized response body with its status.
struct Rendered {
    status: StatusCode,
    body: String,
}

fn respond<T: Serialize>(status: StatusCode, value: &T) -> GraphResult<Rendered> {
    Ok(Rendered {
        status,
        body: serde_json::to_string(value)?,
    })
}

/// What an idempotent mutation ended up sending.
enum Served {
    Fresh(Rendered),
    Replay(IdempotencyRecord),
}

/// Run a mutation at most once per idempotency token.
///
/// A stored response is replayed byte-for-byte. Only successful responses
/// are stored, so a failed request can be retried with the same token. When
/// a racing request with the same token stored first, its response is the
/// one returned.
async fn idempotent<F>(
    state: &AppState,
    caller: &str,
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    mutation: F,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> GraphResult<Rendered> + Send + 'static,
{
    let key = idempotency_token(headers)
        .map(|token| IdempotencyKey::new(caller, method, uri.path(), token));
    let cache = state.idempotency.clone();

    let served = run_blocking(move || {
        if let Some(key) = &key {
            if let Some(record) = cache.lookup(key)? {
                info!(path = %key.path, token = %key.token, "replaying stored response");
                return Ok(Served::Replay(record));
            }
        }

        let rendered = mutation()?;
        if let Some(key) = &key {
            if rendered.status.is_success() {
                let stored_headers = HashMap::from([(
                    header::CONTENT_TYPE.as_str().to_string(),
                    "application/json".to_string(),
                )]);
                let stored =
                    cache.store(key, rendered.status.as_u16(), &stored_headers, &rendered.body)?;
                if !stored {
                    if let Some(record) = cache.lookup(key)? {
                        return Ok(Served::Replay(record));
                    }
                }
            } else {
                debug!(status = %rendered.status, "not caching unsuccessful response");
            }
        }
        Ok(Served::Fresh(rendered))
    })
    .await?;

    Ok(match served {
        Served::Fresh(rendered) => json_response(rendered.status, rendered.body),
        Served::Replay(record) => replay(record),
    })
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

fn replay(record: IdempotencyRecord) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
    let mut response = (status, record.body).into_response();
    let response_headers = response.headers_mut();
    for (name, value) in &record.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response_headers.insert(name, value);
        }
    }
    response_headers.insert(
        HeaderName::from_static(REPLAY_HEADER),
        HeaderValue::from_static("true"),
    );
    response
}
