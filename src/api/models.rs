/// API request and response models
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::error::GraphError;
use crate::types::BlockKind;

/// Request to start a new conversation graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGraphRequest {
    /// First message of the conversation
    pub content: JsonValue,
    #[serde(default)]
    pub author: Option<BlockKind>,
    #[serde(default)]
    pub model: Option<String>,
    /// Name of the initial branch (defaults to "main")
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendBody {
    pub author: BlockKind,
    pub content: JsonValue,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub token_count: Option<i64>,
    #[serde(default)]
    pub expected_version: Option<i64>,
    #[serde(default)]
    pub fork_from_node_id: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpBody {
    pub to_node_id: String,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceTipBody {
    pub new_content: JsonValue,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectBody {
    pub block_id: String,
    #[serde(default)]
    pub reuse_existing_node: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNodeBody {
    #[serde(default)]
    pub remove_references: Option<bool>,
    /// Expected version per branch id for branches tipped at the node
    #[serde(default)]
    pub expected_versions: HashMap<String, i64>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<&GraphError> for ErrorResponse {
    fn from(err: &GraphError) -> Self {
        let response = ErrorResponse::new(err.code(), err.public_message());
        match err.details() {
            Some(details) => response.with_details(details),
            None => response,
        }
    }
}

/// Handler error rendered as the JSON error envelope.
#[derive(Debug)]
pub struct ApiError(pub GraphError);

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), "request failed: {}", self.0);
        } else {
            tracing::debug!(code = self.0.code(), "request rejected: {}", self.0);
        }
        let mut response = (status, Json(ErrorResponse::from(&self.0))).into_response();
        if let GraphError::RateLimited { retry_after_secs } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_body_accepts_camel_case() {
        let body: AppendBody = serde_json::from_value(json!({
            "author": "assistant",
            "content": "Hello",
            "expectedVersion": 0,
            "forkFromNodeId": "n1"
        }))
        .unwrap();
        assert_eq!(body.author, BlockKind::Assistant);
        assert_eq!(body.expected_version, Some(0));
        assert_eq!(body.fork_from_node_id.as_deref(), Some("n1"));
    }

    #[test]
    fn error_response_skips_missing_details() {
        let value = serde_json::to_value(ErrorResponse::new("NOT_FOUND", "missing")).unwrap();
        assert!(value.get("details").is_none());
        assert_eq!(value["code"], "NOT_FOUND");
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError(GraphError::RateLimited {
            retry_after_secs: 7,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }
}
