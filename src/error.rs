//! Error taxonomy shared by the graph store, the mutation engine and the
//! streaming pipeline.

use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("caller identity missing or invalid: {0}")]
    Unauthenticated(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Forbidden(String),

    #[error("branch tip moved (current tip {current_tip:?}, version {current_version})")]
    TipMoved {
        branch_id: String,
        current_tip: Option<String>,
        current_version: i64,
    },

    #[error("node '{node_id}' is not reachable from the root of branch '{branch_id}'")]
    InvalidReachability { branch_id: String, node_id: String },

    #[error("node '{node_id}' is the root of branch(es) {branch_ids:?}")]
    CannotDeleteBranchRoot {
        node_id: String,
        branch_ids: Vec<String>,
    },

    #[error("token quota exceeded: used {used} of {limit}")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

impl GraphError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        GraphError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GraphError::Validation(message.into())
    }

    /// Stable machine-readable code carried in error bodies and frames.
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::Validation(_) => "VALIDATION_FAILED",
            GraphError::Unauthenticated(_) => "UNAUTHENTICATED",
            GraphError::NotFound { .. } => "NOT_FOUND",
            GraphError::Forbidden(_) => "FORBIDDEN",
            GraphError::TipMoved { .. } => "CONFLICT_TIP_MOVED",
            GraphError::InvalidReachability { .. } => "INVALID_REACHABILITY",
            GraphError::CannotDeleteBranchRoot { .. } => "CANNOT_DELETE_BRANCH_ROOT",
            GraphError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            GraphError::RateLimited { .. } => "RATE_LIMITED",
            GraphError::Storage(_) | GraphError::Serialization(_) | GraphError::Internal(_) => {
                "INTERNAL"
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GraphError::Validation(_) => 400,
            GraphError::Unauthenticated(_) => 401,
            GraphError::QuotaExceeded { .. } => 402,
            GraphError::Forbidden(_) => 403,
            GraphError::NotFound { .. } => 404,
            GraphError::TipMoved { .. } | GraphError::CannotDeleteBranchRoot { .. } => 409,
            GraphError::InvalidReachability { .. } => 422,
            GraphError::RateLimited { .. } => 429,
            GraphError::Storage(_) | GraphError::Serialization(_) | GraphError::Internal(_) => 500,
        }
    }

    /// Structured details a client can act on, e.g. the fresh tip and
    /// version to re-issue a request with after a conflict.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GraphError::TipMoved {
                branch_id,
                current_tip,
                current_version,
            } => Some(json!({
                "branchId": branch_id,
                "currentTip": current_tip,
                "currentVersion": current_version,
            })),
            GraphError::InvalidReachability { branch_id, node_id } => Some(json!({
                "branchId": branch_id,
                "nodeId": node_id,
            })),
            GraphError::CannotDeleteBranchRoot {
                node_id,
                branch_ids,
            } => Some(json!({
                "nodeId": node_id,
                "branchIds": branch_ids,
            })),
            GraphError::QuotaExceeded { used, limit } => Some(json!({
                "used": used,
                "limit": limit,
            })),
            GraphError::RateLimited { retry_after_secs } => Some(json!({
                "retryAfterSecs": retry_after_secs,
            })),
            _ => None,
        }
    }

    /// Message safe to hand to clients. Storage internals stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            GraphError::Storage(_) | GraphError::Serialization(_) | GraphError::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for GraphError {
    fn from(err: anyhow::Error) -> Self {
        GraphError::Internal(format!("{:#}", err))
    }
}
