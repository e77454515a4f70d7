//! Named frames sent over a generation stream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::GraphError;
use crate::types::{Branch, Item};

/// Payload of the `final` frame, also the body stored for idempotent replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalPayload {
    pub items: Vec<Item>,
    pub new_tip: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// A block committed before generation (the user message of a send).
    Item(Item),
    Delta(String),
    /// Serialized [`FinalPayload`], replayed verbatim on idempotent retries.
    Final(String),
    Error {
        code: String,
        message: String,
        details: Option<JsonValue>,
    },
    Keepalive,
}

impl StreamFrame {
    pub fn error(err: &GraphError) -> Self {
        StreamFrame::Error {
            code: err.code().to_string(),
            message: err.public_message(),
            details: err.details(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            StreamFrame::Item(_) => "item",
            StreamFrame::Delta(_) => "delta",
            StreamFrame::Final(_) => "final",
            StreamFrame::Error { .. } => "error",
            StreamFrame::Keepalive => "keepalive",
        }
    }

    /// JSON data carried by the frame.
    pub fn data(&self) -> String {
        match self {
            StreamFrame::Item(item) => json!({ "item": item }).to_string(),
            StreamFrame::Delta(text) => json!({ "text": text }).to_string(),
            StreamFrame::Final(body) => body.clone(),
            StreamFrame::Error {
                code,
                message,
                details,
            } => {
                let mut body = json!({ "error": message, "code": code });
                if let Some(details) = details {
                    body["details"] = details.clone();
                }
                body.to_string()
            }
            StreamFrame::Keepalive => "{}".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Final(_) | StreamFrame::Error { .. })
    }
}
