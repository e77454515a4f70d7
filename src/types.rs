use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who authored a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    User,
    Assistant,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::User => "user",
            BlockKind::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Some(BlockKind::User),
            "assistant" => Some(BlockKind::Assistant),
            _ => None,
        }
    }
}

/// Relation carried by a [`BlockEdge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeRelation {
    /// Conversation order. Forms the DAG backbone.
    Follows,
    /// Non-ordering cross-link between nodes.
    References,
}

impl EdgeRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeRelation::Follows => "follows",
            EdgeRelation::References => "references",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "follows" => Some(EdgeRelation::Follows),
            "references" => Some(EdgeRelation::References),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Immutable unit of content. A block is never edited; replacing content
/// always produces a new block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBlock {
    pub id: String,
    pub owner_id: String,
    pub kind: BlockKind,
    pub content: serde_json::Value,
    pub model: Option<String>,
    pub token_count: Option<i64>,
    pub checksum: Option<String>,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

impl ContextBlock {
    /// Plain-text rendering of the payload, used when building prompts.
    ///
    /// Strings are returned as-is, objects with a `text` field yield that
    /// field, and anything else falls back to its JSON encoding.
    pub fn text(&self) -> String {
        content_text(&self.content)
    }
}

pub fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => match map.get("text") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => content.to_string(),
        },
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub graph_id: String,
    pub block_id: String,
    pub hidden_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl GraphNode {
    pub fn is_hidden(&self) -> bool {
        self.hidden_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEdge {
    pub id: String,
    pub graph_id: String,
    pub parent_node_id: String,
    pub child_node_id: String,
    pub relation: EdgeRelation,
    pub ord: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BlockEdge {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub graph_id: String,
    pub name: String,
    pub title: Option<String>,
    pub root_node_id: String,
    pub tip_node_id: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// A placed message: the node plus the block it wraps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub node_id: String,
    pub block: ContextBlock,
}

/// Memoized response of a mutating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub caller_id: String,
    pub method: String,
    pub path: String,
    pub token: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
