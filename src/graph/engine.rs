//! Branch mutation engine.
//!
//! Every mutation runs inside one transaction and is composed from
//! [`Store`] primitives plus [`advance_tip`]. Ownership, existence and
//! stale-version checks all happen before the first write, so a rejected
//! request leaves the graph untouched.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::info;
use uuid::Uuid;

use super::cas::advance_tip;
use super::traverse::FollowsAdjacency;
use crate::error::{GraphError, GraphResult};
use crate::persistence::{Persistence, Store};
use crate::types::{
    content_text, BlockEdge, BlockKind, Branch, ContextBlock, EdgeRelation, Graph, GraphNode,
    Item,
};

/// Name given to the branch created by [`BranchEngine::start`].
pub const DEFAULT_BRANCH_NAME: &str = "main";

/// Default bound for graph walks.
pub const DEFAULT_MAX_TRAVERSAL_STEPS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub content: JsonValue,
    pub author: BlockKind,
    pub model: Option<String>,
    pub branch_name: Option<String>,
    pub title: Option<String>,
}

impl StartRequest {
    pub fn user(content: impl Into<JsonValue>) -> Self {
        Self {
            content: content.into(),
            author: BlockKind::User,
            model: None,
            branch_name: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub graph: Graph,
    pub branch: Branch,
    pub item: Item,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub author: BlockKind,
    pub content: JsonValue,
    pub model: Option<String>,
    pub token_count: Option<i64>,
    pub expected_version: Option<i64>,
    pub fork_from_node_id: Option<String>,
    pub branch_name: Option<String>,
}

impl AppendRequest {
    pub fn new(author: BlockKind, content: impl Into<JsonValue>) -> Self {
        Self {
            author,
            content: content.into(),
            model: None,
            token_count: None,
            expected_version: None,
            fork_from_node_id: None,
            branch_name: None,
        }
    }

    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_fork_from(mut self, node_id: impl Into<String>) -> Self {
        self.fork_from_node_id = Some(node_id.into());
        self
    }

    pub fn with_branch_name(mut self, name: impl Into<String>) -> Self {
        self.branch_name = Some(name.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_token_count(mut self, tokens: i64) -> Self {
        self.token_count = Some(tokens);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendOutcome {
    pub item: Item,
    pub new_tip: String,
    pub version: i64,
    pub branch_id: String,
    /// Descriptor of the branch created by a fork, absent for plain appends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpOutcome {
    pub branch: Branch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOutcome {
    pub item: Item,
    pub new_tip: String,
    pub version: i64,
    pub replaced_node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetargetedTip {
    pub branch_id: String,
    pub old_tip: String,
    pub new_tip: Option<String>,
    pub new_version: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAffected {
    pub deleted_edges: usize,
    pub retargeted_tips: Vec<RetargetedTip>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub node_id: String,
    pub hidden_at: DateTime<Utc>,
    pub affected: DeleteAffected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectedReference {
    pub node_id: String,
    pub edge_id: String,
    pub reused_node: bool,
    pub block: ContextBlock,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectOutcome {
    pub reference: InjectedReference,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphView {
    pub graph: Graph,
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub branch: Branch,
    pub items: Vec<Item>,
}

/// Entry point for every graph mutation.
#[derive(Clone)]
pub struct BranchEngine {
    persistence: Persistence,
    max_traversal_steps: usize,
}

impl BranchEngine {
    pub fn new(persistence: Persistence) -> Self {
        Self {
            persistence,
            max_traversal_steps: DEFAULT_MAX_TRAVERSAL_STEPS,
        }
    }

    pub fn with_max_traversal_steps(mut self, steps: usize) -> Self {
        self.max_traversal_steps = steps.max(1);
        self
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Create a graph together with its initial branch (root = tip = first node, version 0).
    pub fn start(&self, caller: &str, request: StartRequest) -> GraphResult<StartOutcome> {
        validate_content(&request.content)?;
        let branch_name = request
            .branch_name
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH_NAME.to_string());
        validate_branch_name(&branch_name)?;
        let now = Utc::now();

        let outcome = self.persistence.transaction(|store| {
            let graph = Graph {
                id: new_id(),
                owner_id: caller.to_string(),
                title: request.title.clone(),
                created_at: now,
                last_activity_at: now,
            };
            store.insert_graph(&graph)?;

            let item = place_block(
                store,
                caller,
                &graph.id,
                request.author,
                &request.content,
                request.model.clone(),
                None,
                now,
            )?;

            let branch = Branch {
                id: new_id(),
                graph_id: graph.id.clone(),
                name: branch_name.clone(),
                title: None,
                root_node_id: item.node_id.clone(),
                tip_node_id: Some(item.node_id.clone()),
                version: 0,
                created_at: now,
            };
            store.insert_branch(&branch)?;

            Ok(StartOutcome {
                graph,
                branch,
                item,
            })
        })?;

        info!(
            graph_id = %outcome.graph.id,
            branch_id = %outcome.branch.id,
            "started graph"
        );
        Ok(outcome)
    }

    /// Append a block after the branch tip, or fork a new branch at
    /// `fork_from_node_id` and append there. Fork and first write commit
    /// together or not at all.
    pub fn append(
        &self,
        caller: &str,
        branch_id: &str,
        request: AppendRequest,
    ) -> GraphResult<AppendOutcome> {
        validate_content(&request.content)?;
        if let Some(name) = &request.branch_name {
            validate_branch_name(name)?;
        }
        let now = Utc::now();

        let outcome = self.persistence.transaction(|store| {
            let (branch, graph) = load_owned_branch(store, caller, branch_id)?;

            match &request.fork_from_node_id {
                None => {
                    ensure_expected_version(&branch, request.expected_version)?;
                    let expected = request.expected_version.unwrap_or(branch.version);

                    let item = place_block(
                        store,
                        caller,
                        &graph.id,
                        request.author,
                        &request.content,
                        request.model.clone(),
                        request.token_count,
                        now,
                    )?;
                    if let Some(tip) = &branch.tip_node_id {
                        link_follows(store, &graph.id, tip, &item.node_id, 0, now)?;
                    }
                    let version = advance_tip(store, &branch.id, expected, Some(&item.node_id))?;
                    store.touch_graph(&graph.id, &now)?;

                    Ok(AppendOutcome {
                        new_tip: item.node_id.clone(),
                        item,
                        version,
                        branch_id: branch.id,
                        branch: None,
                    })
                }
                Some(fork_node_id) => {
                    let fork_node = load_visible_node(store, fork_node_id)?;
                    if fork_node.graph_id != graph.id {
                        return Err(GraphError::validation(format!(
                            "node '{}' does not belong to graph '{}'",
                            fork_node_id, graph.id
                        )));
                    }

                    let name = match &request.branch_name {
                        Some(name) => name.clone(),
                        None => generated_fork_name(),
                    };
                    if store.find_branch_by_name(&graph.id, &name)?.is_some() {
                        return Err(GraphError::validation(format!(
                            "branch name '{}' already exists in graph",
                            name
                        )));
                    }

                    let mut fork = Branch {
                        id: new_id(),
                        graph_id: graph.id.clone(),
                        name,
                        title: None,
                        root_node_id: fork_node.id.clone(),
                        tip_node_id: Some(fork_node.id.clone()),
                        version: 0,
                        created_at: now,
                    };
                    store.insert_branch(&fork)?;

                    let item = place_block(
                        store,
                        caller,
                        &graph.id,
                        request.author,
                        &request.content,
                        request.model.clone(),
                        request.token_count,
                        now,
                    )?;
                    link_follows(store, &graph.id, &fork_node.id, &item.node_id, 0, now)?;
                    let version = advance_tip(store, &fork.id, 0, Some(&item.node_id))?;
                    store.touch_graph(&graph.id, &now)?;

                    fork.tip_node_id = Some(item.node_id.clone());
                    fork.version = version;

                    Ok(AppendOutcome {
                        new_tip: item.node_id.clone(),
                        item,
                        version,
                        branch_id: fork.id.clone(),
                        branch: Some(fork),
                    })
                }
            }
        })?;

        info!(
            branch_id = %outcome.branch_id,
            node_id = %outcome.new_tip,
            version = outcome.version,
            forked = outcome.branch.is_some(),
            "appended to branch"
        );
        Ok(outcome)
    }

    /// Move the tip to a node reachable from the branch root. Creates nothing.
    pub fn jump(
        &self,
        caller: &str,
        branch_id: &str,
        to_node_id: &str,
        expected_version: Option<i64>,
    ) -> GraphResult<JumpOutcome> {
        let now = Utc::now();
        let max_steps = self.max_traversal_steps;

        let outcome = self.persistence.transaction(|store| {
            let (mut branch, graph) = load_owned_branch(store, caller, branch_id)?;
            ensure_expected_version(&branch, expected_version)?;

            let target = load_visible_node(store, to_node_id)?;
            if target.graph_id != graph.id {
                return Err(GraphError::not_found("node", to_node_id));
            }

            let adjacency =
                FollowsAdjacency::from_edges(&store.active_edges(&graph.id, EdgeRelation::Follows)?);
            if !adjacency.is_reachable(&branch.root_node_id, to_node_id, max_steps)? {
                return Err(GraphError::InvalidReachability {
                    branch_id: branch.id.clone(),
                    node_id: to_node_id.to_string(),
                });
            }

            let expected = expected_version.unwrap_or(branch.version);
            let version = advance_tip(store, &branch.id, expected, Some(to_node_id))?;
            store.touch_graph(&graph.id, &now)?;

            branch.tip_node_id = Some(to_node_id.to_string());
            branch.version = version;
            Ok(JumpOutcome { branch })
        })?;

        info!(
            branch_id = %outcome.branch.id,
            node_id = to_node_id,
            version = outcome.branch.version,
            "jumped branch tip"
        );
        Ok(outcome)
    }

    /// Splice a new block in place of the tip, keeping the tip's parent and
    /// ordinal. The old incoming edge is soft-deleted; the old node stays.
    pub fn replace_tip(
        &self,
        caller: &str,
        branch_id: &str,
        new_content: JsonValue,
        expected_version: Option<i64>,
    ) -> GraphResult<ReplaceOutcome> {
        validate_content(&new_content)?;
        let now = Utc::now();

        let outcome = self.persistence.transaction(|store| {
            let (branch, graph) = load_owned_branch(store, caller, branch_id)?;
            ensure_expected_version(&branch, expected_version)?;

            let tip = branch
                .tip_node_id
                .clone()
                .ok_or_else(|| GraphError::validation("branch has no tip to replace"))?;
            if tip == branch.root_node_id {
                return Err(GraphError::validation("cannot replace the root of a branch"));
            }
            let incoming = store.active_incoming_follows(&tip)?.ok_or_else(|| {
                GraphError::validation("tip has no incoming edge; replacing a root is not allowed")
            })?;

            let tip_node = store
                .get_node(&tip)?
                .ok_or_else(|| GraphError::not_found("node", tip.clone()))?;
            let old_block = store
                .get_block(&tip_node.block_id)?
                .ok_or_else(|| GraphError::not_found("block", tip_node.block_id.clone()))?;

            store.soft_delete_edge(&incoming.id, &now)?;
            let item = place_block(
                store,
                caller,
                &graph.id,
                old_block.kind,
                &new_content,
                None,
                None,
                now,
            )?;
            link_follows(
                store,
                &graph.id,
                &incoming.parent_node_id,
                &item.node_id,
                incoming.ord,
                now,
            )?;
            let expected = expected_version.unwrap_or(branch.version);
            let version = advance_tip(store, &branch.id, expected, Some(&item.node_id))?;
            store.touch_graph(&graph.id, &now)?;

            Ok(ReplaceOutcome {
                new_tip: item.node_id.clone(),
                item,
                version,
                replaced_node_id: tip,
            })
        })?;

        info!(
            branch_id,
            replaced = %outcome.replaced_node_id,
            node_id = %outcome.new_tip,
            version = outcome.version,
            "replaced branch tip"
        );
        Ok(outcome)
    }

    /// Soft-delete a node, retargeting every branch tipped at it to its parent.
    ///
    /// A single failed CAS aborts the whole delete; no branch is partially
    /// retargeted.
    pub fn delete_node(
        &self,
        caller: &str,
        node_id: &str,
        remove_references: bool,
        expected_versions: &HashMap<String, i64>,
    ) -> GraphResult<DeleteOutcome> {
        let now = Utc::now();

        let outcome = self.persistence.transaction(|store| {
            let node = load_visible_node(store, node_id)?;
            load_owned_graph(store, caller, &node.graph_id)?;

            let rooted = store.branches_rooted_at(node_id)?;
            if !rooted.is_empty() {
                return Err(GraphError::CannotDeleteBranchRoot {
                    node_id: node_id.to_string(),
                    branch_ids: rooted,
                });
            }

            let parent = store
                .active_incoming_follows(node_id)?
                .map(|edge| edge.parent_node_id);
            let tipped = store.branches_tipped_at(node_id)?;
            for branch in &tipped {
                ensure_expected_version(branch, expected_versions.get(&branch.id).copied())?;
            }

            let mut retargeted = Vec::with_capacity(tipped.len());
            for branch in tipped {
                let expected = expected_versions
                    .get(&branch.id)
                    .copied()
                    .unwrap_or(branch.version);
                let new_version = advance_tip(store, &branch.id, expected, parent.as_deref())?;
                retargeted.push(RetargetedTip {
                    branch_id: branch.id,
                    old_tip: node_id.to_string(),
                    new_tip: parent.clone(),
                    new_version,
                });
            }

            store.hide_node(node_id, &now)?;
            let deleted_edges = if remove_references {
                store.soft_delete_references_touching(node_id, &now)?
            } else {
                0
            };
            store.touch_graph(&node.graph_id, &now)?;

            Ok(DeleteOutcome {
                node_id: node_id.to_string(),
                hidden_at: now,
                affected: DeleteAffected {
                    deleted_edges,
                    retargeted_tips: retargeted,
                },
            })
        })?;

        info!(
            node_id,
            retargeted = outcome.affected.retargeted_tips.len(),
            deleted_edges = outcome.affected.deleted_edges,
            "hid node"
        );
        Ok(outcome)
    }

    /// Link an existing block into the graph as a `references` edge from the
    /// tip. Tip and version are left alone.
    pub fn inject(
        &self,
        caller: &str,
        branch_id: &str,
        block_id: &str,
        reuse_existing_node: bool,
    ) -> GraphResult<InjectOutcome> {
        let now = Utc::now();

        let outcome = self.persistence.transaction(|store| {
            let (branch, graph) = load_owned_branch(store, caller, branch_id)?;
            let block = store
                .get_block(block_id)?
                .ok_or_else(|| GraphError::not_found("block", block_id))?;
            if block.owner_id != caller {
                return Err(GraphError::Forbidden(format!(
                    "block '{}' is not owned by caller",
                    block_id
                )));
            }
            let tip = branch
                .tip_node_id
                .clone()
                .ok_or_else(|| GraphError::validation("branch has no tip to reference from"))?;

            let existing = if reuse_existing_node {
                store.find_visible_node_for_block(&graph.id, block_id)?
            } else {
                None
            };
            if existing.as_ref().is_some_and(|node| node.id == tip) {
                return Err(GraphError::validation("a node cannot reference itself"));
            }

            let (node_id, reused_node) = match existing {
                Some(node) => (node.id, true),
                None => {
                    let node = GraphNode {
                        id: new_id(),
                        graph_id: graph.id.clone(),
                        block_id: block.id.clone(),
                        hidden_at: None,
                        created_at: now,
                    };
                    store.insert_node(&node)?;
                    (node.id, false)
                }
            };

            let edge = BlockEdge {
                id: new_id(),
                graph_id: graph.id.clone(),
                parent_node_id: tip,
                child_node_id: node_id.clone(),
                relation: EdgeRelation::References,
                ord: 0,
                created_at: now,
                deleted_at: None,
            };
            store.insert_edge(&edge)?;
            store.touch_graph(&graph.id, &now)?;

            Ok(InjectOutcome {
                reference: InjectedReference {
                    node_id,
                    edge_id: edge.id,
                    reused_node,
                    block,
                },
            })
        })?;

        info!(
            branch_id,
            node_id = %outcome.reference.node_id,
            reused = outcome.reference.reused_node,
            "injected reference"
        );
        Ok(outcome)
    }

    // ---------- Read views ----------

    pub fn graph(&self, caller: &str, graph_id: &str) -> GraphResult<GraphView> {
        self.persistence.read(|store| {
            let graph = load_owned_graph(store, caller, graph_id)?;
            let branches = store.list_branches(&graph.id)?;
            Ok(GraphView { graph, branches })
        })
    }

    pub fn branch(&self, caller: &str, branch_id: &str) -> GraphResult<Branch> {
        self.persistence
            .read(|store| load_owned_branch(store, caller, branch_id).map(|(branch, _)| branch))
    }

    /// Visible items from the top of the conversation down to the branch
    /// tip, including history shared with the branch it was forked from.
    pub fn history(&self, caller: &str, branch_id: &str) -> GraphResult<HistoryView> {
        let max_steps = self.max_traversal_steps;
        self.persistence.read(|store| {
            let (branch, graph) = load_owned_branch(store, caller, branch_id)?;
            let items = match &branch.tip_node_id {
                Some(tip) => visible_path(store, &graph.id, tip, max_steps)?,
                None => Vec::new(),
            };
            Ok(HistoryView { branch, items })
        })
    }

    /// Visible items from the top of the conversation down to `node_id`.
    pub fn node_history(&self, caller: &str, node_id: &str) -> GraphResult<Vec<Item>> {
        let max_steps = self.max_traversal_steps;
        self.persistence.read(|store| {
            let node = load_visible_node(store, node_id)?;
            load_owned_graph(store, caller, &node.graph_id)?;
            visible_path(store, &node.graph_id, node_id, max_steps)
        })
    }

    /// Best-effort title update used by the naming service.
    pub fn set_graph_title(&self, graph_id: &str, title: &str) -> GraphResult<()> {
        self.persistence
            .read(|store| store.set_graph_title(graph_id, title).map(|_| ()))
    }

    /// Best-effort title update used by the naming service.
    pub fn set_branch_title(&self, branch_id: &str, title: &str) -> GraphResult<()> {
        self.persistence
            .read(|store| store.set_branch_title(branch_id, title).map(|_| ()))
    }
}

fn load_owned_graph(store: &Store<'_>, caller: &str, graph_id: &str) -> GraphResult<Graph> {
    let graph = store
        .get_graph(graph_id)?
        .ok_or_else(|| GraphError::not_found("graph", graph_id))?;
    if graph.owner_id != caller {
        return Err(GraphError::Forbidden(format!(
            "graph '{}' is not owned by caller",
            graph_id
        )));
    }
    Ok(graph)
}

fn load_owned_branch(
    store: &Store<'_>,
    caller: &str,
    branch_id: &str,
) -> GraphResult<(Branch, Graph)> {
    let branch = store
        .get_branch(branch_id)?
        .ok_or_else(|| GraphError::not_found("branch", branch_id))?;
    let graph = load_owned_graph(store, caller, &branch.graph_id)?;
    Ok((branch, graph))
}

fn load_visible_node(store: &Store<'_>, node_id: &str) -> GraphResult<GraphNode> {
    match store.get_node(node_id)? {
        Some(node) if !node.is_hidden() => Ok(node),
        _ => Err(GraphError::not_found("node", node_id)),
    }
}

fn visible_path(
    store: &Store<'_>,
    graph_id: &str,
    tip: &str,
    max_steps: usize,
) -> GraphResult<Vec<Item>> {
    let adjacency =
        FollowsAdjacency::from_edges(&store.active_edges(graph_id, EdgeRelation::Follows)?);
    let mut items = Vec::new();
    for node_id in adjacency.ancestry(tip, max_steps)? {
        let Some(node) = store.get_node(&node_id)? else {
            continue;
        };
        if node.is_hidden() {
            continue;
        }
        let block = store
            .get_block(&node.block_id)?
            .ok_or_else(|| GraphError::not_found("block", node.block_id.clone()))?;
        items.push(Item {
            node_id: node.id,
            block,
        });
    }
    Ok(items)
}

fn ensure_expected_version(branch: &Branch, expected: Option<i64>) -> GraphResult<()> {
    match expected {
        Some(expected) if expected != branch.version => Err(GraphError::TipMoved {
            branch_id: branch.id.clone(),
            current_tip: branch.tip_node_id.clone(),
            current_version: branch.version,
        }),
        _ => Ok(()),
    }
}

/// Create (or reuse, by checksum) a block and wrap it in a fresh node.
#[allow(clippy::too_many_arguments)]
fn place_block(
    store: &Store<'_>,
    owner: &str,
    graph_id: &str,
    kind: BlockKind,
    content: &JsonValue,
    model: Option<String>,
    token_count: Option<i64>,
    now: DateTime<Utc>,
) -> GraphResult<Item> {
    let checksum = content_checksum(owner, kind, model.as_deref(), content);
    let block = match store.find_block_by_checksum(&checksum)? {
        Some(existing) => existing,
        None => {
            let block = ContextBlock {
                id: new_id(),
                owner_id: owner.to_string(),
                kind,
                content: content.clone(),
                model,
                token_count: token_count.or_else(|| Some(estimate_tokens(content))),
                checksum: Some(checksum),
                visible: true,
                created_at: now,
            };
            store.insert_block(&block)?;
            block
        }
    };

    let node = GraphNode {
        id: new_id(),
        graph_id: graph_id.to_string(),
        block_id: block.id.clone(),
        hidden_at: None,
        created_at: now,
    };
    store.insert_node(&node)?;

    Ok(Item {
        node_id: node.id,
        block,
    })
}

fn link_follows(
    store: &Store<'_>,
    graph_id: &str,
    parent: &str,
    child: &str,
    ord: i64,
    now: DateTime<Utc>,
) -> GraphResult<BlockEdge> {
    if store.active_incoming_follows(child)?.is_some() {
        return Err(GraphError::Internal(format!(
            "node '{}' already has an active parent",
            child
        )));
    }
    let edge = BlockEdge {
        id: new_id(),
        graph_id: graph_id.to_string(),
        parent_node_id: parent.to_string(),
        child_node_id: child.to_string(),
        relation: EdgeRelation::Follows,
        ord,
        created_at: now,
        deleted_at: None,
    };
    store.insert_edge(&edge)?;
    Ok(edge)
}

/// Content address of a block: owner, kind, model and canonical JSON payload.
pub fn content_checksum(
    owner: &str,
    kind: BlockKind,
    model: Option<&str>,
    content: &JsonValue,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(owner.as_bytes());
    hasher.update(&[0]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(model.unwrap_or_default().as_bytes());
    hasher.update(&[0]);
    hasher.update(content.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Whitespace token estimate used when the author does not supply a count.
pub fn estimate_tokens(content: &JsonValue) -> i64 {
    content_text(content).split_whitespace().count() as i64
}

pub fn validate_content(content: &JsonValue) -> GraphResult<()> {
    match content {
        JsonValue::Null => Err(GraphError::validation("content is required")),
        JsonValue::String(s) if s.trim().is_empty() => {
            Err(GraphError::validation("content must not be empty"))
        }
        JsonValue::Object(map) if map.is_empty() => {
            Err(GraphError::validation("content must not be empty"))
        }
        JsonValue::Array(items) if items.is_empty() => {
            Err(GraphError::validation("content must not be empty"))
        }
        _ => Ok(()),
    }
}

pub fn validate_branch_name(name: &str) -> GraphResult<()> {
    static BRANCH_NAME: OnceLock<Regex> = OnceLock::new();
    let pattern = BRANCH_NAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _./-]{0,63}$").expect("branch name pattern compiles")
    });
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(GraphError::validation(format!(
            "invalid branch name '{}': use up to 64 letters, digits, spaces or _ . / -",
            name
        )))
    }
}

fn generated_fork_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("fork-{}", &id[..8])
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_depends_on_owner_and_kind() {
        let a = content_checksum("u1", BlockKind::User, None, &json!("hi"));
        let b = content_checksum("u2", BlockKind::User, None, &json!("hi"));
        let c = content_checksum("u1", BlockKind::Assistant, None, &json!("hi"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, content_checksum("u1", BlockKind::User, None, &json!("hi")));
    }

    #[test]
    fn rejects_empty_content() {
        assert!(validate_content(&json!(null)).is_err());
        assert!(validate_content(&json!("   ")).is_err());
        assert!(validate_content(&json!({})).is_err());
        assert!(validate_content(&json!({"text": "ok"})).is_ok());
    }

    #[test]
    fn branch_names_are_restricted() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature/alt-2").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("-leading").is_err());
        assert!(validate_branch_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn generated_fork_names_are_valid() {
        let name = generated_fork_name();
        assert!(name.starts_with("fork-"));
        assert_eq!(name.len(), 13);
        assert!(validate_branch_name(&name).is_ok());
    }

    #[test]
    fn token_estimate_counts_words() {
        assert_eq!(estimate_tokens(&json!("one two  three")), 3);
        assert_eq!(estimate_tokens(&json!({"text": "a b"})), 2);
    }
}
