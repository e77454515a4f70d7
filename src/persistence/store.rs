//! Row-level primitives over the conversation graph tables.
//!
//! A [`Store`] borrows either a plain connection or an open transaction, so
//! the mutation engine composes these calls inside one atomic scope.

use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection, Row};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::GraphResult;
use crate::types::{
    BlockEdge, BlockKind, Branch, ContextBlock, EdgeRelation, Graph, GraphNode,
};

const GRAPH_COLUMNS: &str = "id, owner_id, title, created_at, last_activity_at";
const BLOCK_COLUMNS: &str =
    "id, owner_id, kind, content, model, token_count, checksum, visible, created_at";
const NODE_COLUMNS: &str = "id, graph_id, block_id, hidden_at, created_at";
const EDGE_COLUMNS: &str =
    "id, graph_id, parent_node_id, child_node_id, relation, ord, created_at, deleted_at";
const BRANCH_COLUMNS: &str =
    "id, graph_id, name, title, root_node_id, tip_node_id, version, created_at";

pub struct Store<'c> {
    conn: &'c Connection,
}

impl<'c> Store<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    // ---------- Graphs ----------

    pub fn insert_graph(&self, graph: &Graph) -> GraphResult<()> {
        self.conn.execute(
            "INSERT INTO graphs (id, owner_id, title, created_at, last_activity_at) VALUES (?, ?, ?, ?, ?)",
            params![
                graph.id,
                graph.owner_id,
                graph.title,
                format_ts(&graph.created_at),
                format_ts(&graph.last_activity_at),
            ],
        )?;
        debug!(graph_id = %graph.id, "inserted graph");
        Ok(())
    }

    pub fn get_graph(&self, graph_id: &str) -> GraphResult<Option<Graph>> {
        let sql = format!("SELECT {GRAPH_COLUMNS} FROM graphs WHERE id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![graph_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(graph_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Best-effort activity bump; last write wins.
    pub fn touch_graph(&self, graph_id: &str, at: &DateTime<Utc>) -> GraphResult<()> {
        self.conn.execute(
            "UPDATE graphs SET last_activity_at = ? WHERE id = ?",
            params![format_ts(at), graph_id],
        )?;
        Ok(())
    }

    pub fn set_graph_title(&self, graph_id: &str, title: &str) -> GraphResult<usize> {
        let changed = self.conn.execute(
            "UPDATE graphs SET title = ? WHERE id = ?",
            params![title, graph_id],
        )?;
        Ok(changed)
    }

    // ---------- Blocks ----------

    pub fn insert_block(&self, block: &ContextBlock) -> GraphResult<()> {
        self.conn.execute(
            "INSERT INTO context_blocks (id, owner_id, kind, content, model, token_count, checksum, visible, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                block.id,
                block.owner_id,
                block.kind.as_str(),
                block.content.to_string(),
                block.model,
                block.token_count,
                block.checksum,
                block.visible,
                format_ts(&block.created_at),
            ],
        )?;
        debug!(block_id = %block.id, kind = block.kind.as_str(), "inserted block");
        Ok(())
    }

    pub fn get_block(&self, block_id: &str) -> GraphResult<Option<ContextBlock>> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM context_blocks WHERE id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![block_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(block_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn find_block_by_checksum(&self, checksum: &str) -> GraphResult<Option<ContextBlock>> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM context_blocks WHERE checksum = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![checksum])?;
        match rows.next()? {
            Some(row) => Ok(Some(block_from_row(row)?)),
            None => Ok(None),
        }
    }

    // ---------- Nodes ----------

    pub fn insert_node(&self, node: &GraphNode) -> GraphResult<()> {
        self.conn.execute(
            "INSERT INTO graph_nodes (id, graph_id, block_id, hidden_at, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                node.id,
                node.graph_id,
                node.block_id,
                node.hidden_at.as_ref().map(format_ts),
                format_ts(&node.created_at),
            ],
        )?;
        debug!(node_id = %node.id, graph_id = %node.graph_id, "inserted node");
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> GraphResult<Option<GraphNode>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM graph_nodes WHERE id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![node_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(node_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Oldest visible node in `graph_id` wrapping `block_id`.
    pub fn find_visible_node_for_block(
        &self,
        graph_id: &str,
        block_id: &str,
    ) -> GraphResult<Option<GraphNode>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM graph_nodes
             WHERE graph_id = ? AND block_id = ? AND hidden_at IS NULL
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![graph_id, block_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(node_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn hide_node(&self, node_id: &str, at: &DateTime<Utc>) -> GraphResult<usize> {
        let changed = self.conn.execute(
            "UPDATE graph_nodes SET hidden_at = ? WHERE id = ? AND hidden_at IS NULL",
            params![format_ts(at), node_id],
        )?;
        Ok(changed)
    }

    // ---------- Edges ----------

    pub fn insert_edge(&self, edge: &BlockEdge) -> GraphResult<()> {
        self.conn.execute(
            "INSERT INTO block_edges (id, graph_id, parent_node_id, child_node_id, relation, ord, created_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                edge.id,
                edge.graph_id,
                edge.parent_node_id,
                edge.child_node_id,
                edge.relation.as_str(),
                edge.ord,
                format_ts(&edge.created_at),
                edge.deleted_at.as_ref().map(format_ts),
            ],
        )?;
        debug!(
            edge_id = %edge.id,
            relation = edge.relation.as_str(),
            parent = %edge.parent_node_id,
            child = %edge.child_node_id,
            "inserted edge"
        );
        Ok(())
    }

    /// The single active `follows` edge pointing into `child_node_id`, if any.
    pub fn active_incoming_follows(&self, child_node_id: &str) -> GraphResult<Option<BlockEdge>> {
        let sql = format!(
            "SELECT {EDGE_COLUMNS} FROM block_edges
             WHERE child_node_id = ? AND relation = 'follows' AND deleted_at IS NULL
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![child_node_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(edge_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn soft_delete_edge(&self, edge_id: &str, at: &DateTime<Utc>) -> GraphResult<usize> {
        let changed = self.conn.execute(
            "UPDATE block_edges SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![format_ts(at), edge_id],
        )?;
        Ok(changed)
    }

    /// Soft-delete every active `references` edge touching `node_id` in either direction.
    pub fn soft_delete_references_touching(
        &self,
        node_id: &str,
        at: &DateTime<Utc>,
    ) -> GraphResult<usize> {
        let changed = self.conn.execute(
            "UPDATE block_edges SET deleted_at = ?
             WHERE relation = 'references' AND deleted_at IS NULL
               AND (parent_node_id = ? OR child_node_id = ?)",
            params![format_ts(at), node_id, node_id],
        )?;
        Ok(changed)
    }

    pub fn active_edges(
        &self,
        graph_id: &str,
        relation: EdgeRelation,
    ) -> GraphResult<Vec<BlockEdge>> {
        let sql = format!(
            "SELECT {EDGE_COLUMNS} FROM block_edges
             WHERE graph_id = ? AND relation = ? AND deleted_at IS NULL
             ORDER BY ord ASC, created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![graph_id, relation.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(edge_from_row(row)?);
        }
        Ok(out)
    }

    // ---------- Branches ----------

    pub fn insert_branch(&self, branch: &Branch) -> GraphResult<()> {
        self.conn.execute(
            "INSERT INTO branches (id, graph_id, name, title, root_node_id, tip_node_id, version, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                branch.id,
                branch.graph_id,
                branch.name,
                branch.title,
                branch.root_node_id,
                branch.tip_node_id,
                branch.version,
                format_ts(&branch.created_at),
            ],
        )?;
        debug!(branch_id = %branch.id, name = %branch.name, "inserted branch");
        Ok(())
    }

    pub fn get_branch(&self, branch_id: &str) -> GraphResult<Option<Branch>> {
        let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![branch_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(branch_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn find_branch_by_name(&self, graph_id: &str, name: &str) -> GraphResult<Option<Branch>> {
        let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE graph_id = ? AND name = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![graph_id, name])?;
        match rows.next()? {
            Some(row) => Ok(Some(branch_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_branches(&self, graph_id: &str) -> GraphResult<Vec<Branch>> {
        let sql = format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE graph_id = ? ORDER BY created_at ASC, name ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![graph_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(branch_from_row(row)?);
        }
        Ok(out)
    }

    pub fn branches_rooted_at(&self, node_id: &str) -> GraphResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM branches WHERE root_node_id = ? ORDER BY id")?;
        let mut rows = stmt.query(params![node_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn branches_tipped_at(&self, node_id: &str) -> GraphResult<Vec<Branch>> {
        let sql = format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE tip_node_id = ? ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![node_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(branch_from_row(row)?);
        }
        Ok(out)
    }

    /// Conditional tip update. Returns the number of rows matched, which is
    /// zero when `expected_version` is stale.
    pub fn compare_and_set_tip(
        &self,
        branch_id: &str,
        expected_version: i64,
        new_tip: Option<&str>,
    ) -> GraphResult<usize> {
        let changed = self.conn.execute(
            "UPDATE branches SET tip_node_id = ?, version = version + 1 WHERE id = ? AND version = ?",
            params![new_tip, branch_id, expected_version],
        )?;
        Ok(changed)
    }

    pub fn set_branch_title(&self, branch_id: &str, title: &str) -> GraphResult<usize> {
        let changed = self.conn.execute(
            "UPDATE branches SET title = ? WHERE id = ?",
            params![title, branch_id],
        )?;
        Ok(changed)
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

fn graph_from_row(row: &Row<'_>) -> duckdb::Result<Graph> {
    let created_at: String = row.get(3)?;
    let last_activity_at: String = row.get(4)?;
    Ok(Graph {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_ts(&created_at),
        last_activity_at: parse_ts(&last_activity_at),
    })
}

fn block_from_row(row: &Row<'_>) -> duckdb::Result<ContextBlock> {
    let kind: String = row.get(2)?;
    let content_text: String = row.get(3)?;
    let created_at: String = row.get(8)?;
    let content: JsonValue =
        serde_json::from_str(&content_text).unwrap_or(JsonValue::String(content_text));
    Ok(ContextBlock {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: BlockKind::from_str(&kind).unwrap_or(BlockKind::User),
        content,
        model: row.get(4)?,
        token_count: row.get(5)?,
        checksum: row.get(6)?,
        visible: row.get(7)?,
        created_at: parse_ts(&created_at),
    })
}

fn node_from_row(row: &Row<'_>) -> duckdb::Result<GraphNode> {
    let created_at: String = row.get(4)?;
    Ok(GraphNode {
        id: row.get(0)?,
        graph_id: row.get(1)?,
        block_id: row.get(2)?,
        hidden_at: parse_opt_ts(row.get(3)?),
        created_at: parse_ts(&created_at),
    })
}

fn edge_from_row(row: &Row<'_>) -> duckdb::Result<BlockEdge> {
    let relation: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    Ok(BlockEdge {
        id: row.get(0)?,
        graph_id: row.get(1)?,
        parent_node_id: row.get(2)?,
        child_node_id: row.get(3)?,
        relation: EdgeRelation::from_str(&relation).unwrap_or(EdgeRelation::References),
        ord: row.get(5)?,
        created_at: parse_ts(&created_at),
        deleted_at: parse_opt_ts(row.get(7)?),
    })
}

fn branch_from_row(row: &Row<'_>) -> duckdb::Result<Branch> {
    let created_at: String = row.get(7)?;
    Ok(Branch {
        id: row.get(0)?,
        graph_id: row.get(1)?,
        name: row.get(2)?,
        title: row.get(3)?,
        root_node_id: row.get(4)?,
        tip_node_id: row.get(5)?,
        version: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_survive_text_round_trip() {
        let now = Utc::now();
        let text = format_ts(&now);
        let parsed = parse_ts(&text);
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
        assert!(text.ends_with('Z'));
    }
}
