use anyhow::{Context, Result};
use duckdb::Connection;

pub fn run(conn: &Connection) -> Result<()> {
    // Simple migration system: ensure a schema version table and apply migrations sequentially.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .context("creating schema_migrations table")?;

    let current = current_version(conn)?;
    let mut migrations_applied = false;

    if current < 1 {
        apply_v1(conn)?;
        set_version(conn, 1)?;
        migrations_applied = true;
    }

    if current < 2 {
        apply_v2(conn)?;
        set_version(conn, 2)?;
        migrations_applied = true;
    }

    // Force checkpoint after migrations so the WAL does not carry DDL into the next start-up.
    if migrations_applied {
        conn.execute_batch("FORCE CHECKPOINT;")
            .context("forcing checkpoint after migrations")?;
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    let mut stmt = conn.prepare("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v)
}

fn set_version(conn: &Connection, v: i64) -> Result<()> {
    conn.execute("INSERT INTO schema_migrations (version) VALUES (?)", [v])?;
    Ok(())
}

fn apply_v1(conn: &Connection) -> Result<()> {
    // Conversation graph: graphs, blocks, nodes, edges, branches.
    // Timestamps are RFC 3339 text written by the application. Rows are
    // soft-deleted, never removed, and no referenced key is ever updated.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS graphs (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS context_blocks (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            kind TEXT NOT NULL,        -- 'user' | 'assistant'
            content TEXT NOT NULL,     -- opaque JSON payload
            model TEXT,
            token_count BIGINT,
            checksum TEXT UNIQUE,      -- content-addressed dedup
            visible BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS graph_nodes (
            id TEXT PRIMARY KEY,
            graph_id TEXT NOT NULL REFERENCES graphs(id),
            block_id TEXT NOT NULL REFERENCES context_blocks(id),
            hidden_at TEXT,            -- soft delete marker
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS block_edges (
            id TEXT PRIMARY KEY,
            graph_id TEXT NOT NULL REFERENCES graphs(id),
            parent_node_id TEXT NOT NULL REFERENCES graph_nodes(id),
            child_node_id TEXT NOT NULL REFERENCES graph_nodes(id),
            relation TEXT NOT NULL,    -- 'follows' | 'references'
            ord BIGINT NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            deleted_at TEXT            -- soft delete marker
        );

        CREATE TABLE IF NOT EXISTS branches (
            id TEXT PRIMARY KEY,
            graph_id TEXT NOT NULL REFERENCES graphs(id),
            name TEXT NOT NULL,
            title TEXT,
            root_node_id TEXT NOT NULL REFERENCES graph_nodes(id),
            tip_node_id TEXT REFERENCES graph_nodes(id),
            version BIGINT NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (graph_id, name)
        );

        CREATE INDEX IF NOT EXISTS idx_graphs_owner ON graphs(owner_id);
        CREATE INDEX IF NOT EXISTS idx_graph_nodes_graph ON graph_nodes(graph_id);
        CREATE INDEX IF NOT EXISTS idx_graph_nodes_block ON graph_nodes(block_id);
        CREATE INDEX IF NOT EXISTS idx_block_edges_graph ON block_edges(graph_id);
        CREATE INDEX IF NOT EXISTS idx_block_edges_parent ON block_edges(parent_node_id);
        CREATE INDEX IF NOT EXISTS idx_block_edges_child ON block_edges(child_node_id);
        CREATE INDEX IF NOT EXISTS idx_branches_root ON branches(root_node_id);
        "#,
    )
    .context("applying v1 schema (conversation graph)")?;

    Ok(())
}

fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_requests (
            caller_id TEXT NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            token TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,     -- JSON object
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (caller_id, method, path, token)
        );
        "#,
    )
    .context("applying v2 schema (idempotency cache)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 2);
    }

    #[test]
    fn orphan_rows_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let orphan_node = conn.execute(
            "INSERT INTO graph_nodes (id, graph_id, block_id, created_at) VALUES ('n1', 'nope', 'nope', 'x')",
            [],
        );
        assert!(orphan_node.is_err());

        conn.execute_batch(
            "INSERT INTO graphs (id, owner_id, created_at, last_activity_at) VALUES ('g1', 'alice', 'x', 'x');",
        )
        .unwrap();
        let orphan_branch = conn.execute(
            "INSERT INTO branches (id, graph_id, name, root_node_id, created_at) VALUES ('b1', 'g1', 'main', 'missing', 'x')",
            [],
        );
        assert!(orphan_branch.is_err());
    }
}
