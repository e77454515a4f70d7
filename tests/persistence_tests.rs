use chrono::Utc;
use forkline::error::GraphError;
use forkline::graph::{advance_tip, BranchEngine, StartRequest};
use forkline::persistence::idempotency::IdempotencyKey;
use forkline::persistence::Persistence;
use forkline::types::{BlockEdge, BlockKind, EdgeRelation};
use serde_json::json;
use std::collections::HashMap;
use tempfile::tempdir;

fn temp_db_path() -> std::path::PathBuf {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.duckdb");
    // Keep directory alive by leaking it for test duration to avoid drop before use
    Box::leak(Box::new(dir));
    path
}

#[test]
fn db_initializes_and_tables_exist() {
    let path = temp_db_path();
    let p = Persistence::new(&path).expect("init db");
    let conn = p.conn();
    for table in [
        "graphs",
        "context_blocks",
        "graph_nodes",
        "block_edges",
        "branches",
        "idempotency_requests",
    ]
    .iter()
    {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let mut stmt = conn.prepare(&sql).unwrap();
        let count: i64 = stmt.query_row([], |row| row.get(0)).unwrap();
        assert_eq!(count, 0, "table {} should start empty", table);
    }
}

#[test]
fn graph_survives_reopen() {
    let path = temp_db_path();
    let (graph_id, branch_id) = {
        let engine = BranchEngine::new(Persistence::new(&path).unwrap());
        let started = engine.start("alice", StartRequest::user("Hi")).unwrap();
        engine.persistence().checkpoint().unwrap();
        (started.graph.id, started.branch.id)
    };

    let engine = BranchEngine::new(Persistence::new(&path).unwrap());
    let view = engine.graph("alice", &graph_id).unwrap();
    assert_eq!(view.branches.len(), 1);
    assert_eq!(view.branches[0].id, branch_id);

    let history = engine.history("alice", &branch_id).unwrap();
    assert_eq!(history.items.len(), 1);
    assert_eq!(history.items[0].block.content, json!("Hi"));
}

#[test]
fn stale_compare_and_set_changes_nothing() {
    let p = Persistence::in_memory().unwrap();
    let engine = BranchEngine::new(p.clone());
    let started = engine.start("alice", StartRequest::user("Hi")).unwrap();
    let branch_id = started.branch.id.clone();

    let changed = p
        .read(|store| store.compare_and_set_tip(&branch_id, 5, None))
        .unwrap();
    assert_eq!(changed, 0);

    let err = p
        .transaction(|store| advance_tip(store, &branch_id, 3, None))
        .unwrap_err();
    match err {
        GraphError::TipMoved {
            current_tip,
            current_version,
            ..
        } => {
            assert_eq!(current_tip.as_deref(), Some(started.item.node_id.as_str()));
            assert_eq!(current_version, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let branch = engine.branch("alice", &branch_id).unwrap();
    assert_eq!(branch.version, 0);
    assert_eq!(branch.tip_node_id, Some(started.item.node_id));
}

#[test]
fn failed_transaction_rolls_back_every_write() {
    let p = Persistence::in_memory().unwrap();
    let engine = BranchEngine::new(p.clone());
    let started = engine.start("alice", StartRequest::user("Hi")).unwrap();
    let graph_id = started.graph.id.clone();

    let result: Result<(), GraphError> = p.transaction(|store| {
        store.set_graph_title(&graph_id, "should not stick")?;
        Err(GraphError::validation("abort"))
    });
    assert!(result.is_err());

    let view = engine.graph("alice", &graph_id).unwrap();
    assert_eq!(view.graph.title, None);
}

#[test]
fn identical_content_reuses_the_block_per_owner() {
    let p = Persistence::in_memory().unwrap();
    let engine = BranchEngine::new(p.clone());

    let a = engine.start("alice", StartRequest::user("same words")).unwrap();
    let b = engine.start("alice", StartRequest::user("same words")).unwrap();
    let c = engine.start("bob", StartRequest::user("same words")).unwrap();

    assert_eq!(a.item.block.id, b.item.block.id);
    assert_ne!(a.item.node_id, b.item.node_id);
    assert_ne!(a.item.block.id, c.item.block.id);
    assert_eq!(c.item.block.owner_id, "bob");
}

#[test]
fn edges_and_nodes_round_trip_through_the_store() {
    let p = Persistence::in_memory().unwrap();
    let engine = BranchEngine::new(p.clone());
    let started = engine.start("alice", StartRequest::user("Hi")).unwrap();
    let appended = engine
        .append(
            "alice",
            &started.branch.id,
            forkline::graph::AppendRequest::new(BlockKind::Assistant, "Hello")
                .with_model("mock-model"),
        )
        .unwrap();

    p.read(|store| {
        let edges = store.active_edges(&started.graph.id, EdgeRelation::Follows)?;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].parent_node_id, started.item.node_id);
        assert_eq!(edges[0].child_node_id, appended.new_tip);
        assert_eq!(edges[0].ord, 0);

        let node = store.get_node(&appended.new_tip)?.expect("node stored");
        assert!(!node.is_hidden());
        let block = store.get_block(&node.block_id)?.expect("block stored");
        assert_eq!(block.kind, BlockKind::Assistant);
        assert_eq!(block.model.as_deref(), Some("mock-model"));
        assert_eq!(block.token_count, Some(1));
        Ok(())
    })
    .unwrap();
}

#[test]
fn edges_to_unknown_nodes_are_rejected() {
    let p = Persistence::in_memory().unwrap();
    let engine = BranchEngine::new(p.clone());
    let started = engine.start("alice", StartRequest::user("Hi")).unwrap();

    let edge = BlockEdge {
        id: "e-orphan".to_string(),
        graph_id: started.graph.id.clone(),
        parent_node_id: started.item.node_id.clone(),
        child_node_id: "no-such-node".to_string(),
        relation: EdgeRelation::Follows,
        ord: 0,
        created_at: Utc::now(),
        deleted_at: None,
    };
    let err = p.transaction(|store| store.insert_edge(&edge)).unwrap_err();
    assert_eq!(err.code(), "INTERNAL");

    let edges = p
        .read(|store| store.active_edges(&started.graph.id, EdgeRelation::Follows))
        .unwrap();
    assert!(edges.is_empty());
}

#[test]
fn soft_deleting_a_referenced_node_is_allowed() {
    let p = Persistence::in_memory().unwrap();
    let engine = BranchEngine::new(p.clone());
    let started = engine.start("alice", StartRequest::user("Hi")).unwrap();
    let tip = engine
        .append(
            "alice",
            &started.branch.id,
            forkline::graph::AppendRequest::new(BlockKind::Assistant, "Hello"),
        )
        .unwrap()
        .new_tip;

    engine
        .delete_node("alice", &tip, true, &HashMap::new())
        .unwrap();

    let node = p.read(|store| store.get_node(&tip)).unwrap().expect("row kept");
    assert!(node.is_hidden());
}

#[test]
fn idempotency_records_are_scoped_by_caller_method_and_path() {
    let cache = Persistence::in_memory().unwrap().idempotency();
    let headers = HashMap::from([("content-type".to_string(), "application/json".to_string())]);
    let key = IdempotencyKey::new("alice", "POST", "/branches/b1/append", "t1");
    assert!(cache.store(&key, 200, &headers, "{}").unwrap());

    for other in [
        IdempotencyKey::new("bob", "POST", "/branches/b1/append", "t1"),
        IdempotencyKey::new("alice", "DELETE", "/branches/b1/append", "t1"),
        IdempotencyKey::new("alice", "POST", "/branches/b2/append", "t1"),
    ] {
        assert!(cache.lookup(&other).unwrap().is_none());
    }

    let record = cache.lookup(&key).unwrap().unwrap();
    assert_eq!(record.headers["content-type"], "application/json");
    assert!(record.created_at <= Utc::now());
}
