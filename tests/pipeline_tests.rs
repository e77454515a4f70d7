use forkline::agent::MockProvider;
use forkline::graph::{AppendRequest, BranchEngine, StartOutcome, StartRequest};
use forkline::persistence::Persistence;
use forkline::services::{FixedWindowRateLimiter, InMemoryQuota, StreamSlots};
use forkline::streaming::{FinalPayload, StreamFrame, StreamKind, StreamRequest, StreamingPipeline};
use forkline::types::BlockKind;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn setup(provider: MockProvider) -> (BranchEngine, StreamingPipeline, StartOutcome) {
    let engine = BranchEngine::new(Persistence::in_memory().expect("in-memory db"));
    let started = engine.start("alice", StartRequest::user("Hi")).unwrap();
    let pipeline = StreamingPipeline::new(engine.clone(), Arc::new(provider));
    (engine, pipeline, started)
}

fn fast(response: &str) -> MockProvider {
    MockProvider::new(response).with_chunk_delay(Duration::from_millis(1))
}

fn request(branch_id: &str, kind: StreamKind, body: serde_json::Value) -> StreamRequest {
    let action = match kind {
        StreamKind::Generate => "generate",
        StreamKind::Send => "send",
    };
    StreamRequest {
        caller: "alice".to_string(),
        branch_id: branch_id.to_string(),
        kind,
        path: format!("/branches/{branch_id}/{action}/stream"),
        idempotency_token: None,
        body: serde_json::to_vec(&body).unwrap(),
    }
}

fn deltas(frames: &[StreamFrame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::Delta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn final_payload(frames: &[StreamFrame]) -> FinalPayload {
    match frames.last() {
        Some(StreamFrame::Final(body)) => serde_json::from_str(body).unwrap(),
        other => panic!("expected a final frame, got {other:?}"),
    }
}

fn error_code(frame: Option<&StreamFrame>) -> &str {
    match frame {
        Some(StreamFrame::Error { code, .. }) => code.as_str(),
        other => panic!("expected an error frame, got {other:?}"),
    }
}

async fn wait_for_release(pipeline: &StreamingPipeline, caller: &str) {
    for _ in 0..200 {
        if pipeline.slots().in_use(caller) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stream slot was never released");
}

#[tokio::test]
async fn generate_streams_deltas_then_commits() {
    let (engine, pipeline, started) = setup(fast("Hello there friend"));
    let branch_id = started.branch.id.clone();

    let frames = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({"expectedVersion": 0})))
        .unwrap()
        .collect()
        .await;

    assert_eq!(deltas(&frames), "Hello there friend");
    assert!(frames[..frames.len() - 1]
        .iter()
        .all(|f| matches!(f, StreamFrame::Delta(_) | StreamFrame::Keepalive)));

    let payload = final_payload(&frames);
    assert_eq!(payload.version, 1);
    assert_eq!(payload.items.len(), 1);
    assert_eq!(payload.items[0].block.kind, BlockKind::Assistant);
    assert_eq!(payload.items[0].block.content, json!("Hello there friend"));
    assert_eq!(payload.items[0].block.model.as_deref(), Some("mock-model"));
    assert!(payload.branch.is_none());

    let history = engine.history("alice", &branch_id).unwrap();
    assert_eq!(history.branch.version, 1);
    assert_eq!(history.branch.tip_node_id.as_deref(), Some(payload.new_tip.as_str()));
    assert_eq!(history.items.len(), 2);

    wait_for_release(&pipeline, "alice").await;
}

#[tokio::test]
async fn stale_expected_version_is_rejected_before_generation() {
    let (_engine, pipeline, started) = setup(fast("never sent"));

    let frames = pipeline
        .open(request(
            &started.branch.id,
            StreamKind::Generate,
            json!({"expectedVersion": 4}),
        ))
        .unwrap()
        .collect()
        .await;

    assert_eq!(frames.len(), 1);
    assert_eq!(error_code(frames.first()), "CONFLICT_TIP_MOVED");
    match &frames[0] {
        StreamFrame::Error { details, .. } => {
            let details = details.as_ref().expect("conflict details");
            assert_eq!(details["currentVersion"], 0);
            assert_eq!(details["currentTip"], started.item.node_id.as_str());
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn tip_moving_during_generation_fails_the_commit() {
    let provider = MockProvider::new("one two three four five six")
        .with_chunk_delay(Duration::from_millis(40));
    let (engine, pipeline, started) = setup(provider);
    let branch_id = started.branch.id.clone();

    let mut rx = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .unwrap();
    match rx.recv().await {
        Some(StreamFrame::Delta(_)) => {}
        other => panic!("expected a delta first, got {other:?}"),
    }

    engine
        .append(
            "alice",
            &branch_id,
            AppendRequest::new(BlockKind::User, "meanwhile"),
        )
        .unwrap();

    let rest = rx.collect().await;
    assert_eq!(error_code(rest.last()), "CONFLICT_TIP_MOVED");

    let history = engine.history("alice", &branch_id).unwrap();
    assert_eq!(history.branch.version, 1);
    assert_eq!(history.items.len(), 2);
    assert_eq!(history.items[1].block.content, json!("meanwhile"));
}

#[tokio::test]
async fn provider_failure_ends_with_internal_error_and_no_commit() {
    let (engine, pipeline, started) = setup(fast("alpha beta gamma delta").failing_after(2));
    let branch_id = started.branch.id.clone();

    let frames = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .unwrap()
        .collect()
        .await;

    assert_eq!(deltas(&frames), "alpha beta");
    assert_eq!(error_code(frames.last()), "INTERNAL");
    match frames.last() {
        Some(StreamFrame::Error { message, .. }) => assert_eq!(message, "internal error"),
        other => panic!("unexpected frame {other:?}"),
    }

    let branch = engine.branch("alice", &branch_id).unwrap();
    assert_eq!(branch.version, 0);
    wait_for_release(&pipeline, "alice").await;
}

#[tokio::test]
async fn dropping_the_receiver_cancels_and_frees_the_slot() {
    let provider = MockProvider::new("a b c d e f g h i j k l m n o p")
        .with_chunk_delay(Duration::from_millis(30));
    let (engine, pipeline, started) = setup(provider);
    let pipeline = pipeline.with_slots(StreamSlots::new(1));
    let branch_id = started.branch.id.clone();

    let mut rx = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .unwrap();
    assert!(matches!(rx.recv().await, Some(StreamFrame::Delta(_))));
    assert_eq!(pipeline.slots().in_use("alice"), 1);

    drop(rx);
    wait_for_release(&pipeline, "alice").await;

    let branch = engine.branch("alice", &branch_id).unwrap();
    assert_eq!(branch.version, 0);
    assert!(pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .is_ok());
}

#[tokio::test]
async fn open_streams_are_capped_per_caller() {
    let provider = MockProvider::new("slow and steady wins").with_chunk_delay(Duration::from_millis(50));
    let (_engine, pipeline, started) = setup(provider);
    let pipeline = pipeline.with_slots(StreamSlots::new(1));

    let _held = pipeline
        .open(request(&started.branch.id, StreamKind::Generate, json!({})))
        .unwrap();
    let err = pipeline
        .open(request(&started.branch.id, StreamKind::Generate, json!({})))
        .unwrap_err();
    assert_eq!(err.code(), "RATE_LIMITED");

    // Other callers have their own slots.
    let mut other = request(&started.branch.id, StreamKind::Generate, json!({}));
    other.caller = "bob".to_string();
    let frames = pipeline.open(other).unwrap().collect().await;
    assert_eq!(error_code(frames.last()), "FORBIDDEN");
}

#[tokio::test]
async fn rate_limit_and_quota_reject_before_streaming() {
    let (_engine, pipeline, started) = setup(fast("three small words"));
    let pipeline = pipeline
        .with_rate_limiter(Arc::new(FixedWindowRateLimiter::per_minute(2)))
        .with_quota(Arc::new(InMemoryQuota::new(1)));
    let branch_id = started.branch.id.clone();

    let frames = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .unwrap()
        .collect()
        .await;
    final_payload(&frames);
    wait_for_release(&pipeline, "alice").await;

    let err = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");
    assert_eq!(pipeline.slots().in_use("alice"), 0);

    let err = pipeline
        .open(request(&branch_id, StreamKind::Generate, json!({})))
        .unwrap_err();
    assert_eq!(err.code(), "RATE_LIMITED");
}

#[tokio::test]
async fn retried_stream_replays_the_stored_final_frame() {
    let (engine, pipeline, started) = setup(fast("only once"));
    let branch_id = started.branch.id.clone();

    let mut first = request(&branch_id, StreamKind::Generate, json!({}));
    first.idempotency_token = Some("gen-1".to_string());
    let retry = first.clone();

    let frames = pipeline.open(first).unwrap().collect().await;
    let original = match frames.last() {
        Some(StreamFrame::Final(body)) => body.clone(),
        other => panic!("expected a final frame, got {other:?}"),
    };

    let replayed = pipeline.open(retry).unwrap().collect().await;
    assert_eq!(replayed, vec![StreamFrame::Final(original)]);

    let history = engine.history("alice", &branch_id).unwrap();
    assert_eq!(history.branch.version, 1);
    assert_eq!(history.items.len(), 2);
}

#[tokio::test]
async fn send_commits_the_user_message_first() {
    let (engine, pipeline, started) = setup(fast("Nice to meet you"));
    let branch_id = started.branch.id.clone();

    let frames = pipeline
        .open(request(
            &branch_id,
            StreamKind::Send,
            json!({"userMessage": "My name is Ada", "expectedVersion": 0}),
        ))
        .unwrap()
        .collect()
        .await;

    let user_item = match frames.first() {
        Some(StreamFrame::Item(item)) => item.clone(),
        other => panic!("expected an item frame first, got {other:?}"),
    };
    assert_eq!(user_item.block.kind, BlockKind::User);
    assert_eq!(deltas(&frames), "Nice to meet you");

    let payload = final_payload(&frames);
    assert_eq!(payload.version, 2);
    assert_eq!(payload.items.len(), 2);
    assert_eq!(payload.items[0].node_id, user_item.node_id);
    assert_eq!(payload.items[1].block.kind, BlockKind::Assistant);

    let history = engine.history("alice", &branch_id).unwrap();
    let kinds: Vec<_> = history.items.iter().map(|i| i.block.kind).collect();
    assert_eq!(
        kinds,
        vec![BlockKind::User, BlockKind::User, BlockKind::Assistant]
    );
}

#[tokio::test]
async fn generate_can_fork_a_new_branch() {
    let (engine, pipeline, started) = setup(fast("Another angle"));
    let main = started.branch.id.clone();
    engine
        .append("alice", &main, AppendRequest::new(BlockKind::Assistant, "First angle"))
        .unwrap();

    let frames = pipeline
        .open(request(
            &main,
            StreamKind::Generate,
            json!({"forkFromNodeId": started.item.node_id, "branchName": "alt"}),
        ))
        .unwrap()
        .collect()
        .await;

    let payload = final_payload(&frames);
    let branch = payload.branch.expect("fork descriptor");
    assert_eq!(branch.name, "alt");
    assert_eq!(branch.root_node_id, started.item.node_id);
    assert_eq!(payload.version, 1);

    let fork = engine.history("alice", &branch.id).unwrap();
    assert_eq!(fork.items.len(), 2);
    assert_eq!(fork.items[1].block.content, json!("Another angle"));

    let main_branch = engine.branch("alice", &main).unwrap();
    assert_eq!(main_branch.version, 1);
}

#[tokio::test]
async fn invalid_body_yields_a_single_validation_frame() {
    let (_engine, pipeline, started) = setup(fast("unused"));
    let mut bad = request(&started.branch.id, StreamKind::Send, json!({}));
    bad.body = b"{oops".to_vec();

    let frames = pipeline.open(bad).unwrap().collect().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(error_code(frames.first()), "VALIDATION_FAILED");
}

#[tokio::test]
async fn send_with_fork_reports_the_branch_at_its_final_tip() {
    let (engine, pipeline, started) = setup(fast("Goodbye for now"));
    let main = started.branch.id.clone();
    engine
        .append("alice", &main, AppendRequest::new(BlockKind::Assistant, "Hello"))
        .unwrap();

    let frames = pipeline
        .open(request(
            &main,
            StreamKind::Send,
            json!({"userMessage": "Bye", "forkFromNodeId": started.item.node_id}),
        ))
        .unwrap()
        .collect()
        .await;

    let payload = final_payload(&frames);
    assert_eq!(payload.version, 2);
    let branch = payload.branch.expect("fork descriptor");
    assert_eq!(branch.version, payload.version);
    assert_eq!(branch.tip_node_id.as_deref(), Some(payload.new_tip.as_str()));

    let live = engine.branch("alice", &branch.id).unwrap();
    assert_eq!(live.version, branch.version);
    assert_eq!(live.tip_node_id, branch.tip_node_id);
}

#[tokio::test]
async fn racing_streams_with_one_token_share_a_result() {
    let (engine, pipeline, started) = setup(fast("Same answer"));
    let main = started.branch.id.clone();

    let mut first = request(
        &main,
        StreamKind::Generate,
        json!({"forkFromNodeId": started.item.node_id}),
    );
    first.idempotency_token = Some("tok".to_string());
    let second = first.clone();
    let retry = first.clone();

    let a = pipeline.open(first).unwrap();
    let b = pipeline.open(second).unwrap();
    let (a, b) = tokio::join!(a.collect(), b.collect());

    let body_of = |frames: &[StreamFrame]| match frames.last() {
        Some(StreamFrame::Final(body)) => body.clone(),
        other => panic!("expected a final frame, got {other:?}"),
    };
    let body = body_of(&a[..]);
    assert_eq!(body, body_of(&b[..]));

    let replayed = pipeline.open(retry).unwrap().collect().await;
    assert_eq!(replayed, vec![StreamFrame::Final(body.clone())]);

    let payload: FinalPayload = serde_json::from_str(&body).unwrap();
    let fork = payload.branch.expect("fork descriptor");
    let live = engine.branch("alice", &fork.id).unwrap();
    assert_eq!(live.tip_node_id.as_deref(), Some(payload.new_tip.as_str()));
}

#[tokio::test]
async fn slow_generation_emits_keepalives() {
    let provider = MockProvider::new("slow words arrive")
        .with_chunk_delay(Duration::from_millis(60));
    let (_engine, pipeline, started) = setup(provider);
    let pipeline = pipeline.with_keepalive(Duration::from_millis(20));

    let frames = pipeline
        .open(request(&started.branch.id, StreamKind::Generate, json!({})))
        .unwrap()
        .collect()
        .await;

    let keepalives = frames
        .iter()
        .filter(|f| matches!(f, StreamFrame::Keepalive))
        .count();
    assert!(keepalives >= 1, "no keepalive in {frames:?}");
    assert!(matches!(frames.last(), Some(StreamFrame::Final(_))));
    assert_eq!(deltas(&frames), "slow words arrive");
}
