//! End-to-end session flow over real WebSockets: cold start, dispatch,
//! token coalescing, completion, and queue ordering.

mod support;

use serde_json::json;
use support::*;

/// Cold start and first prompt: the user's message is persisted and
/// broadcast, a spawn happens, the bridge's `ready` dispatches the prompt.
#[tokio::test]
async fn cold_start_first_prompt_reaches_bridge() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;

    let (mut client, envelope) = subscribe_client(&h, &sid).await;
    assert_eq!(envelope["session"]["id"], sid.as_str());
    assert_eq!(envelope["replay"]["events"].as_array().unwrap().len(), 0);

    send_json(&mut client, json!({"type": "prompt", "content": "hello"})).await;

    // The prompt comes straight back as a replayable user_message event.
    let user_event = recv_until(&mut client, 5, |v| {
        v["type"] == "sandbox_event" && v["event"]["type"] == "user_message"
    })
    .await;
    assert_eq!(user_event["event"]["data"]["content"], "hello");

    recv_until(&mut client, 5, |v| v["type"] == "prompt_queued").await;
    recv_until(&mut client, 5, |v| v["type"] == "sandbox_spawning").await;

    // The driver was asked for exactly one container; wait for the spawn
    // result to be recorded before playing the bridge's part.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let row = h.ctx.storage.get_session(&sid).await.unwrap().unwrap();
        if row.container_id.is_some() {
            assert_eq!(row.sandbox_status, "ready");
            assert!(row.worktree_path.is_some());
            break;
        }
        assert!(std::time::Instant::now() < deadline, "spawn never recorded");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(h.driver.create_count(), 1);

    // The sandbox dials back and reports ready.
    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    send_json(&mut bridge, json!({"type": "ready"})).await;

    recv_until(&mut client, 5, |v| v["type"] == "sandbox_ready").await;
    let processing = recv_until(&mut client, 5, |v| v["type"] == "processing_status").await;
    assert_eq!(processing["isProcessing"], true);

    // The bridge receives the queued prompt.
    let prompt = recv_json(&mut bridge).await;
    assert_eq!(prompt["type"], "prompt");
    assert_eq!(prompt["content"], "hello");
    assert!(prompt["messageId"].is_string());
    assert!(prompt["model"].is_string());

    // Serial processing: exactly one message is `processing`.
    let msg = h
        .ctx
        .storage
        .get_processing_message(&sid)
        .await
        .unwrap()
        .expect("a processing message");
    assert_eq!(prompt["messageId"], msg.id.as_str());
    assert!(msg.started_at.is_some());

    let row = h.ctx.storage.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(row.status, "active");
    assert_eq!(row.sandbox_status, "running");
}

/// Three `token` events for one message coalesce to a single stored row
/// while every arrival is still broadcast live.
#[tokio::test]
async fn token_events_coalesce_but_broadcast_individually() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    let (mut client, _) = subscribe_client(&h, &sid).await;

    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    for content in ["A", "AB", "ABC"] {
        send_json(
            &mut bridge,
            json!({"type": "token", "messageId": "m1", "content": content}),
        )
        .await;
    }

    // Three live broadcasts...
    for expected in ["A", "AB", "ABC"] {
        let ev = recv_until(&mut client, 5, |v| {
            v["type"] == "sandbox_event" && v["event"]["type"] == "token"
        })
        .await;
        assert_eq!(ev["event"]["data"]["content"], expected);
    }

    // ...but exactly one persisted row, holding the final payload.
    let events = h.ctx.storage.get_events_for_replay(&sid, 500).await.unwrap();
    let tokens: Vec<_> = events.iter().filter(|e| e.event_type == "token").collect();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].id, "token:m1");
    assert!(tokens[0].data.contains("ABC"));
}

/// `execution_complete` finishes the in-flight message and the pump
/// dispatches the next queued prompt.
#[tokio::test]
async fn execution_complete_dequeues_next_prompt() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    let (mut client, _) = subscribe_client(&h, &sid).await;

    // Bridge first so prompts dispatch immediately.
    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    send_json(&mut bridge, json!({"type": "ready"})).await;
    recv_until(&mut client, 5, |v| v["type"] == "sandbox_ready").await;

    send_json(&mut client, json!({"type": "prompt", "content": "first"})).await;
    send_json(&mut client, json!({"type": "prompt", "content": "second"})).await;

    let first = recv_until(&mut bridge, 5, |v| v["type"] == "prompt").await;
    assert_eq!(first["content"], "first");
    let first_id = first["messageId"].as_str().unwrap().to_string();

    // Only one message may be in flight while "first" runs.
    let second_pending = h
        .ctx
        .storage
        .get_next_pending_message(&sid)
        .await
        .unwrap()
        .expect("second prompt stays pending");
    assert_eq!(second_pending.content, "second");

    send_json(
        &mut bridge,
        json!({"type": "execution_complete", "messageId": first_id, "success": true}),
    )
    .await;

    let done = recv_until(&mut client, 5, |v| {
        v["type"] == "processing_status" && v["isProcessing"] == false
    })
    .await;
    assert_eq!(done["isProcessing"], false);

    // The pump re-enters asynchronously and sends the second prompt.
    let second = recv_until(&mut bridge, 5, |v| v["type"] == "prompt").await;
    assert_eq!(second["content"], "second");

    let first_row = h.ctx.storage.get_message(&first_id).await.unwrap().unwrap();
    assert_eq!(first_row.status, "completed");
    assert!(first_row.completed_at.is_some());

    // One upsert at exec:<id>.
    let events = h.ctx.storage.get_events_for_replay(&sid, 500).await.unwrap();
    let execs: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "execution_complete")
        .collect();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].id, format!("exec:{first_id}"));
}

/// `success: false` fails the message instead of completing it.
#[tokio::test]
async fn failed_execution_marks_message_failed() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    let (mut client, _) = subscribe_client(&h, &sid).await;

    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    send_json(&mut bridge, json!({"type": "ready"})).await;
    recv_until(&mut client, 5, |v| v["type"] == "sandbox_ready").await;

    send_json(&mut client, json!({"type": "prompt", "content": "doomed"})).await;
    let prompt = recv_until(&mut bridge, 5, |v| v["type"] == "prompt").await;
    let mid = prompt["messageId"].as_str().unwrap().to_string();

    send_json(
        &mut bridge,
        json!({"type": "execution_complete", "messageId": mid, "success": false}),
    )
    .await;
    recv_until(&mut client, 5, |v| {
        v["type"] == "processing_status" && v["isProcessing"] == false
    })
    .await;

    let row = h.ctx.storage.get_message(&mid).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert!(row.completed_at.is_some());
}

/// Stop cancels the in-flight message and forwards a stop to the bridge;
/// stopping again is a no-op.
#[tokio::test]
async fn stop_execution_fails_message_and_notifies_bridge() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    let (mut client, _) = subscribe_client(&h, &sid).await;

    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    send_json(&mut bridge, json!({"type": "ready"})).await;
    recv_until(&mut client, 5, |v| v["type"] == "sandbox_ready").await;

    send_json(&mut client, json!({"type": "prompt", "content": "long task"})).await;
    let prompt = recv_until(&mut bridge, 5, |v| v["type"] == "prompt").await;
    let mid = prompt["messageId"].as_str().unwrap().to_string();

    send_json(&mut client, json!({"type": "stop"})).await;
    recv_until(&mut client, 5, |v| {
        v["type"] == "processing_status" && v["isProcessing"] == false
    })
    .await;
    let stop = recv_until(&mut bridge, 5, |v| v["type"] == "stop").await;
    assert_eq!(stop["type"], "stop");

    let row = h.ctx.storage.get_message(&mid).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");

    // Idempotent when nothing is processing.
    h.ctx.session_manager.stop_execution(&sid).await.unwrap();
    assert!(h
        .ctx
        .storage
        .get_processing_message(&sid)
        .await
        .unwrap()
        .is_none());
}

/// `push_complete` records the pushed branch on the session and creates a
/// `branch` artifact.
#[tokio::test]
async fn push_complete_records_branch_artifact() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    let (mut client, _) = subscribe_client(&h, &sid).await;

    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    send_json(
        &mut bridge,
        json!({"type": "push_complete", "metadata": {"branchName": "agent/xyz"}}),
    )
    .await;

    let ev = recv_until(&mut client, 5, |v| {
        v["type"] == "sandbox_event" && v["event"]["type"] == "push_complete"
    })
    .await;
    assert_eq!(ev["event"]["data"]["metadata"]["branchName"], "agent/xyz");

    let row = h.ctx.storage.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(row.branch.as_deref(), Some("agent/xyz"));

    let artifacts = h.ctx.storage.list_artifacts(&sid).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].artifact_type, "branch");
    assert!(artifacts[0].metadata.as_deref().unwrap().contains("agent/xyz"));
}

/// A prompt that arrives while the sandbox is still spawning is queued and
/// dispatched on `ready`; the driver is only asked for one container.
#[tokio::test]
async fn spawn_is_idempotent_across_queued_prompts() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    let (mut client, _) = subscribe_client(&h, &sid).await;

    send_json(&mut client, json!({"type": "prompt", "content": "one"})).await;
    send_json(&mut client, json!({"type": "prompt", "content": "two"})).await;
    recv_until(&mut client, 5, |v| v["type"] == "sandbox_spawning").await;

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.driver.create_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "driver never called");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    // Extra pump turns while spawning (second prompt) must not create more.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.driver.create_count(), 1);

    let mut bridge = ws_connect(&h.bridge_url(&sid)).await;
    send_json(&mut bridge, json!({"type": "ready"})).await;
    let first = recv_until(&mut bridge, 5, |v| v["type"] == "prompt").await;
    assert_eq!(first["content"], "one");
}
