//! The REST surface, driven through the router in-process.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use support::*;
use tower::ServiceExt;

use hived::server::build_router;

async fn call(h: &Harness, req: Request<Body>) -> (StatusCode, Value) {
    let router = build_router(h.ctx.clone());
    let resp = router.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn send(method: &str, path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let h = start_daemon(quiet_supervision()).await;
    let (status, body) = call(&h, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn session_crud_round_trip() {
    let h = start_daemon(quiet_supervision()).await;

    let (status, created) = call(
        &h,
        send(
            "POST",
            "/sessions",
            json!({"repoPath": h.repo_path(), "title": "via rest"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let sid = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "created");
    assert_eq!(created["sandboxStatus"], "pending");
    assert_eq!(created["messageCount"], 0);

    let (status, fetched) = call(&h, get(&format!("/sessions/{sid}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "via rest");

    let (status, listed) = call(&h, get("/sessions?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["items"].as_array().unwrap().len(), 1);
    assert_eq!(listed["hasMore"], false);

    let (status, _) = call(&h, send("POST", &format!("/sessions/{sid}/archive"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, archived) = call(&h, get(&format!("/sessions/{sid}"))).await;
    assert_eq!(archived["status"], "archived");

    let (status, _) =
        call(&h, send("POST", &format!("/sessions/{sid}/unarchive"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, active) = call(&h, get(&format!("/sessions/{sid}"))).await;
    assert_eq!(active["status"], "active");

    let (status, _) = call(
        &h,
        Request::builder()
            .method("DELETE")
            .uri(format!("/sessions/{sid}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h, get(&format!("/sessions/{sid}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_session_is_404_with_error_body() {
    let h = start_daemon(quiet_supervision()).await;
    let (status, body) = call(&h, get("/sessions/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn rest_prompt_queues_message() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;

    let (status, body) = call(
        &h,
        send(
            "POST",
            &format!("/sessions/{sid}/prompt"),
            json!({"content": "from rest"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], true);

    let msg = h
        .ctx
        .storage
        .get_next_pending_message(&sid)
        .await
        .unwrap()
        .expect("queued message");
    assert_eq!(msg.content, "from rest");
    assert_eq!(msg.source, "api");
}

#[tokio::test]
async fn events_endpoint_paginates_with_cursor() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    for i in 0..30 {
        h.ctx
            .storage
            .create_event(hived::storage::NewEvent {
                id: hived::ids::new_id(),
                session_id: sid.clone(),
                event_type: "step_start".to_string(),
                data: format!(r#"{{"n":{i}}}"#),
                message_id: None,
            })
            .await
            .unwrap();
    }

    let (status, tail) = call(&h, get(&format!("/sessions/{sid}/events?limit=20"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tail["items"].as_array().unwrap().len(), 20);
    assert_eq!(tail["hasMore"], true);

    let ts = tail["cursor"]["timestamp"].as_str().unwrap();
    let id = tail["cursor"]["id"].as_str().unwrap();
    let (status, older) = call(
        &h,
        get(&format!(
            "/sessions/{sid}/events?limit=20&cursorTimestamp={}&cursorId={}",
            urlencode(ts),
            id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(older["items"].as_array().unwrap().len(), 10);
    assert_eq!(older["hasMore"], false);
}

#[tokio::test]
async fn settings_round_trip() {
    let h = start_daemon(quiet_supervision()).await;

    let (status, _) = call(
        &h,
        send(
            "PUT",
            "/settings",
            json!({"models.enabled": ["claude-sonnet-4-5"], "theme": "dark"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, settings) = call(&h, get("/settings")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["theme"], "dark");
    assert_eq!(settings["models.enabled"][0], "claude-sonnet-4-5");
}

#[tokio::test]
async fn secrets_are_scoped_and_never_listed_with_values() {
    let h = start_daemon(quiet_supervision()).await;

    let (status, _) = call(
        &h,
        send("PUT", "/secrets/API_KEY", json!({"value": "global-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &h,
        send(
            "PUT",
            "/repos/acme/widgets/secrets/API_KEY",
            json!({"value": "repo-secret"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = call(&h, get("/secrets")).await;
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["key"], "API_KEY");
    assert!(items[0].get("value").is_none());

    let (_, repo_listed) = call(&h, get("/repos/acme/widgets/secrets")).await;
    assert_eq!(repo_listed["items"][0]["scope"], "acme/widgets");

    // Scope resolution: the repo value overrides the global one.
    let resolved = h.ctx.storage.resolve_secrets("acme/widgets").await.unwrap();
    let map: std::collections::HashMap<_, _> = resolved.into_iter().collect();
    assert_eq!(map["API_KEY"], "repo-secret");

    let (status, body) = call(
        &h,
        Request::builder()
            .method("DELETE")
            .uri("/repos/acme/widgets/secrets/API_KEY")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let resolved = h.ctx.storage.resolve_secrets("acme/widgets").await.unwrap();
    let map: std::collections::HashMap<_, _> = resolved.into_iter().collect();
    assert_eq!(map["API_KEY"], "global-secret");
}

#[tokio::test]
async fn messages_endpoint_pages_with_before_cursor() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    for i in 0..5 {
        let (status, _) = call(
            &h,
            send(
                "POST",
                &format!("/sessions/{sid}/prompt"),
                json!({"content": format!("prompt {i}")}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, page) = call(&h, get(&format!("/sessions/{sid}/messages?limit=3"))).await;
    assert_eq!(status, StatusCode::OK);
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(page["hasMore"], true);
    assert_eq!(items[2]["content"], "prompt 4");

    let before = page["cursor"].as_str().unwrap();
    let (status, older) = call(
        &h,
        get(&format!("/sessions/{sid}/messages?limit=3&before={before}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let older_items = older["items"].as_array().unwrap();
    assert_eq!(older_items.len(), 2);
    assert_eq!(older_items[0]["content"], "prompt 0");
    assert_eq!(older_items[1]["content"], "prompt 1");
}

#[tokio::test]
async fn artifacts_listing() {
    let h = start_daemon(quiet_supervision()).await;
    let sid = h.create_session().await;
    h.ctx
        .storage
        .create_artifact(&sid, "branch", None, Some(r#"{"name":"agent/x"}"#))
        .await
        .unwrap();

    let (status, body) = call(&h, get(&format!("/sessions/{sid}/artifacts"))).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["type"], "branch");
    assert_eq!(items[0]["metadata"]["name"], "agent/x");
}

/// Minimal percent-encoding for cursor timestamps in query strings
/// (`+` and `:` are the only characters RFC-3339 needs escaped here).
fn urlencode(s: &str) -> String {
    s.replace('%', "%25")
        .replace('+', "%2B")
        .replace(':', "%3A")
}
