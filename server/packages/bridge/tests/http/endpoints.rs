// Event ingress, reply drain and snapshot endpoints.
include!("../common/http.rs");

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test]
async fn health_reports_ok() {
    let app = TestApp::new();
    let (status, payload) = send_raw(&app.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "status": "ok" }));
}

#[tokio::test]
async fn accepted_event_is_published_to_the_router() {
    let app = TestApp::new();
    let mut events = app.router.subscribe_events();

    let (status, payload) = send_json(&app.app, Method::POST, "/events", Some(sample_event())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(payload, json!({ "accepted": true }));

    let event = events.recv().await.expect("event published");
    assert_eq!(event.id, "evt-1");
    assert_eq!(event.source, ToolSource::Codex);
    assert_eq!(event.event_type, "agent-turn-complete");
    assert_eq!(event.body, "Codex finished a turn.");
    let expected: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().expect("timestamp");
    assert_eq!(event.created_at, expected);
    assert_eq!(event.thread_id, None);
    assert_eq!(event.external_thread_id(), "evt-1");

    let echoed = serde_json::to_value(&event).expect("serialize");
    for (key, value) in sample_event().as_object().expect("object") {
        if key != "createdAt" {
            assert_eq!(echoed.get(key), Some(value), "{key}");
        }
    }
}

#[tokio::test]
async fn event_without_timestamp_is_stamped_on_receipt() {
    let app = TestApp::new();
    let mut events = app.router.subscribe_events();
    let before = Utc::now();

    let mut body = sample_event();
    body.as_object_mut().expect("object").remove("createdAt");
    body["threadId"] = json!("ses_42");
    body["metadata"] = json!({ "cwd": "/work" });
    let (status, _) = send_json(&app.app, Method::POST, "/events", Some(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let event = events.recv().await.expect("event published");
    assert!(event.created_at >= before);
    assert_eq!(event.external_thread_id(), "ses_42");
    assert_eq!(
        event.metadata.as_ref().and_then(|m| m.get("cwd")),
        Some(&json!("/work"))
    );
}

#[tokio::test]
async fn invalid_event_reports_every_field() {
    let app = TestApp::new();
    let mut events = app.router.subscribe_events();

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/events",
        Some(json!({ "source": "claude", "createdAt": "not-a-date" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["status"], json!(400));
    assert_eq!(
        payload["type"],
        json!("urn:codex-opencode-bridge:error:validation_failed")
    );
    let fields = payload["fieldErrors"].as_object().expect("field errors");
    for field in ["id", "source", "type", "body", "createdAt"] {
        assert!(fields.contains_key(field), "{field} missing from {payload}");
    }
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn malformed_json_is_an_invalid_request() {
    let app = TestApp::new();
    let authorization = bearer();
    let (status, payload) = send_raw(
        &app.app,
        Method::POST,
        "/events",
        Some(&authorization),
        Some("{\"id\":".to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        payload["type"],
        json!("urn:codex-opencode-bridge:error:invalid_request")
    );
}

#[tokio::test]
async fn drain_returns_queued_replies_once() {
    let app = TestApp::new();
    app.replies
        .enqueue(ToolSource::Opencode, "session-123", "Acknowledged", None);

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/replies/drain",
        Some(drain_body(ToolSource::Opencode, "session-123")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let replies = payload["replies"].as_array().expect("replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["source"], json!("opencode"));
    assert_eq!(replies[0]["threadId"], json!("session-123"));
    assert_eq!(replies[0]["body"], json!("Acknowledged"));
    assert!(replies[0]["postedAt"].is_string());
    assert!(replies[0]["id"].is_string());

    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/replies/drain",
        Some(drain_body(ToolSource::Opencode, "session-123")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "replies": [] }));
}

#[tokio::test]
async fn drain_does_not_cross_sources() {
    let app = TestApp::new();
    app.replies.enqueue(ToolSource::Codex, "shared", "for codex", None);

    let (_, payload) = send_json(
        &app.app,
        Method::POST,
        "/replies/drain",
        Some(drain_body(ToolSource::Opencode, "shared")),
    )
    .await;
    assert_eq!(payload, json!({ "replies": [] }));
    assert_eq!(app.replies.pending(ToolSource::Codex, "shared"), 1);
}

#[tokio::test]
async fn drain_validates_its_body() {
    let app = TestApp::new();
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/replies/drain",
        Some(json!({ "source": "opencode", "threadId": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(payload["fieldErrors"]["threadId"].is_array());
}

#[tokio::test]
async fn snapshot_counts_pending_replies() {
    let app = TestApp::new();
    app.replies.enqueue(ToolSource::Codex, "turn-1", "a", None);
    app.replies.enqueue(ToolSource::Codex, "turn-1", "b", None);
    app.replies.enqueue(ToolSource::Opencode, "ses_1", "c", None);

    let (status, payload) = send_json(&app.app, Method::GET, "/queue/snapshot", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        payload,
        json!({ "snapshot": { "codex": { "turn-1": 2 }, "opencode": { "ses_1": 1 } } })
    );
}
