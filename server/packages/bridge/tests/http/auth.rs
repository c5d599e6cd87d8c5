// Bearer token enforcement.
include!("../common/http.rs");

#[tokio::test]
async fn missing_token_is_rejected() {
    let app = TestApp::new();
    let mut events = app.router.subscribe_events();
    let (status, payload) = send_raw(
        &app.app,
        Method::POST,
        "/events",
        None,
        Some(json!({}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["status"], json!(401));
    assert_eq!(
        payload["type"],
        json!("urn:codex-opencode-bridge:error:token_invalid")
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn wrong_token_is_rejected_everywhere() {
    let app = TestApp::new();
    let requests = [
        (Method::POST, "/events", Some(sample_event().to_string())),
        (
            Method::POST,
            "/replies/drain",
            Some(drain_body(ToolSource::Codex, "t").to_string()),
        ),
        (Method::GET, "/queue/snapshot", None),
    ];
    for (method, path, body) in requests {
        let (status, _) = send_raw(&app.app, method, path, Some("Bearer not-the-secret"), body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{path}");
    }
}

#[tokio::test]
async fn non_bearer_scheme_is_rejected() {
    let app = TestApp::new();
    let basic = format!("Basic {AUTH_TOKEN}");
    let (status, _) = send_raw(&app.app, Method::GET, "/queue/snapshot", Some(&basic), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rejected_drain_leaves_replies_queued() {
    let app = TestApp::new();
    app.replies.enqueue(ToolSource::Opencode, "session-123", "keep me", None);
    let (status, _) = send_raw(
        &app.app,
        Method::POST,
        "/replies/drain",
        None,
        Some(drain_body(ToolSource::Opencode, "session-123").to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.replies.pending(ToolSource::Opencode, "session-123"), 1);
}

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new();
    let (status, payload) = send_raw(&app.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], json!("ok"));
}

#[tokio::test]
async fn disabled_auth_accepts_anonymous_requests() {
    let app = TestApp::new_with_auth(AuthConfig::disabled());
    let (status, _) = send_raw(&app.app, Method::GET, "/queue/snapshot", None, None).await;
    assert_eq!(status, StatusCode::OK);
}
