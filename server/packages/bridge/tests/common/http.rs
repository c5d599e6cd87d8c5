use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use codex_opencode_bridge::event_router::EventRouter;
use codex_opencode_bridge::reply_queue::ReplyQueue;
use codex_opencode_bridge::router::{build_router, AppState, AuthConfig};
use codex_opencode_bridge::types::ToolSource;

const AUTH_TOKEN: &str = "test-secret";

struct TestApp {
    app: Router,
    router: Arc<EventRouter>,
    replies: Arc<ReplyQueue>,
}

impl TestApp {
    fn new() -> Self {
        Self::new_with_auth(AuthConfig::with_token(AUTH_TOKEN.to_string()))
    }

    fn new_with_auth(auth: AuthConfig) -> Self {
        let router = Arc::new(EventRouter::new());
        let replies = Arc::new(ReplyQueue::new(router.clone()));
        let app = build_router(AppState::new(auth, router.clone(), replies.clone()));
        Self {
            app,
            router,
            replies,
        }
    }
}

fn bearer() -> String {
    format!("Bearer {AUTH_TOKEN}")
}

async fn send_raw(
    app: &Router,
    method: Method,
    path: &str,
    authorization: Option<&str>,
    body: Option<String>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(authorization) = authorization {
        builder = builder.header(header::AUTHORIZATION, authorization);
    }
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body)
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let authorization = bearer();
    send_raw(
        app,
        method,
        path,
        Some(&authorization),
        body.map(|body| body.to_string()),
    )
    .await
}

fn sample_event() -> Value {
    json!({
        "id": "evt-1",
        "source": "codex",
        "type": "agent-turn-complete",
        "body": "Codex finished a turn.",
        "createdAt": "2024-05-01T12:00:00Z",
    })
}

fn drain_body(source: ToolSource, thread_id: &str) -> Value {
    json!({ "source": source, "threadId": thread_id })
}
