use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use codex_opencode_bridge_error::{BridgeError, ErrorType, FieldError, ProblemDetails};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::event_router::EventRouter;
use crate::reply_queue::{QueueSnapshot, ReplyQueue};
use crate::types::{
    BridgeEvent, BridgeReply, DrainRequest, DrainResponse, EventAcceptedResponse, EventRequest,
    ToolSource,
};

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    router: Arc<EventRouter>,
    replies: Arc<ReplyQueue>,
}

impl AppState {
    pub fn new(auth: AuthConfig, router: Arc<EventRouter>, replies: Arc<ReplyQueue>) -> Self {
        Self {
            auth,
            router,
            replies,
        }
    }

    pub fn event_router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn reply_queue(&self) -> Arc<ReplyQueue> {
        self.replies.clone()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/events", post(post_event))
        .route("/replies/drain", post(drain_replies))
        .route("/queue/snapshot", get(queue_snapshot))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        router = router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    (router.layer(trace_layer), shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_event, drain_replies, queue_snapshot),
    components(
        schemas(
            HealthResponse,
            SnapshotResponse,
            ToolSource,
            BridgeEvent,
            BridgeReply,
            EventRequest,
            EventAcceptedResponse,
            DrainRequest,
            DrainResponse,
            ProblemDetails,
            ErrorType,
            FieldError
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "events", description = "Tool notifications"),
        (name = "replies", description = "Human replies waiting for tools")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Bridge(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// Pending reply counts keyed by source, then external thread id.
    #[schema(value_type = Object)]
    pub snapshot: QueueSnapshot,
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        tracing::warn!(
            path = %req.uri().path(),
            token_present = provided.is_some(),
            "rejected request with missing or invalid token"
        );
        Err(BridgeError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "meta"
)]
/// Health Check
///
/// Returns the server health status. Never requires a token.
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/events",
    request_body = EventRequest,
    responses(
        (status = 202, description = "Event accepted for posting", body = EventAcceptedResponse),
        (status = 400, description = "Invalid event", body = ProblemDetails),
        (status = 401, description = "Missing or invalid token", body = ProblemDetails)
    ),
    tag = "events"
)]
/// Submit Event
///
/// Validates a tool notification and hands it to the chat session. Posting is
/// asynchronous: acceptance does not mean the event reached the chat platform.
async fn post_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAcceptedResponse>), ApiError> {
    let payload = parse_object(&body)?;
    let event = validate_event(&payload, Utc::now())?;
    let subscribers = state.router.publish_event(event.clone());
    tracing::debug!(
        event_id = %event.id,
        source = %event.source,
        subscribers,
        "event accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAcceptedResponse { accepted: true }),
    ))
}

#[utoipa::path(
    post,
    path = "/replies/drain",
    request_body = DrainRequest,
    responses(
        (status = 200, description = "Queued replies, oldest first", body = DrainResponse),
        (status = 400, description = "Invalid drain request", body = ProblemDetails),
        (status = 401, description = "Missing or invalid token", body = ProblemDetails)
    ),
    tag = "replies"
)]
/// Drain Replies
///
/// Removes and returns every reply queued for one tool thread.
async fn drain_replies(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<DrainResponse>, ApiError> {
    let payload = parse_object(&body)?;
    let request = validate_drain(&payload)?;
    let replies = state.replies.drain(request.source, &request.thread_id);
    tracing::debug!(
        source = %request.source,
        thread_id = %request.thread_id,
        count = replies.len(),
        "replies drained"
    );
    Ok(Json(DrainResponse { replies }))
}

#[utoipa::path(
    get,
    path = "/queue/snapshot",
    responses(
        (status = 200, description = "Pending reply counts", body = SnapshotResponse),
        (status = 401, description = "Missing or invalid token", body = ProblemDetails)
    ),
    tag = "replies"
)]
/// Queue Snapshot
///
/// Read-only view of pending reply counts.
async fn queue_snapshot(State(state): State<Arc<AppState>>) -> Json<SnapshotResponse> {
    Json(SnapshotResponse {
        snapshot: state.replies.snapshot(),
    })
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, BridgeError> {
    let value: Value = serde_json::from_slice(body).map_err(|err| BridgeError::InvalidRequest {
        message: format!("body is not valid JSON: {err}"),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(BridgeError::InvalidRequest {
            message: "body must be a JSON object".to_string(),
        }),
    }
}

/// Field-by-field validation so every problem is reported at once.
pub(crate) fn validate_event(
    payload: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<BridgeEvent, BridgeError> {
    let mut errors = Vec::new();
    let id = required_string(payload, "id", &mut errors);
    let source = required_source(payload, &mut errors);
    let event_type = required_string(payload, "type", &mut errors);
    let body = required_string(payload, "body", &mut errors);
    let title = optional_string(payload, "title", &mut errors);
    let thread_id = optional_string(payload, "threadId", &mut errors);

    let created_at = match payload.get("createdAt") {
        None | Some(Value::Null) => Some(now),
        Some(Value::String(raw)) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(_) => {
                errors.push(FieldError::new("createdAt", "must be an RFC 3339 timestamp"));
                None
            }
        },
        Some(_) => {
            errors.push(FieldError::new("createdAt", "must be an RFC 3339 timestamp"));
            None
        }
    };

    let metadata = match payload.get("metadata") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => {
            errors.push(FieldError::new("metadata", "must be an object"));
            None
        }
    };

    match (id, source, event_type, body, created_at) {
        (Some(id), Some(source), Some(event_type), Some(body), Some(created_at))
            if errors.is_empty() =>
        {
            Ok(BridgeEvent {
                id,
                source,
                event_type,
                title,
                body,
                created_at,
                thread_id,
                metadata,
            })
        }
        _ => Err(BridgeError::Validation { errors }),
    }
}

pub(crate) fn validate_drain(payload: &Map<String, Value>) -> Result<DrainRequest, BridgeError> {
    let mut errors = Vec::new();
    let source = required_source(payload, &mut errors);
    let thread_id = required_string(payload, "threadId", &mut errors);
    match (source, thread_id) {
        (Some(source), Some(thread_id)) if errors.is_empty() => {
            Ok(DrainRequest { source, thread_id })
        }
        _ => Err(BridgeError::Validation { errors }),
    }
}

fn required_string(
    payload: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match payload.get(field) {
        Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
        Some(Value::String(_)) => {
            errors.push(FieldError::new(field, "must not be empty"));
            None
        }
        None | Some(Value::Null) => {
            errors.push(FieldError::new(field, "is required"));
            None
        }
        Some(_) => {
            errors.push(FieldError::new(field, "must be a string"));
            None
        }
    }
}

fn optional_string(
    payload: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match payload.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) => Some(value.clone()),
        Some(_) => {
            errors.push(FieldError::new(field, "must be a string"));
            None
        }
    }
}

fn required_source(payload: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Option<ToolSource> {
    match payload.get("source") {
        Some(Value::String(value)) => match value.parse::<ToolSource>() {
            Ok(source) => Some(source),
            Err(_) => {
                errors.push(FieldError::new("source", "must be one of: codex, opencode"));
                None
            }
        },
        None | Some(Value::Null) => {
            errors.push(FieldError::new("source", "is required"));
            None
        }
        Some(_) => {
            errors.push(FieldError::new("source", "must be one of: codex, opencode"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn missing_created_at_defaults_to_now() {
        let now = Utc::now();
        let event = validate_event(
            &object(json!({
                "id": "evt-1",
                "source": "codex",
                "type": "agent-turn-complete",
                "body": "done",
                "extra": "ignored"
            })),
            now,
        )
        .expect("valid");
        assert_eq!(event.created_at, now);
        assert_eq!(event.thread_id, None);
        assert_eq!(event.metadata, None);
    }

    #[test]
    fn created_at_is_normalized_to_utc() {
        let event = validate_event(
            &object(json!({
                "id": "evt-1",
                "source": "opencode",
                "type": "session.idle",
                "body": "idle",
                "createdAt": "2024-05-01T12:00:00+02:00",
                "threadId": "ses_1",
                "metadata": { "k": 1 }
            })),
            Utc::now(),
        )
        .expect("valid");
        assert_eq!(event.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(event.thread_id.as_deref(), Some("ses_1"));
        assert_eq!(event.metadata, Some(object(json!({ "k": 1 }))));
    }

    #[test]
    fn every_invalid_field_is_reported() {
        let err = validate_event(
            &object(json!({
                "id": "",
                "source": "claude",
                "type": 7,
                "title": false,
                "createdAt": "yesterday",
                "metadata": []
            })),
            Utc::now(),
        )
        .expect_err("invalid");
        let BridgeError::Validation { errors } = err else {
            panic!("expected validation error");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["id", "source", "type", "body", "title", "createdAt", "metadata"]
        );
    }

    #[test]
    fn drain_requires_source_and_thread() {
        let request =
            validate_drain(&object(json!({ "source": "opencode", "threadId": "s" }))).expect("ok");
        assert_eq!(request.source, ToolSource::Opencode);

        let err = validate_drain(&object(json!({ "threadId": "" }))).expect_err("invalid");
        let problem = ApiError::from(err).into_response();
        assert_eq!(problem.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn non_object_bodies_are_invalid_requests() {
        assert!(matches!(
            parse_object(b"[1, 2]"),
            Err(BridgeError::InvalidRequest { .. })
        ));
        assert!(matches!(
            parse_object(b"{not json"),
            Err(BridgeError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn token_schemes() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  s3cret-token "),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("s3cret-token"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("token abc"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("abc"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn api_doc_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in ["/health", "/events", "/replies/drain", "/queue/snapshot"] {
            assert!(doc.paths.paths.contains_key(path), "{path}");
        }
    }
}
