//! Relay between a running OpenCode server and the bridge.
//!
//! The relay follows OpenCode's `/event` stream, posts each event to the bridge
//! under the session it belongs to, and feeds drained replies back into that
//! session as prompts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codex_opencode_bridge::types::{BridgeReply, EventRequest, ToolSource};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::client::{check_status, normalize_base_url, BridgeClient, ClientError};
use crate::poll::{ReplyForwarder, ReplyPoller};

pub const SESSION_DELETED: &str = "session.deleted";
/// Stream bookkeeping events that say nothing about a session.
const TRANSPORT_EVENTS: [&str; 2] = ["server.connected", "server.heartbeat"];
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Session id an OpenCode event belongs to, if it names one.
pub fn guess_thread_id(event: &Value) -> Option<String> {
    let props = event.get("properties")?;
    props
        .get("sessionID")
        .and_then(Value::as_str)
        .or_else(|| props.pointer("/info/id").and_then(Value::as_str))
        .or_else(|| props.pointer("/message/sessionID").and_then(Value::as_str))
        .map(str::to_string)
}

pub fn format_body(event: &Value) -> String {
    let kind = event_type(event).unwrap_or("unknown");
    let session = event
        .pointer("/properties/sessionID")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let summary = match kind {
        "session.idle" => format!("Session {session} is idle."),
        "session.error" => format!("Session {session} encountered an error."),
        "message.updated" => format!(
            "Message {} updated.",
            event
                .pointer("/properties/info/id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
        ),
        other => format!("OpenCode event {other}"),
    };
    let properties = event.get("properties").cloned().unwrap_or_else(|| json!({}));
    let pretty = serde_json::to_string_pretty(&properties).unwrap_or_else(|_| properties.to_string());
    format!("{summary}\n\n```json\n{pretty}\n```")
}

fn event_type(event: &Value) -> Option<&str> {
    event
        .get("type")
        .and_then(Value::as_str)
        .filter(|kind| !kind.is_empty())
}

/// Builds the bridge event for an OpenCode event, or `None` for events the
/// relay does not forward.
pub fn event_from_opencode(event: &Value, now: DateTime<Utc>) -> Option<EventRequest> {
    let kind = event_type(event)?;
    if TRANSPORT_EVENTS.contains(&kind) {
        return None;
    }
    let thread_id = guess_thread_id(event).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Some(EventRequest {
        id: uuid::Uuid::new_v4().to_string(),
        source: ToolSource::Opencode,
        event_type: kind.to_string(),
        title: Some(format!("OpenCode {kind}")),
        body: format_body(event),
        created_at: Some(now),
        thread_id: Some(thread_id),
        metadata: event.as_object().cloned(),
    })
}

/// Session whose deletion this event announces.
pub fn deleted_session(event: &Value) -> Option<&str> {
    if event_type(event) != Some(SESSION_DELETED) {
        return None;
    }
    event.pointer("/properties/info/id").and_then(Value::as_str)
}

/// Splits an SSE byte stream into `data` payloads.
///
/// Bytes are held until a full line arrives, so a multi-byte character split
/// across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }
}

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    http: Client,
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            http: Client::new(),
            base_url: normalize_base_url(base_url)?,
        })
    }

    /// Sends text into a session as a user prompt.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/session/{session_id}/message", self.base_url))
            .json(&json!({ "parts": [{ "type": "text", "text": text }] }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .get(format!("{}/event", self.base_url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl ReplyForwarder for OpenCodeClient {
    async fn forward(&self, thread_id: &str, reply: &BridgeReply) -> Result<(), ClientError> {
        self.prompt(thread_id, &reply.body).await
    }
}

pub struct RelayConfig {
    pub bridge: BridgeClient,
    pub opencode: OpenCodeClient,
    pub poll_interval: Duration,
}

/// Runs the relay until shutdown: the event stream (reconnecting with backoff)
/// and the reply poller.
pub async fn run_relay(config: RelayConfig, shutdown: watch::Receiver<bool>) {
    let poller = Arc::new(ReplyPoller::new(
        ToolSource::Opencode,
        config.bridge.clone(),
        config.opencode.clone(),
    ));
    let poll_task = tokio::spawn(
        poller
            .clone()
            .run(config.poll_interval, shutdown.clone()),
    );

    let mut shutdown_events = shutdown.clone();
    let mut backoff = RECONNECT_MIN;
    loop {
        if *shutdown_events.borrow() {
            break;
        }
        let streamed = tokio::select! {
            _ = shutdown_events.changed() => break,
            result = relay_stream(&config, &poller) => result,
        };
        match streamed {
            Ok(()) => {
                tracing::info!("opencode event stream ended; reconnecting");
                backoff = RECONNECT_MIN;
            }
            Err(err) => {
                tracing::warn!(error = %err, retry_in_ms = backoff.as_millis() as u64, "opencode event stream failed");
            }
        }
        tokio::select! {
            _ = shutdown_events.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }

    if let Err(err) = poll_task.await {
        tracing::warn!(error = %err, "reply poller task failed");
    }
    tracing::info!("opencode relay stopped");
}

async fn relay_stream(
    config: &RelayConfig,
    poller: &ReplyPoller<BridgeClient, OpenCodeClient>,
) -> Result<(), ClientError> {
    let response = config.opencode.subscribe().await?;
    tracing::info!(opencode = %config.opencode.base_url, "subscribed to opencode events");
    let mut accumulator = SseAccumulator::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for payload in accumulator.push(&chunk) {
            let event: Value = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unparseable opencode event");
                    continue;
                }
            };
            relay_event(&config.bridge, poller, &event).await;
        }
    }
    Ok(())
}

async fn relay_event(
    bridge: &BridgeClient,
    poller: &ReplyPoller<BridgeClient, OpenCodeClient>,
    event: &Value,
) {
    if let Some(request) = event_from_opencode(event, Utc::now()) {
        if let Some(thread_id) = request.thread_id.as_deref() {
            poller.track(thread_id);
        }
        if let Err(err) = bridge.post_event(&request).await {
            tracing::warn!(event_type = %request.event_type, error = %err, "failed to forward opencode event");
        }
    }
    if let Some(session_id) = deleted_session(event) {
        poller.untrack(session_id);
        tracing::debug!(session_id = %session_id, "stopped polling deleted session");
    }
}
