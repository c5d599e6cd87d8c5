//! Turns a Codex `notify` payload into a bridge event.
//!
//! Codex runs the configured notify program with the notification JSON as its
//! last argument. Each turn becomes its own external thread, keyed by the
//! turn id.

use chrono::{DateTime, Utc};
use codex_opencode_bridge::types::{EventRequest, ToolSource};
use serde_json::{Map, Value};

use crate::client::ClientError;

pub const DEFAULT_EVENT_TYPE: &str = "agent-turn-complete";
pub const DEFAULT_BODY: &str = "Codex turn completed.";

pub fn parse_notification(raw: &str) -> Result<Map<String, Value>, ClientError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(payload) => Ok(payload),
        other => Err(ClientError::InvalidNotification(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

pub fn event_from_notification(payload: &Map<String, Value>, now: DateTime<Utc>) -> EventRequest {
    let turn_id = match payload.get("turn-id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .filter(|kind| !kind.is_empty());

    EventRequest {
        id: turn_id.clone(),
        source: ToolSource::Codex,
        event_type: event_type.unwrap_or(DEFAULT_EVENT_TYPE).to_string(),
        title: event_type.map(|kind| format!("Codex {kind}")),
        body: notification_body(payload),
        created_at: Some(now),
        thread_id: Some(turn_id),
        metadata: Some(payload.clone()),
    }
}

fn notification_body(payload: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    if let Some(last) = payload
        .get("last-assistant-message")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
    {
        parts.push(last.to_string());
    }
    if let Some(Value::Array(inputs)) = payload.get("input-messages") {
        let prompt = inputs
            .iter()
            .map(|input| match input {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        if !prompt.is_empty() {
            parts.push(format!("Prompt: {prompt}"));
        }
    }
    if parts.is_empty() {
        DEFAULT_BODY.to_string()
    } else {
        parts.join("\n\n")
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
