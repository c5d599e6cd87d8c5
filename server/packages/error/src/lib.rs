//! Error taxonomy shared by the bridge server and its clients.
//!
//! Every API failure is rendered as an RFC 7807 problem document. Errors that
//! never reach HTTP (unresolved bindings, chat delivery failures, a channel that
//! is not ready yet) live in the same enum so call sites can log them uniformly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    ValidationFailed,
    TokenInvalid,
    UnresolvedBinding,
    DeliveryFailed,
    ChannelNotReady,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            ErrorType::InvalidRequest => "urn:codex-opencode-bridge:error:invalid_request",
            ErrorType::ValidationFailed => "urn:codex-opencode-bridge:error:validation_failed",
            ErrorType::TokenInvalid => "urn:codex-opencode-bridge:error:token_invalid",
            ErrorType::UnresolvedBinding => "urn:codex-opencode-bridge:error:unresolved_binding",
            ErrorType::DeliveryFailed => "urn:codex-opencode-bridge:error:delivery_failed",
            ErrorType::ChannelNotReady => "urn:codex-opencode-bridge:error:channel_not_ready",
            ErrorType::Internal => "urn:codex-opencode-bridge:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ErrorType::InvalidRequest => "Invalid Request",
            ErrorType::ValidationFailed => "Validation Failed",
            ErrorType::TokenInvalid => "Unauthorized",
            ErrorType::UnresolvedBinding => "Unresolved Thread Binding",
            ErrorType::DeliveryFailed => "Chat Delivery Failed",
            ErrorType::ChannelNotReady => "Chat Channel Not Ready",
            ErrorType::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ErrorType::InvalidRequest | ErrorType::ValidationFailed => 400,
            ErrorType::TokenInvalid => 401,
            ErrorType::UnresolvedBinding => 404,
            ErrorType::DeliveryFailed => 502,
            ErrorType::ChannelNotReady => 503,
            ErrorType::Internal => 500,
        }
    }
}

/// A single rejected field of a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Messages keyed by field name, present for validation failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, Vec<String>>>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            field_errors: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("validation failed: {}", describe_fields(.errors))]
    Validation { errors: Vec<FieldError> },
    #[error("token invalid{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    TokenInvalid { message: Option<String> },
    #[error("no binding for chat thread {chat_thread_id}")]
    UnresolvedBinding { chat_thread_id: String },
    #[error("chat delivery failed: {message}")]
    Delivery { message: String },
    #[error("chat channel not ready for event {event_id}")]
    ChannelNotReady { event_id: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            BridgeError::InvalidRequest { .. } => ErrorType::InvalidRequest,
            BridgeError::Validation { .. } => ErrorType::ValidationFailed,
            BridgeError::TokenInvalid { .. } => ErrorType::TokenInvalid,
            BridgeError::UnresolvedBinding { .. } => ErrorType::UnresolvedBinding,
            BridgeError::Delivery { .. } => ErrorType::DeliveryFailed,
            BridgeError::ChannelNotReady { .. } => ErrorType::ChannelNotReady,
            BridgeError::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let error_type = self.error_type();
        let mut problem = match self {
            BridgeError::TokenInvalid { message } => ProblemDetails::new(error_type, message.clone()),
            other => ProblemDetails::new(error_type, Some(other.to_string())),
        };
        if let BridgeError::Validation { errors } = self {
            let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for error in errors {
                fields
                    .entry(error.field.clone())
                    .or_default()
                    .push(error.message.clone());
            }
            problem.field_errors = Some(fields);
        }
        problem
    }
}

fn describe_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|error| format!("{}: {}", error.field, error.message))
        .collect::<Vec<_>>()
        .join("; ")
}
