//! HTTP client for the bridge API.

use std::time::Duration;

use async_trait::async_trait;
use codex_opencode_bridge::types::{BridgeReply, DrainRequest, DrainResponse, EventRequest, ToolSource};
use codex_opencode_bridge_error::ProblemDetails;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use url::Url;

use crate::poll::ReplyDrain;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{}", describe_status(*.status, .problem.as_ref(), .body))]
    Status {
        status: StatusCode,
        problem: Option<ProblemDetails>,
        body: String,
    },
    #[error("invalid notification: {0}")]
    InvalidNotification(String),
}

fn describe_status(status: StatusCode, problem: Option<&ProblemDetails>, body: &str) -> String {
    match problem {
        Some(problem) => format!(
            "bridge returned {status}: {}",
            problem.detail.as_deref().unwrap_or(&problem.title)
        ),
        None => format!("bridge returned {status}: {body}"),
    }
}

/// Normalizes a base URL: it must parse, and trailing slashes are dropped.
pub fn normalize_base_url(raw: &str) -> Result<String, ClientError> {
    let trimmed = raw.trim().trim_end_matches('/');
    Url::parse(trimmed).map_err(|err| ClientError::InvalidUrl {
        url: raw.to_string(),
        message: err.to_string(),
    })?;
    Ok(trimmed.to_string())
}

pub(crate) async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status,
        problem: serde_json::from_str(&body).ok(),
        body,
    })
}

#[derive(Debug, Clone)]
pub struct BridgeClient {
    http: Client,
    base_url: String,
    token: String,
}

impl BridgeClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn post_event(&self, event: &EventRequest) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/events", self.base_url))
            .bearer_auth(&self.token)
            .json(event)
            .send()
            .await?;
        check_status(response).await?;
        tracing::debug!(event_id = %event.id, source = %event.source, "event posted to bridge");
        Ok(())
    }

    pub async fn drain(&self, source: ToolSource, thread_id: &str) -> Result<Vec<BridgeReply>, ClientError> {
        let response = self
            .http
            .post(format!("{}/replies/drain", self.base_url))
            .bearer_auth(&self.token)
            .json(&DrainRequest {
                source,
                thread_id: thread_id.to_string(),
            })
            .send()
            .await?;
        let drained: DrainResponse = check_status(response).await?.json().await?;
        Ok(drained.replies)
    }
}

#[async_trait]
impl ReplyDrain for BridgeClient {
    async fn drain(&self, source: ToolSource, thread_id: &str) -> Result<Vec<BridgeReply>, ClientError> {
        BridgeClient::drain(self, source, thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use codex_opencode_bridge_error::ErrorType;

    use super::*;

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(
            normalize_base_url(" http://localhost:8787/ ").expect("url"),
            "http://localhost:8787"
        );
        assert_eq!(
            normalize_base_url("https://bridge.example/api//").expect("url"),
            "https://bridge.example/api"
        );
        assert!(matches!(
            normalize_base_url("not a url"),
            Err(ClientError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn status_errors_prefer_problem_detail() {
        let err = ClientError::Status {
            status: StatusCode::UNAUTHORIZED,
            problem: Some(ProblemDetails::new(
                ErrorType::TokenInvalid,
                Some("missing or invalid token".to_string()),
            )),
            body: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "bridge returned 401 Unauthorized: missing or invalid token"
        );

        let err = ClientError::Status {
            status: StatusCode::BAD_GATEWAY,
            problem: None,
            body: "upstream down".to_string(),
        };
        assert_eq!(err.to_string(), "bridge returned 502 Bad Gateway: upstream down");
    }
}
