use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::IntentParams;
use crate::protocol::{ChatRequest, Message, Usage};
use crate::registry::Protocol;

/// Internal representation of one backend call, before translation into
/// the backend's native request shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendPayload {
    pub params: IntentParams,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl BackendPayload {
    /// Payload carrying the request's conversation and sampling settings.
    pub fn for_request(params: IntentParams, request: &ChatRequest) -> Self {
        Self {
            params,
            messages: request.messages.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        }
    }

    pub fn chat(messages: Vec<Message>) -> Self {
        Self {
            params: IntentParams::Chat,
            messages,
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyFinish {
    Stop,
    Length,
}

impl ReplyFinish {
    /// Map an OpenAI `finish_reason` string; anything unknown is a stop.
    pub fn from_openai(reason: Option<&str>) -> Self {
        match reason {
            Some("length") => ReplyFinish::Length,
            _ => ReplyFinish::Stop,
        }
    }
}

/// Normalised backend answer.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    /// Assistant-facing text, already rendered for the user.
    pub content: String,
    pub finish: ReplyFinish,
    /// Token counts if the backend reported them.
    pub usage: Option<Usage>,
    /// Cleaned structured payload of domain backends.
    pub metadata: Option<serde_json::Value>,
}

impl BackendReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish: ReplyFinish::Stop,
            usage: None,
            metadata: None,
        }
    }

    /// Lead sentence followed by a fenced JSON block of the structured result.
    pub fn structured(lead: impl Into<String>, metadata: serde_json::Value) -> Self {
        let lead = lead.into();
        let pretty = serde_json::to_string_pretty(&metadata).unwrap_or_else(|_| metadata.to_string());
        Self {
            content: format!("{}\n\n```json\n{}\n```", lead, pretty),
            finish: ReplyFinish::Stop,
            usage: None,
            metadata: Some(metadata),
        }
    }
}

/// One streamed increment from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDelta {
    pub content: String,
    pub finish: Option<ReplyFinish>,
    pub usage: Option<Usage>,
}

pub type BackendStream = BoxStream<'static, Result<BackendDelta, BackendError>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Connection refused, DNS failure, 429/503 and similar. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with something we cannot interpret.
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("backend rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// The payload could not be translated for this backend.
    #[error("invalid payload for backend: {0}")]
    InvalidPayload(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Uniform interface to one domain backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn id(&self) -> &str;

    fn protocol(&self) -> Protocol;

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError>;

    /// Streaming variant. Backends without native streaming yield their
    /// whole reply as a single increment.
    async fn invoke_stream(&self, payload: &BackendPayload) -> Result<BackendStream, BackendError> {
        let reply = self.invoke(payload).await?;
        let delta = BackendDelta {
            content: reply.content,
            finish: Some(reply.finish),
            usage: reply.usage,
        };
        Ok(Box::pin(futures_util::stream::once(async move { Ok(delta) })))
    }

    /// Liveness check used by the health prober.
    async fn probe(&self) -> Result<(), BackendError>;
}
