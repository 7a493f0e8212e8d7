//! OpenAI-compatible chat backend.
//!
//! Serves the GENERAL domain and any domain model that is exposed as a
//! fine-tuned chat endpoint (the spectrum LoRA). Streaming reads the
//! upstream SSE body line by line and forwards every content delta.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::http::{build_http_client, check_status, map_transport_error, post_json, probe_url};
use super::{BackendClient, BackendDelta, BackendError, BackendPayload, BackendReply, BackendStream, ReplyFinish};
use crate::domain::IntentParams;
use crate::protocol::{Message, Usage};
use crate::registry::{BackendDescriptor, Protocol};

const SPECTRUM_SYSTEM_PROMPT: &str = "You are a professional chemist specialized in spectral analysis. \
Given spectral data descriptions, analyze the data to identify functional groups and deduce the \
corresponding chemical compound. Respond with the SMILES notation strictly formatted as ##SMILES: \
followed by the SMILES string.";

const SMILES_MARKER: &str = "##SMILES:";
const CRYSTAL_SYSTEM_MARKER: &str = "##Crystal System:";

#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    message: Option<UpstreamMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunkChoice {
    delta: Option<UpstreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamDelta {
    content: Option<String>,
}

/// Accumulates raw body bytes and hands out complete lines. A line is
/// decoded as UTF-8 only once its newline has arrived.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Result<String, BackendError>> {
        let newline_pos = self.bytes.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.bytes.drain(..=newline_pos).collect();
        Some(
            std::str::from_utf8(&raw)
                .map(|line| line.trim().to_string())
                .map_err(|e| BackendError::Protocol(format!("stream line is not valid UTF-8: {}", e))),
        )
    }
}

pub struct ChatClient {
    id: String,
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl ChatClient {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        debug!("Chat client {} initialized with backend: {}", descriptor.id, descriptor.endpoint);
        Self {
            id: descriptor.id.clone(),
            base_url: descriptor.endpoint.clone(),
            model: descriptor.model.clone().unwrap_or_else(|| "default".to_string()),
            timeout: descriptor.timeout(),
            http: build_http_client(descriptor.timeout()),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn upstream_request<'a>(&'a self, payload: &BackendPayload, stream: bool) -> Result<UpstreamRequest<'a>, BackendError> {
        let messages = match &payload.params {
            IntentParams::Chat => payload.messages.clone(),
            IntentParams::Spectrum { query } => {
                vec![Message::system(SPECTRUM_SYSTEM_PROMPT), Message::user(query.clone())]
            }
            other => {
                return Err(BackendError::InvalidPayload(format!(
                    "chat backend cannot serve task {}",
                    other.task_name()
                )))
            }
        };
        Ok(UpstreamRequest {
            model: &self.model,
            messages,
            max_tokens: payload.max_tokens,
            temperature: payload.temperature,
            top_p: payload.top_p,
            stream,
        })
    }
}

/// Pull the answer line that follows a `##...:` marker.
fn extract_marker(content: &str, marker: &str) -> Option<String> {
    let (_, rest) = content.split_once(marker)?;
    let value = rest.lines().next().unwrap_or_default().trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn spectrum_metadata(content: &str) -> Option<serde_json::Value> {
    let smiles = extract_marker(content, SMILES_MARKER);
    let crystal_system = extract_marker(content, CRYSTAL_SYSTEM_MARKER);
    if smiles.is_none() && crystal_system.is_none() {
        return None;
    }
    Some(serde_json::json!({
        "smiles": smiles,
        "crystal_system": crystal_system,
    }))
}

#[async_trait]
impl BackendClient for ChatClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::OpenaiChat
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let request = self.upstream_request(payload, false)?;
        let completion: UpstreamResponse =
            post_json(&self.http, &self.completions_url(), &request, self.timeout).await?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Protocol("response carried no choices".to_string()))?;
        let content = choice
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| BackendError::Protocol("choice carried no message content".to_string()))?;

        let metadata = match payload.params {
            IntentParams::Spectrum { .. } => spectrum_metadata(&content),
            _ => None,
        };

        Ok(BackendReply {
            content,
            finish: ReplyFinish::from_openai(choice.finish_reason.as_deref()),
            usage: completion.usage,
            metadata,
        })
    }

    async fn invoke_stream(&self, payload: &BackendPayload) -> Result<BackendStream, BackendError> {
        let request = self.upstream_request(payload, true)?;
        let timeout = self.timeout;
        let response = self
            .http
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;
        let response = check_status(response).await?;

        let byte_stream = response.bytes_stream();
        let deltas = async_stream::try_stream! {
            let mut lines = LineBuffer::default();
            futures_util::pin_mut!(byte_stream);
            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result.map_err(|e| map_transport_error(e, timeout))?;
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    let line = line?;
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == crate::protocol::STREAM_SENTINEL {
                        return;
                    }
                    let parsed: UpstreamChunk = match serde_json::from_str(data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!("Skipping unparseable stream chunk: {}", e);
                            continue;
                        }
                    };
                    let usage = parsed.usage;
                    // Trailing usage report (`stream_options.include_usage`).
                    if parsed.choices.is_empty() {
                        if usage.is_some() {
                            yield BackendDelta { content: String::new(), finish: None, usage };
                        }
                        continue;
                    }
                    for choice in parsed.choices {
                        let content = choice.delta.and_then(|d| d.content).unwrap_or_default();
                        let finish = choice.finish_reason.as_deref().map(|r| ReplyFinish::from_openai(Some(r)));
                        if content.is_empty() && finish.is_none() && usage.is_none() {
                            continue;
                        }
                        yield BackendDelta { content, finish, usage };
                    }
                }
            }
        };

        Ok(Box::pin(deltas))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.base_url, Protocol::OpenaiChat.probe_path());
        probe_url(&self.http, &url, self.timeout).await
    }
}
