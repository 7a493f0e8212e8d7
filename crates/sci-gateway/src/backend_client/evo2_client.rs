use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::http::{build_http_client, post_json, probe_url};
use super::{BackendClient, BackendError, BackendPayload, BackendReply};
use crate::domain::IntentParams;
use crate::registry::{BackendDescriptor, Protocol};

pub const MAX_DNA_LEN: usize = 500;
const DEFAULT_NUM_TOKENS: u32 = 100;
const MAX_NUM_TOKENS: u32 = 300;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    sequence: &'a str,
    num_tokens: u32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    enable_logits: bool,
    enable_sampled_probs: bool,
}

pub struct Evo2Client {
    id: String,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl Evo2Client {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            base_url: descriptor.endpoint.clone(),
            timeout: descriptor.timeout(),
            http: build_http_client(descriptor.timeout()),
        }
    }
}

fn validate_dna(sequence: &str) -> Result<(), BackendError> {
    if sequence.is_empty() || sequence.len() > MAX_DNA_LEN {
        return Err(BackendError::InvalidPayload(format!(
            "DNA sequence must be 1..={} bases, got {}",
            MAX_DNA_LEN,
            sequence.len()
        )));
    }
    if let Some(bad) = sequence.chars().find(|c| !"ACGTN".contains(*c)) {
        return Err(BackendError::InvalidPayload(format!("DNA sequence contains invalid base '{}'", bad)));
    }
    Ok(())
}

#[async_trait]
impl BackendClient for Evo2Client {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Evo2
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let IntentParams::DnaContinuation { sequence, num_tokens } = &payload.params else {
            return Err(BackendError::InvalidPayload(format!(
                "evo2 cannot serve task {}",
                payload.params.task_name()
            )));
        };
        let sequence = sequence.trim().to_ascii_uppercase();
        validate_dna(&sequence)?;

        let request = GenerateRequest {
            sequence: &sequence,
            num_tokens: num_tokens.unwrap_or(DEFAULT_NUM_TOKENS).clamp(1, MAX_NUM_TOKENS),
            temperature: payload.temperature.unwrap_or(0.7).clamp(0.02, 1.3),
            top_k: 3,
            top_p: 1.0,
            enable_logits: false,
            enable_sampled_probs: true,
        };
        let url = format!("{}/biology/arc/evo2/generate", self.base_url);
        let mut result: serde_json::Value = post_json(&self.http, &url, &request, self.timeout).await?;

        let generated = result
            .get("sequence")
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol("generation carried no sequence".to_string()))?;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("input_sequence".to_string(), serde_json::Value::String(sequence.clone()));
        }

        let lead = format!(
            "Predicted continuation of the {}-base input ({} bases):\n\n{}",
            sequence.len(),
            generated.len(),
            generated
        );
        Ok(BackendReply::structured(lead, result))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.base_url, Protocol::Evo2.probe_path());
        probe_url(&self.http, &url, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;

    fn continuation(sequence: &str, num_tokens: Option<u32>) -> BackendPayload {
        let mut payload = BackendPayload::chat(Vec::new());
        payload.params = IntentParams::DnaContinuation { sequence: sequence.to_string(), num_tokens };
        payload
    }

    #[tokio::test]
    async fn test_generate_adds_input_sequence() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/biology/arc/evo2/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "sequence": "TCCATCTGAGGTACCGGG",
                "num_tokens": 20,
                "top_k": 3,
                "enable_sampled_probs": true,
            })))
            .with_status(200)
            .with_body(r#"{"sequence":"TTCATCTCACTAGGGAGTGC","sampled_probs":[0.9],"elapsed_ms":120}"#)
            .create_async()
            .await;

        let descriptor = BackendDescriptor::new("evo2", Domain::GenomicSequence, server.url(), Protocol::Evo2);
        let reply = Evo2Client::new(&descriptor)
            .invoke(&continuation("tccatctgaggtaccggg", Some(20)))
            .await
            .unwrap();
        let metadata = reply.metadata.unwrap();
        assert_eq!(metadata["input_sequence"], "TCCATCTGAGGTACCGGG");
        assert_eq!(metadata["sequence"], "TTCATCTCACTAGGGAGTGC");
        assert!(reply.content.contains("TTCATCTCACTAGGGAGTGC"));
    }

    #[tokio::test]
    async fn test_missing_sequence_field_is_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/biology/arc/evo2/generate")
            .with_status(200)
            .with_body(r#"{"elapsed_ms":120}"#)
            .create_async()
            .await;

        let descriptor = BackendDescriptor::new("evo2", Domain::GenomicSequence, server.url(), Protocol::Evo2);
        let err = Evo2Client::new(&descriptor)
            .invoke(&continuation("ACGTACGTACGT", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[test]
    fn test_dna_validation() {
        assert!(validate_dna("ACGTN").is_ok());
        assert!(validate_dna("ACGU").is_err());
        assert!(validate_dna("").is_err());
    }
}
