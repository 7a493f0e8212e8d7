use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::http::{build_http_client, post_json, probe_url};
use super::{BackendClient, BackendError, BackendPayload, BackendReply};
use crate::domain::IntentParams;
use crate::registry::{BackendDescriptor, Protocol};

pub const AMINO_ACIDS: &str = "ACDEFGHIKLMNPQRSTVWY";
pub const MAX_SEQUENCE_LEN: usize = 300;
const DEFAULT_FLANK: u32 = 50;
const NUM_STEPS: u32 = 15;
const TEMPERATURE: f32 = 0.6;
const MASK: char = '_';

#[derive(Debug, Serialize)]
struct GenerateRequest {
    sequence: String,
    num_steps: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    sequence: String,
}

/// Masked protein completion: the core sequence is padded with mask
/// tokens on either side and the model fills them in.
pub struct Esm3Client {
    id: String,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl Esm3Client {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            base_url: descriptor.endpoint.clone(),
            timeout: descriptor.timeout(),
            http: build_http_client(descriptor.timeout()),
        }
    }
}

pub fn validate_sequence(sequence: &str) -> Result<(), BackendError> {
    if sequence.is_empty() || sequence.len() > MAX_SEQUENCE_LEN {
        return Err(BackendError::InvalidPayload(format!(
            "protein sequence must be 1..={} residues, got {}",
            MAX_SEQUENCE_LEN,
            sequence.len()
        )));
    }
    if let Some(bad) = sequence.chars().find(|c| !AMINO_ACIDS.contains(*c)) {
        return Err(BackendError::InvalidPayload(format!(
            "protein sequence contains invalid residue '{}'",
            bad
        )));
    }
    Ok(())
}

fn padded(sequence: &str, left: u32, right: u32) -> String {
    let mut out = String::with_capacity(sequence.len() + (left + right) as usize);
    out.extend(std::iter::repeat(MASK).take(left as usize));
    out.push_str(sequence);
    out.extend(std::iter::repeat(MASK).take(right as usize));
    out
}

/// The completed sequence must keep the core residues where they were.
fn check_anchor(completed: &str, core: &str, left: u32, right: u32) -> Result<(), BackendError> {
    let expected_len = core.len() + (left + right) as usize;
    if completed.len() != expected_len || !completed.is_ascii() {
        return Err(BackendError::Protocol(format!(
            "completed sequence has length {}, expected {}",
            completed.len(),
            expected_len
        )));
    }
    let start = left as usize;
    if !completed[start..start + core.len()].eq_ignore_ascii_case(core) {
        return Err(BackendError::Protocol(
            "completed sequence does not preserve the input residues".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl BackendClient for Esm3Client {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Esm3
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let IntentParams::ProteinCompletion { sequence, left_len, right_len, .. } = &payload.params else {
            return Err(BackendError::InvalidPayload(format!(
                "esm3 cannot serve task {}",
                payload.params.task_name()
            )));
        };
        let core = sequence.trim().to_ascii_uppercase();
        validate_sequence(&core)?;
        let left = left_len.unwrap_or(DEFAULT_FLANK);
        let right = right_len.unwrap_or(DEFAULT_FLANK);

        let request = GenerateRequest {
            sequence: padded(&core, left, right),
            num_steps: NUM_STEPS,
            temperature: TEMPERATURE,
        };
        let url = format!("{}/generate-sequence", self.base_url);
        let response: GenerateResponse = post_json(&self.http, &url, &request, self.timeout).await?;

        let completed = response.sequence.trim().to_string();
        check_anchor(&completed, &core, left, right)?;

        let lead = format!(
            "Completed protein sequence ({} residues; {} added at the N-terminus, {} at the C-terminus):\n\n{}",
            completed.len(),
            left,
            right,
            completed
        );
        let metadata = serde_json::json!({
            "input_sequence": core,
            "left_length": left,
            "right_length": right,
            "sequence": completed,
        });
        Ok(BackendReply::structured(lead, metadata))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.base_url, Protocol::Esm3.probe_path());
        probe_url(&self.http, &url, self.timeout).await
    }
}
