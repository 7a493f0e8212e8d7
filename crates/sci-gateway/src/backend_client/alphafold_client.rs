use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::esm3_client::validate_sequence;
use super::http::{build_http_client, post_json, probe_url};
use super::{BackendClient, BackendError, BackendPayload, BackendReply};
use crate::domain::IntentParams;
use crate::registry::{BackendDescriptor, Protocol};

/// Multimer structure prediction request. Search settings are fixed to the
/// service's recommended values.
#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    sequences: &'a [String],
    algorithm: &'static str,
    skip_template_search: bool,
    bit_score: f64,
    databases: [&'static str; 3],
    e_value: f64,
    iterations: u32,
    num_predictions_per_model: u32,
    relax_prediction: bool,
}

impl<'a> PredictRequest<'a> {
    fn new(sequences: &'a [String]) -> Self {
        Self {
            sequences,
            algorithm: "jackhmmer",
            skip_template_search: true,
            bit_score: -1.0,
            databases: ["uniref90", "small_bfd", "mgnify"],
            e_value: 0.0001,
            iterations: 1,
            num_predictions_per_model: 1,
            relax_prediction: true,
        }
    }
}

pub struct AlphaFoldClient {
    id: String,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl AlphaFoldClient {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            base_url: descriptor.endpoint.clone(),
            timeout: descriptor.timeout(),
            http: build_http_client(descriptor.timeout()),
        }
    }
}

#[async_trait]
impl BackendClient for AlphaFoldClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Alphafold2
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let IntentParams::ProteinStructure { sequences } = &payload.params else {
            return Err(BackendError::InvalidPayload(format!(
                "alphafold2 cannot serve task {}",
                payload.params.task_name()
            )));
        };
        if sequences.is_empty() {
            return Err(BackendError::InvalidPayload("no chains to fold".to_string()));
        }
        for sequence in sequences {
            validate_sequence(sequence)?;
        }

        let url = format!(
            "{}/alphaFold2/multimer/predict-structure-from-sequences",
            self.base_url
        );
        let prediction: serde_json::Value =
            post_json(&self.http, &url, &PredictRequest::new(sequences), self.timeout).await?;
        if prediction.is_null() {
            return Err(BackendError::Protocol("empty structure prediction".to_string()));
        }

        let lead = format!(
            "Predicted 3D structure for a complex of {} chain{}.",
            sequences.len(),
            if sequences.len() == 1 { "" } else { "s" }
        );
        Ok(BackendReply::structured(lead, prediction))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.base_url, Protocol::Alphafold2.probe_path());
        probe_url(&self.http, &url, self.timeout).await
    }
}
