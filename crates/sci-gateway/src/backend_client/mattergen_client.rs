use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::http::{build_http_client, post_json, probe_url};
use super::{BackendClient, BackendError, BackendPayload, BackendReply};
use crate::domain::IntentParams;
use crate::registry::{BackendDescriptor, Protocol};

const BASE_MODEL: &str = "mattergen_base";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model_name: &'a str,
    batch_size: u32,
    num_batches: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties_to_condition_on: Option<&'a serde_json::Map<String, serde_json::Value>>,
}

/// Crystal structure generation, optionally conditioned on target
/// properties such as `dft_mag_density`.
pub struct MatterGenClient {
    id: String,
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl MatterGenClient {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            base_url: descriptor.endpoint.clone(),
            model: descriptor.model.clone().unwrap_or_else(|| BASE_MODEL.to_string()),
            timeout: descriptor.timeout(),
            http: build_http_client(descriptor.timeout()),
        }
    }
}

/// Drop volatile timing data so identical generations render identically.
fn clean(mut response: serde_json::Value) -> serde_json::Value {
    if let Some(data) = response.get_mut("data").and_then(|d| d.as_object_mut()) {
        data.remove("generation_time");
    }
    response
}

#[async_trait]
impl BackendClient for MatterGenClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Mattergen
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let IntentParams::Materials { batch_size, num_batches, properties } = &payload.params else {
            return Err(BackendError::InvalidPayload(format!(
                "mattergen cannot serve task {}",
                payload.params.task_name()
            )));
        };
        let batch_size = batch_size.unwrap_or(16).max(1);
        let num_batches = num_batches.unwrap_or(1).max(1);
        let properties = properties.as_ref().filter(|p| !p.is_empty());

        let request = GenerateRequest {
            model_name: &self.model,
            batch_size,
            num_batches,
            properties_to_condition_on: properties,
        };
        let url = format!("{}/generate", self.base_url);
        let response: serde_json::Value = post_json(&self.http, &url, &request, self.timeout).await?;

        if let Some(code) = response.get("code").and_then(|c| c.as_u64()) {
            if code != 200 {
                let message = response
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("generation failed")
                    .to_string();
                return Err(BackendError::Rejected { status: code as u16, body: message });
            }
        }

        let total = batch_size * num_batches;
        let lead = match properties {
            Some(props) => format!(
                "Generated {} candidate crystal structures conditioned on {}.",
                total,
                props.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
            None => format!("Generated {} candidate crystal structures.", total),
        };
        Ok(BackendReply::structured(lead, clean(response)))
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}{}", self.base_url, Protocol::Mattergen.probe_path());
        probe_url(&self.http, &url, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;

    fn materials(properties: Option<serde_json::Value>) -> BackendPayload {
        let mut payload = BackendPayload::chat(Vec::new());
        payload.params = IntentParams::Materials {
            batch_size: Some(4),
            num_batches: None,
            properties: properties.and_then(|p| p.as_object().cloned()),
        };
        payload
    }

    #[tokio::test]
    async fn test_generation_time_is_stripped() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model_name": "mattergen_base",
                "batch_size": 4,
                "num_batches": 1,
                "properties_to_condition_on": {"dft_mag_density": 0.15},
            })))
            .with_status(200)
            .with_body(r#"{"code":200,"message":"ok","data":{"cif_url":"http://files/x.zip","generation_time":12.5}}"#)
            .create_async()
            .await;

        let descriptor = BackendDescriptor::new("mattergen", Domain::MaterialsGeneration, server.url(), Protocol::Mattergen);
        let reply = MatterGenClient::new(&descriptor)
            .invoke(&materials(Some(serde_json::json!({"dft_mag_density": 0.15}))))
            .await
            .unwrap();
        let metadata = reply.metadata.unwrap();
        assert!(metadata["data"].get("generation_time").is_none());
        assert_eq!(metadata["data"]["cif_url"], "http://files/x.zip");
        assert!(reply.content.contains("dft_mag_density"));
    }

    #[tokio::test]
    async fn test_error_code_in_body_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/generate")
            .with_status(200)
            .with_body(r#"{"code":500,"message":"CUDA out of memory","data":null}"#)
            .create_async()
            .await;

        let descriptor = BackendDescriptor::new("mattergen", Domain::MaterialsGeneration, server.url(), Protocol::Mattergen);
        let err = MatterGenClient::new(&descriptor).invoke(&materials(None)).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected { status: 500, .. }));
    }
}
