use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{Domain, IntentParams};

/// Health of one backend as last observed by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthStatus {
    /// Whether dispatch may pick this backend at all.
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthStatus::Unavailable)
    }

    pub fn gauge_value(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unavailable => 0,
        }
    }
}

/// Wire dialect a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// OpenAI-compatible `/v1/chat/completions` (general LLM, spectrum LoRA).
    OpenaiChat,
    /// ESM3 `/generate-sequence` protein completion.
    Esm3,
    /// AlphaFold2 multimer structure prediction.
    Alphafold2,
    /// Evo2 DNA continuation.
    Evo2,
    /// MatterGen crystal generation.
    Mattergen,
    /// Aerodynamic field prediction, multipart upload.
    FieldPredict,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenaiChat => "openai_chat",
            Protocol::Esm3 => "esm3",
            Protocol::Alphafold2 => "alphafold2",
            Protocol::Evo2 => "evo2",
            Protocol::Mattergen => "mattergen",
            Protocol::FieldPredict => "field_predict",
        }
    }

    /// Whether a backend speaking this dialect can serve the given task.
    pub fn supports(&self, params: &IntentParams) -> bool {
        matches!(
            (self, params),
            (Protocol::OpenaiChat, IntentParams::Chat)
                | (Protocol::OpenaiChat, IntentParams::Spectrum { .. })
                | (Protocol::Esm3, IntentParams::ProteinCompletion { .. })
                | (Protocol::Alphafold2, IntentParams::ProteinStructure { .. })
                | (Protocol::Evo2, IntentParams::DnaContinuation { .. })
                | (Protocol::Mattergen, IntentParams::Materials { .. })
                | (Protocol::FieldPredict, IntentParams::Field { .. })
        )
    }

    pub fn streams_natively(&self) -> bool {
        matches!(self, Protocol::OpenaiChat)
    }

    /// Path answered by a live backend of this dialect.
    pub fn probe_path(&self) -> &'static str {
        match self {
            Protocol::OpenaiChat => "/v1/models",
            Protocol::Alphafold2 | Protocol::Evo2 => "/v1/health/ready",
            Protocol::Esm3 | Protocol::Mattergen | Protocol::FieldPredict => "/openapi.json",
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout_seconds() -> u64 {
    300
}

/// Everything dispatch needs to know about one backend. Owned by the
/// registry and replaced wholesale on every health change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub domain: Domain,
    pub endpoint: String,
    pub protocol: Protocol,
    /// Model name sent to OpenAI-compatible backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub health: HealthStatus,
}

impl BackendDescriptor {
    pub fn new(
        id: impl Into<String>,
        domain: Domain,
        endpoint: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            id: id.into(),
            domain,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            protocol,
            model: None,
            max_concurrency: default_max_concurrency(),
            timeout_seconds: default_timeout_seconds(),
            health: HealthStatus::Healthy,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("backend id must not be empty".to_string());
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(format!("backend {} endpoint must be an http(s) URL", self.id));
        }
        if self.max_concurrency == 0 {
            return Err(format!("backend {} max_concurrency must be positive", self.id));
        }
        if self.timeout_seconds == 0 {
            return Err(format!("backend {} timeout must be positive", self.id));
        }
        if self.domain == Domain::General && self.protocol != Protocol::OpenaiChat {
            return Err(format!("general backend {} must speak openai_chat", self.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_trims_trailing_slash() {
        let d = BackendDescriptor::new("esm3", Domain::ProteinStructure, "http://esm3:8000/", Protocol::Esm3);
        assert_eq!(d.endpoint, "http://esm3:8000");
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let d: BackendDescriptor = serde_json::from_str(
            r#"{"id":"evo2","domain":"genomic_sequence","endpoint":"http://evo2:8000","protocol":"evo2"}"#,
        )
        .unwrap();
        assert_eq!(d.max_concurrency, 4);
        assert_eq!(d.timeout(), Duration::from_secs(300));
        assert_eq!(d.health, HealthStatus::Healthy);
    }

    #[test]
    fn test_general_backend_must_be_chat() {
        let d = BackendDescriptor::new("g", Domain::General, "http://llm:8000", Protocol::Evo2);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_protocol_task_support() {
        let chat = IntentParams::Chat;
        let dna = IntentParams::DnaContinuation { sequence: "ACGT".into(), num_tokens: None };
        assert!(Protocol::OpenaiChat.supports(&chat));
        assert!(!Protocol::OpenaiChat.supports(&dna));
        assert!(Protocol::Evo2.supports(&dna));
        assert!(!Protocol::Esm3.supports(&dna));
    }

    #[test]
    fn test_unavailable_is_not_routable() {
        assert!(HealthStatus::Degraded.is_routable());
        assert!(!HealthStatus::Unavailable.is_routable());
    }
}
