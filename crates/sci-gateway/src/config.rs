// sci-gateway/crates/sci-gateway/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::Domain;
use crate::registry::{BackendDescriptor, Protocol};

/// Known backend slots. Each is enabled when `<PREFIX>_BACKEND_URL` is set.
struct BackendSlot {
    prefix: &'static str,
    id: &'static str,
    domain: Domain,
    protocol: Protocol,
    default_model: Option<&'static str>,
}

const BACKEND_SLOTS: &[BackendSlot] = &[
    BackendSlot { prefix: "GENERAL", id: "general", domain: Domain::General, protocol: Protocol::OpenaiChat, default_model: Some("S1-Base") },
    BackendSlot { prefix: "ESM3", id: "esm3", domain: Domain::ProteinStructure, protocol: Protocol::Esm3, default_model: None },
    BackendSlot { prefix: "ALPHAFOLD2", id: "alphafold2", domain: Domain::ProteinStructure, protocol: Protocol::Alphafold2, default_model: None },
    BackendSlot { prefix: "EVO2", id: "evo2", domain: Domain::GenomicSequence, protocol: Protocol::Evo2, default_model: None },
    BackendSlot { prefix: "SPECTRUM", id: "spectrum", domain: Domain::SpectralAnalysis, protocol: Protocol::OpenaiChat, default_model: Some("spectrum") },
    BackendSlot { prefix: "MATTERGEN", id: "mattergen", domain: Domain::MaterialsGeneration, protocol: Protocol::Mattergen, default_model: None },
    BackendSlot { prefix: "FIELD", id: "field", domain: Domain::FieldSimulation, protocol: Protocol::FieldPredict, default_model: None },
];

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub served_models: Vec<String>,
    pub confidence_threshold: f32,
    pub dispatch_budget_seconds: u64,
    pub default_call_timeout_seconds: u64,
    pub default_max_concurrency: usize,
    pub health_probe_interval_seconds: u64,
    pub health_probe_timeout_seconds: u64,
    pub unavailable_after_failures: u32,
    pub degraded_latency_ms: u64,
    pub backend_retries: u32,
    pub request_timeout_seconds: u64,
    /// Optional JSON file overriding the built-in classification rules.
    pub classifier_policy_file: Option<String>,
    pub backends: Vec<BackendDescriptor>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_source(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_source<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_call_timeout_seconds: u64 = parse_or(&get, "DEFAULT_CALL_TIMEOUT_SECONDS", 300)?;
        let default_max_concurrency: usize = parse_or(&get, "DEFAULT_MAX_CONCURRENCY", 4)?;

        let backends = match get("BACKENDS_FILE") {
            Some(path) => Self::load_backends_file(Path::new(&path))?,
            None => Self::backends_from_source(&get, default_call_timeout_seconds, default_max_concurrency)?,
        };

        let served_models: Vec<String> = get("SERVED_MODELS")
            .unwrap_or_else(|| "S1-Base".into())
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        let confidence_threshold: f32 = parse_or(&get, "CONFIDENCE_THRESHOLD", 0.5)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(anyhow::anyhow!(
                "CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                confidence_threshold
            ));
        }

        let config = Self {
            api_host: get("API_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            api_port: parse_or(&get, "API_PORT", 8000)?,
            served_models,
            confidence_threshold,
            dispatch_budget_seconds: parse_or(&get, "DISPATCH_BUDGET_SECONDS", 600)?,
            default_call_timeout_seconds,
            default_max_concurrency,
            health_probe_interval_seconds: parse_or(&get, "HEALTH_PROBE_INTERVAL_SECONDS", 15)?,
            health_probe_timeout_seconds: parse_or(&get, "HEALTH_PROBE_TIMEOUT_SECONDS", 5)?,
            unavailable_after_failures: parse_or(&get, "UNAVAILABLE_AFTER_FAILURES", 3)?,
            degraded_latency_ms: parse_or(&get, "DEGRADED_LATENCY_MS", 2000)?,
            backend_retries: parse_or(&get, "BACKEND_RETRIES", 1)?,
            request_timeout_seconds: parse_or(&get, "REQUEST_TIMEOUT_SECONDS", 900)?,
            classifier_policy_file: get("CLASSIFIER_POLICY_FILE"),
            backends,
        };

        config.validate()?;
        Ok(config)
    }

    fn backends_from_source<F>(
        get: &F,
        default_timeout: u64,
        default_concurrency: usize,
    ) -> Result<Vec<BackendDescriptor>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut backends = Vec::new();
        for slot in BACKEND_SLOTS {
            let Some(url) = get(&format!("{}_BACKEND_URL", slot.prefix)) else {
                continue;
            };
            let mut descriptor = BackendDescriptor::new(slot.id, slot.domain, url, slot.protocol)
                .with_timeout(Duration::from_secs(parse_or(
                    get,
                    &format!("{}_TIMEOUT_SECONDS", slot.prefix),
                    default_timeout,
                )?))
                .with_max_concurrency(parse_or(
                    get,
                    &format!("{}_MAX_CONCURRENCY", slot.prefix),
                    default_concurrency,
                )?);
            let model = get(&format!("{}_MODEL_NAME", slot.prefix))
                .or_else(|| slot.default_model.map(str::to_string));
            if let Some(model) = model {
                descriptor = descriptor.with_model(model);
            }
            backends.push(descriptor);
        }
        Ok(backends)
    }

    /// Read a JSON array of backend descriptors.
    pub fn load_backends_file(path: &Path) -> Result<Vec<BackendDescriptor>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read backends file {}", path.display()))?;
        let backends: Vec<BackendDescriptor> = serde_json::from_str(&raw)
            .with_context(|| format!("Backends file {} is not a valid descriptor list", path.display()))?;
        info!("Loaded {} backend descriptors from {}", backends.len(), path.display());
        Ok(backends)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backends.iter().any(|b| b.domain == Domain::General) {
            return Err(anyhow::anyhow!(
                "No GENERAL backend configured. Set GENERAL_BACKEND_URL; it is the mandatory fallback."
            ));
        }
        for backend in &self.backends {
            backend.validate().map_err(|e| anyhow::anyhow!(e))?;
        }
        if self.served_models.is_empty() {
            return Err(anyhow::anyhow!("SERVED_MODELS must name at least one model"));
        }
        if self.dispatch_budget_seconds == 0 {
            return Err(anyhow::anyhow!("DISPATCH_BUDGET_SECONDS must be positive"));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Served Models: {}", self.served_models.join(", "));
        info!("- Confidence Threshold: {}", self.confidence_threshold);
        info!("- Dispatch Budget: {}s", self.dispatch_budget_seconds);
        info!("- Health Probe: every {}s (timeout {}s)", self.health_probe_interval_seconds, self.health_probe_timeout_seconds);
        info!("- Backend Retries: {}", self.backend_retries);
        if let Some(policy) = &self.classifier_policy_file {
            info!("- Classifier Policy: {}", policy);
        }
        for b in &self.backends {
            info!(
                "- Backend {} [{}] {} via {} (concurrency {}, timeout {}s)",
                b.id, b.domain, b.endpoint, b.protocol.as_str(), b.max_concurrency, b.timeout_seconds
            );
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    pub fn dispatch_budget(&self) -> Duration {
        Duration::from_secs(self.dispatch_budget_seconds)
    }

    pub fn is_served_model(&self, model: &str) -> bool {
        self.served_models.iter().any(|m| m == model)
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}
