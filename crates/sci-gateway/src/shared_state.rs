//! State shared by every request handler.
//!
//! Everything here is either immutable after startup or internally
//! synchronised (registry snapshots, atomic counters), so handlers clone the
//! state freely and never take a lock on the request path.

use anyhow::Context;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::assembler::ResponseAssembler;
use crate::classifier::{ClassifierPolicy, IntentClassifier};
use crate::config::Config;
use crate::orchestrator::{DispatchOrchestrator, OrchestratorConfig};
use crate::registry::CapabilityRegistry;

/// Atomic counters for the admin surface
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub rejected_requests: AtomicUsize,
    pub fallback_responses: AtomicUsize,
    pub partial_responses: AtomicUsize,
    pub failed_responses: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicUsize::new(0),
            rejected_requests: AtomicUsize::new(0),
            fallback_responses: AtomicUsize::new(0),
            partial_responses: AtomicUsize::new(0),
            failed_responses: AtomicUsize::new(0),
        }
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_rejected(&self) -> usize {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_fallback(&self) -> usize {
        self.fallback_responses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_partial(&self) -> usize {
        self.partial_responses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_failed(&self) -> usize {
        self.failed_responses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            fallback_responses: self.fallback_responses.load(Ordering::Relaxed),
            partial_responses: self.partial_responses.load(Ordering::Relaxed),
            failed_responses: self.failed_responses.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub total_requests: usize,
    pub rejected_requests: usize,
    pub fallback_responses: usize,
    pub partial_responses: usize,
    pub failed_responses: usize,
}

/// Application state handed to the axum router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<CapabilityRegistry>,
    pub classifier: Arc<IntentClassifier>,
    pub orchestrator: Arc<DispatchOrchestrator>,
    pub assembler: ResponseAssembler,
    pub counters: Arc<AtomicCounters>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the registry, classifier and orchestrator from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        info!("Initializing gateway state");

        let registry = CapabilityRegistry::from_descriptors(&config.backends)
            .map_err(|e| anyhow::anyhow!("Invalid backend descriptor: {}", e))?;

        let policy = match &config.classifier_policy_file {
            Some(path) => ClassifierPolicy::from_file(Path::new(path))
                .with_context(|| format!("Failed to load classifier policy {}", path))?,
            None => ClassifierPolicy::default(),
        };
        let classifier = IntentClassifier::new(policy, config.confidence_threshold);

        Ok(Self::new(config, Arc::new(registry), classifier))
    }

    pub fn new(config: Config, registry: Arc<CapabilityRegistry>, classifier: IntentClassifier) -> Self {
        let orchestrator = DispatchOrchestrator::new(Arc::clone(&registry), OrchestratorConfig::from(&config));
        Self {
            config: Arc::new(config),
            registry,
            classifier: Arc::new(classifier),
            orchestrator: Arc::new(orchestrator),
            assembler: ResponseAssembler::new(),
            counters: Arc::new(AtomicCounters::new()),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
