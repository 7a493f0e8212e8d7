//! Capability registry: which backend serves which domain, and how healthy
//! it currently is.
//!
//! Readers take an immutable [`RegistrySnapshot`] through an atomic pointer
//! swap and never block. Writers (admin endpoints and the health prober)
//! build a new snapshot and publish it with `rcu`, so a dispatch decision
//! always sees one consistent version of the table.

pub mod descriptor;
pub mod prober;

use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::backend_client::{build_client, BackendClient};
use crate::domain::{Domain, IntentParams};
use crate::metrics;

pub use descriptor::{BackendDescriptor, HealthStatus, Protocol};
pub use prober::{HealthProber, ProbeConfig};

/// One registered backend with its client and concurrency slots.
pub struct BackendEntry {
    pub descriptor: BackendDescriptor,
    pub client: Arc<dyn BackendClient>,
    slots: Arc<Semaphore>,
}

impl BackendEntry {
    fn new(descriptor: BackendDescriptor, client: Arc<dyn BackendClient>) -> Self {
        let slots = Arc::new(Semaphore::new(descriptor.max_concurrency));
        Self { descriptor, client, slots }
    }

    /// Same backend, new health. Client and in-flight slots are shared.
    fn with_health(&self, health: HealthStatus) -> Self {
        let mut descriptor = self.descriptor.clone();
        descriptor.health = health;
        Self {
            descriptor,
            client: Arc::clone(&self.client),
            slots: Arc::clone(&self.slots),
        }
    }

    pub fn slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.slots)
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("descriptor", &self.descriptor)
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

fn health_rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unavailable => 2,
    }
}

/// Immutable view of the registry at one version.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub version: u64,
    entries: Vec<Arc<BackendEntry>>,
}

impl RegistrySnapshot {
    pub fn entries(&self) -> &[Arc<BackendEntry>] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BackendEntry>> {
        self.entries.iter().find(|e| e.descriptor.id == id)
    }

    fn best<'a>(&'a self, candidates: impl Iterator<Item = &'a Arc<BackendEntry>>) -> Option<Arc<BackendEntry>> {
        candidates
            .filter(|e| e.descriptor.health.is_routable())
            .min_by_key(|e| health_rank(e.descriptor.health))
            .cloned()
    }

    /// Routable backend for a domain, preferring healthy over degraded.
    /// Unavailable backends are treated as absent.
    pub fn resolve(&self, domain: Domain) -> Option<Arc<BackendEntry>> {
        self.best(self.entries.iter().filter(|e| e.descriptor.domain == domain))
    }

    /// Like [`resolve`](Self::resolve) but the backend must also speak a
    /// protocol able to serve the task.
    pub fn resolve_for(&self, domain: Domain, params: &IntentParams) -> Option<Arc<BackendEntry>> {
        self.candidates_for(domain, params).into_iter().next()
    }

    /// Every routable backend of `domain` able to serve the task, healthiest
    /// first. Registration order breaks ties.
    pub fn candidates_for(&self, domain: Domain, params: &IntentParams) -> Vec<Arc<BackendEntry>> {
        let mut found: Vec<Arc<BackendEntry>> = self
            .entries
            .iter()
            .filter(|e| {
                e.descriptor.domain == domain
                    && e.descriptor.protocol.supports(params)
                    && e.descriptor.health.is_routable()
            })
            .cloned()
            .collect();
        found.sort_by_key(|e| health_rank(e.descriptor.health));
        found
    }

    /// Best health among the backends serving a domain.
    pub fn health(&self, domain: Domain) -> Option<HealthStatus> {
        self.entries
            .iter()
            .filter(|e| e.descriptor.domain == domain)
            .map(|e| e.descriptor.health)
            .min_by_key(|h| health_rank(*h))
    }

    /// GENERAL backend for a fallback call. Prefers a routable backend other
    /// than `exclude`; as a last resort returns any GENERAL backend even if
    /// it is marked unavailable.
    pub fn fallback_general(&self, exclude: Option<&str>) -> Option<Arc<BackendEntry>> {
        let general = || self.entries.iter().filter(|e| e.descriptor.domain == Domain::General);
        self.best(general().filter(|e| Some(e.descriptor.id.as_str()) != exclude))
            .or_else(|| self.best(general()))
            .or_else(|| general().next().cloned())
    }
}

pub struct CapabilityRegistry {
    inner: ArcSwap<RegistrySnapshot>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    /// Registry pre-populated from configuration.
    pub fn from_descriptors(descriptors: &[BackendDescriptor]) -> Result<Self, String> {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor.clone())?;
        }
        Ok(registry)
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.inner.load().entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn resolve(&self, domain: Domain) -> Option<Arc<BackendEntry>> {
        self.inner.load().resolve(domain)
    }

    pub fn health(&self, domain: Domain) -> Option<HealthStatus> {
        self.inner.load().health(domain)
    }

    /// Register a backend, building its client from the protocol. Replaces
    /// any backend with the same id. Returns the new registry version.
    pub fn register(&self, descriptor: BackendDescriptor) -> Result<u64, String> {
        descriptor.validate()?;
        let client = build_client(&descriptor);
        self.register_with_client(descriptor, client)
    }

    pub fn register_with_client(
        &self,
        descriptor: BackendDescriptor,
        client: Arc<dyn BackendClient>,
    ) -> Result<u64, String> {
        descriptor.validate()?;
        let entry = Arc::new(BackendEntry::new(descriptor, client));
        let previous = self.inner.rcu(|current| {
            let mut entries: Vec<Arc<BackendEntry>> = current
                .entries
                .iter()
                .filter(|e| e.descriptor.id != entry.descriptor.id)
                .cloned()
                .collect();
            entries.push(Arc::clone(&entry));
            RegistrySnapshot {
                version: current.version + 1,
                entries,
            }
        });

        let d = &entry.descriptor;
        info!(
            "Registered backend {} for {} at {} ({})",
            d.id,
            d.domain,
            d.endpoint,
            d.protocol.as_str()
        );
        metrics::set_backend_health(&d.id, d.health);
        Ok(previous.version + 1)
    }

    pub fn deregister(&self, id: &str) -> Option<BackendDescriptor> {
        let mut removed = None;
        self.inner.rcu(|current| {
            removed = current.get(id).map(|e| e.descriptor.clone());
            if removed.is_none() {
                return Arc::clone(current);
            }
            Arc::new(RegistrySnapshot {
                version: current.version + 1,
                entries: current
                    .entries
                    .iter()
                    .filter(|e| e.descriptor.id != id)
                    .cloned()
                    .collect(),
            })
        });
        if removed.is_some() {
            info!("Deregistered backend {}", id);
            metrics::clear_backend_health(id);
        }
        removed
    }

    /// Publish a new health status. Returns the previous status when it
    /// changed, `None` when the backend is unknown or the status is the same.
    pub fn set_health(&self, id: &str, status: HealthStatus) -> Option<HealthStatus> {
        let mut changed_from = None;
        self.inner.rcu(|current| {
            changed_from = None;
            let Some(existing) = current.get(id) else {
                return Arc::clone(current);
            };
            if existing.descriptor.health == status {
                return Arc::clone(current);
            }
            changed_from = Some(existing.descriptor.health);
            Arc::new(RegistrySnapshot {
                version: current.version + 1,
                entries: current
                    .entries
                    .iter()
                    .map(|e| {
                        if e.descriptor.id == id {
                            Arc::new(e.with_health(status))
                        } else {
                            Arc::clone(e)
                        }
                    })
                    .collect(),
            })
        });

        if let Some(previous) = changed_from {
            match status {
                HealthStatus::Unavailable => warn!("Backend {} is now UNAVAILABLE (was {:?})", id, previous),
                _ => info!("Backend {} health {:?} -> {:?}", id, previous, status),
            }
            metrics::set_backend_health(id, status);
        }
        changed_from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;

    fn descriptor(id: &str, domain: Domain, protocol: Protocol) -> BackendDescriptor {
        BackendDescriptor::new(id, domain, format!("http://{}:8000", id), protocol)
    }

    fn register(registry: &CapabilityRegistry, id: &str, domain: Domain, protocol: Protocol) {
        registry
            .register_with_client(
                descriptor(id, domain, protocol),
                Arc::new(ScriptedClient::replying(id, protocol, "ok")),
            )
            .unwrap();
    }

    // ===== Registration =====

    #[test]
    fn test_register_bumps_version_and_replaces_same_id() {
        let registry = CapabilityRegistry::new();
        assert_eq!(registry.version(), 0);

        register(&registry, "general", Domain::General, Protocol::OpenaiChat);
        register(&registry, "esm3", Domain::ProteinStructure, Protocol::Esm3);
        register(&registry, "esm3", Domain::ProteinStructure, Protocol::Esm3);

        assert_eq!(registry.version(), 3);
        assert_eq!(registry.descriptors().len(), 2);
    }

    #[test]
    fn test_invalid_descriptor_is_refused() {
        let registry = CapabilityRegistry::new();
        let bad = BackendDescriptor::new("x", Domain::General, "ftp://x", Protocol::OpenaiChat);
        assert!(registry.register(bad).is_err());
        assert_eq!(registry.version(), 0);
    }

    #[test]
    fn test_deregister_unknown_is_noop() {
        let registry = CapabilityRegistry::new();
        register(&registry, "general", Domain::General, Protocol::OpenaiChat);
        assert!(registry.deregister("nope").is_none());
        assert_eq!(registry.version(), 1);
        assert_eq!(registry.deregister("general").unwrap().id, "general");
        assert_eq!(registry.version(), 2);
        assert!(registry.resolve(Domain::General).is_none());
    }

    // ===== Resolution =====

    #[test]
    fn test_unavailable_backend_resolves_as_absent() {
        let registry = CapabilityRegistry::new();
        register(&registry, "esm3", Domain::ProteinStructure, Protocol::Esm3);
        assert!(registry.resolve(Domain::ProteinStructure).is_some());

        registry.set_health("esm3", HealthStatus::Unavailable);
        assert!(registry.resolve(Domain::ProteinStructure).is_none());
        assert_eq!(registry.health(Domain::ProteinStructure), Some(HealthStatus::Unavailable));
    }

    #[test]
    fn test_healthy_preferred_over_degraded() {
        let registry = CapabilityRegistry::new();
        register(&registry, "g1", Domain::General, Protocol::OpenaiChat);
        register(&registry, "g2", Domain::General, Protocol::OpenaiChat);
        registry.set_health("g1", HealthStatus::Degraded);

        assert_eq!(registry.resolve(Domain::General).unwrap().descriptor.id, "g2");
        registry.set_health("g2", HealthStatus::Unavailable);
        assert_eq!(registry.resolve(Domain::General).unwrap().descriptor.id, "g1");
    }

    #[test]
    fn test_resolve_for_matches_task() {
        let registry = CapabilityRegistry::new();
        register(&registry, "esm3", Domain::ProteinStructure, Protocol::Esm3);
        register(&registry, "af2", Domain::ProteinStructure, Protocol::Alphafold2);

        let fold = IntentParams::ProteinStructure { sequences: vec!["MKT".into()] };
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.resolve_for(Domain::ProteinStructure, &fold).unwrap().descriptor.id, "af2");
        assert!(snapshot.resolve_for(Domain::ProteinStructure, &IntentParams::Chat).is_none());
    }

    #[test]
    fn test_candidates_are_ordered_by_health() {
        let registry = CapabilityRegistry::new();
        register(&registry, "esm3-a", Domain::ProteinStructure, Protocol::Esm3);
        register(&registry, "esm3-b", Domain::ProteinStructure, Protocol::Esm3);
        register(&registry, "esm3-c", Domain::ProteinStructure, Protocol::Esm3);
        registry.set_health("esm3-a", HealthStatus::Degraded);
        registry.set_health("esm3-c", HealthStatus::Unavailable);

        let completion = IntentParams::ProteinCompletion {
            sequence: "MKTAYIAKQR".into(),
            left_len: None,
            right_len: None,
            extra_sequences: Vec::new(),
        };
        let ids: Vec<String> = registry
            .snapshot()
            .candidates_for(Domain::ProteinStructure, &completion)
            .iter()
            .map(|e| e.descriptor.id.clone())
            .collect();
        assert_eq!(ids, vec!["esm3-b".to_string(), "esm3-a".to_string()]);
    }

    #[test]
    fn test_fallback_general_prefers_other_backend() {
        let registry = CapabilityRegistry::new();
        register(&registry, "g1", Domain::General, Protocol::OpenaiChat);
        register(&registry, "g2", Domain::General, Protocol::OpenaiChat);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.fallback_general(Some("g1")).unwrap().descriptor.id, "g2");

        registry.set_health("g1", HealthStatus::Unavailable);
        registry.set_health("g2", HealthStatus::Unavailable);
        // Last resort still yields a GENERAL backend.
        assert!(registry.snapshot().fallback_general(None).is_some());
    }

    // ===== Health updates =====

    #[test]
    fn test_set_health_only_publishes_changes() {
        let registry = CapabilityRegistry::new();
        register(&registry, "evo2", Domain::GenomicSequence, Protocol::Evo2);
        let v = registry.version();

        assert_eq!(registry.set_health("evo2", HealthStatus::Healthy), None);
        assert_eq!(registry.version(), v);
        assert_eq!(registry.set_health("evo2", HealthStatus::Degraded), Some(HealthStatus::Healthy));
        assert_eq!(registry.version(), v + 1);
        assert_eq!(registry.set_health("missing", HealthStatus::Degraded), None);
    }

    #[test]
    fn test_health_change_keeps_slots_shared() {
        let registry = CapabilityRegistry::new();
        register(&registry, "evo2", Domain::GenomicSequence, Protocol::Evo2);
        let before = registry.resolve(Domain::GenomicSequence).unwrap();
        let _permit = before.slots().try_acquire_owned().unwrap();

        registry.set_health("evo2", HealthStatus::Degraded);
        let after = registry.resolve(Domain::GenomicSequence).unwrap();
        assert_eq!(after.available_slots(), before.available_slots());
        assert_eq!(after.available_slots(), 3);
    }

    #[test]
    fn test_old_snapshot_is_stable_after_write() {
        let registry = CapabilityRegistry::new();
        register(&registry, "general", Domain::General, Protocol::OpenaiChat);
        let old = registry.snapshot();
        registry.deregister("general");
        assert!(old.resolve(Domain::General).is_some());
        assert!(registry.snapshot().resolve(Domain::General).is_none());
    }
}
