//! Background health prober.
//!
//! Sole writer of backend health. Each tick probes every registered
//! backend concurrently; a backend becomes UNAVAILABLE after N consecutive
//! failed probes, DEGRADED after a single failure or a slow answer, and
//! HEALTHY again after one fast success.

use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BackendEntry, CapabilityRegistry, HealthStatus};
use crate::config::Config;

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub unavailable_after_failures: u32,
    pub degraded_latency: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            unavailable_after_failures: 3,
            degraded_latency: Duration::from_millis(2000),
        }
    }
}

impl From<&Config> for ProbeConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.health_probe_interval_seconds.max(1)),
            timeout: Duration::from_secs(config.health_probe_timeout_seconds.max(1)),
            unavailable_after_failures: config.unavailable_after_failures.max(1),
            degraded_latency: Duration::from_millis(config.degraded_latency_ms),
        }
    }
}

pub struct HealthProber {
    registry: Arc<CapabilityRegistry>,
    config: ProbeConfig,
    consecutive_failures: DashMap<String, u32>,
}

impl HealthProber {
    pub fn new(registry: Arc<CapabilityRegistry>, config: ProbeConfig) -> Self {
        Self {
            registry,
            config,
            consecutive_failures: DashMap::new(),
        }
    }

    /// Run until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Health prober started (interval {:?})", self.config.interval);
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Health prober stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                }
            }
        })
    }

    /// Probe every backend once and publish the resulting statuses.
    pub async fn probe_once(&self) -> Vec<(String, HealthStatus)> {
        let snapshot = self.registry.snapshot();
        let probes = snapshot.entries().iter().map(|entry| self.probe_entry(entry));
        let results = join_all(probes).await;

        // Forget counters of backends that were deregistered meanwhile.
        self.consecutive_failures
            .retain(|id, _| snapshot.get(id).is_some());

        for (id, status) in &results {
            self.registry.set_health(id, *status);
        }
        results
    }

    async fn probe_entry(&self, entry: &Arc<BackendEntry>) -> (String, HealthStatus) {
        let id = entry.descriptor.id.clone();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, entry.client.probe()).await;
        let latency = started.elapsed();

        let status = match outcome {
            Ok(Ok(())) => {
                self.consecutive_failures.remove(&id);
                if latency > self.config.degraded_latency {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", id, e);
                self.record_failure(&id)
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", id, self.config.timeout);
                self.record_failure(&id)
            }
        };
        (id, status)
    }

    fn record_failure(&self, id: &str) -> HealthStatus {
        let mut failures = self.consecutive_failures.entry(id.to_string()).or_insert(0);
        *failures += 1;
        if *failures >= self.config.unavailable_after_failures {
            HealthStatus::Unavailable
        } else {
            HealthStatus::Degraded
        }
    }
}
