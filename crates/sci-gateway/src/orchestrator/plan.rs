//! Dispatch planning: which backends to call, with what, in what shape.

use std::sync::Arc;

use crate::backend_client::BackendPayload;
use crate::domain::{Domain, DomainIntent, IntentParams};
use crate::error::GatewayError;
use crate::protocol::ChatRequest;
use crate::registry::{BackendEntry, HealthStatus, RegistrySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Calls run one after another; the first success ends the chain.
    Chain,
    /// Calls run concurrently and every reply is kept.
    FanOut,
}

#[derive(Debug, Clone)]
pub struct BackendCall {
    pub backend: Arc<BackendEntry>,
    pub payload: BackendPayload,
    pub is_fallback: bool,
}

impl BackendCall {
    pub fn new(backend: Arc<BackendEntry>, payload: BackendPayload, is_fallback: bool) -> Self {
        Self {
            backend,
            payload,
            is_fallback,
        }
    }

    /// Plain chat call to a GENERAL backend on behalf of a request.
    pub fn fallback(backend: Arc<BackendEntry>, request: &ChatRequest) -> Self {
        Self::new(backend, BackendPayload::for_request(IntentParams::Chat, request), true)
    }

    pub fn backend_id(&self) -> &str {
        &self.backend.descriptor.id
    }

    pub fn domain(&self) -> Domain {
        self.backend.descriptor.domain
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub mode: PlanMode,
    pub calls: Vec<BackendCall>,
    pub primary_domain: Domain,
    /// Set when the plan already routes to the general model in place of
    /// the classified domain.
    pub fallback_reason: Option<String>,
}

impl DispatchPlan {
    pub fn build(
        intent: &DomainIntent,
        request: &ChatRequest,
        snapshot: &RegistrySnapshot,
        threshold: f32,
    ) -> Self {
        let domain = intent.domain;

        if !domain.is_specialized() {
            let calls = snapshot
                .resolve_for(Domain::General, &IntentParams::Chat)
                .map(|entry| {
                    BackendCall::new(entry, BackendPayload::for_request(IntentParams::Chat, request), false)
                })
                .into_iter()
                .collect();
            return Self {
                mode: PlanMode::Chain,
                calls,
                primary_domain: domain,
                fallback_reason: None,
            };
        }

        if !intent.meets(threshold) {
            let reason = format!(
                "routing confidence {:.2} is below the {:.2} threshold",
                intent.confidence, threshold
            );
            return Self::general_instead(domain, request, snapshot, reason);
        }

        let candidates = snapshot.candidates_for(domain, &intent.params);
        let Some(best) = candidates.first().cloned() else {
            let reason = match snapshot.health(domain) {
                Some(HealthStatus::Unavailable) => "backend is unavailable".to_string(),
                Some(_) => format!("no registered backend accepts {} tasks", intent.params.task_name()),
                None => "no backend is registered".to_string(),
            };
            return Self::general_instead(domain, request, snapshot, reason);
        };

        let parts = intent.params.split();
        if parts.len() > 1 {
            let calls = parts
                .into_iter()
                .map(|params| {
                    BackendCall::new(Arc::clone(&best), BackendPayload::for_request(params, request), false)
                })
                .collect();
            return Self {
                mode: PlanMode::FanOut,
                calls,
                primary_domain: domain,
                fallback_reason: None,
            };
        }

        let calls = candidates
            .into_iter()
            .map(|entry| {
                BackendCall::new(entry, BackendPayload::for_request(intent.params.clone(), request), false)
            })
            .collect();
        Self {
            mode: PlanMode::Chain,
            calls,
            primary_domain: domain,
            fallback_reason: None,
        }
    }

    fn general_instead(
        domain: Domain,
        request: &ChatRequest,
        snapshot: &RegistrySnapshot,
        reason: String,
    ) -> Self {
        Self {
            mode: PlanMode::Chain,
            calls: snapshot
                .fallback_general(None)
                .map(|entry| BackendCall::fallback(entry, request))
                .into_iter()
                .collect(),
            primary_domain: domain,
            fallback_reason: Some(reason),
        }
    }

    /// Never leave a request unrouted: an empty plan gets a GENERAL
    /// fallback call, and only a registry without any GENERAL backend fails.
    pub fn ensure_routed(mut self, request: &ChatRequest, snapshot: &RegistrySnapshot) -> Result<Self, GatewayError> {
        if !self.calls.is_empty() {
            return Ok(self);
        }
        let entry = snapshot.fallback_general(None).ok_or_else(|| GatewayError::BackendUnavailable {
            domain: Domain::General,
            reason: "no general backend is registered".to_string(),
        })?;
        self.mode = PlanMode::Chain;
        self.calls.push(BackendCall::fallback(entry, request));
        self.fallback_reason
            .get_or_insert_with(|| "no routable backend could serve the request".to_string());
        Ok(self)
    }

    pub fn is_fallback_only(&self) -> bool {
        !self.calls.is_empty() && self.calls.iter().all(|c| c.is_fallback)
    }
}
