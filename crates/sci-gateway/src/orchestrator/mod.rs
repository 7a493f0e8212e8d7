//! Dispatch orchestration.
//!
//! Turns a classified intent into backend calls, runs them under the
//! per-backend concurrency limits and timeouts, and guarantees one fallback
//! call to the general model when the primary calls fail. The whole request
//! is bounded by a wall-clock budget; when it runs out, outstanding calls are
//! dropped (which releases their slots) and whatever already finished is
//! returned as a partial outcome.

pub mod plan;
pub mod result;
pub mod state;

use futures_util::{future::join_all, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backend_client::{BackendDelta, BackendError, BackendReply, RetryPolicy};
use crate::config::Config;
use crate::domain::DomainIntent;
use crate::error::GatewayError;
use crate::metrics;
use crate::protocol::ChatRequest;
use crate::registry::CapabilityRegistry;

pub use plan::{BackendCall, DispatchPlan, PlanMode};
pub use result::{BackendResult, DispatchOutcome, ErrorKind};
pub use state::{DispatchStage, StageTracker};

const STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum confidence for routing to a specialized backend.
    pub confidence_threshold: f32,
    /// Wall-clock ceiling for all calls of one request, fallback included.
    pub budget: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            budget: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            budget: config.dispatch_budget(),
            retry: RetryPolicy::new(config.backend_retries),
        }
    }
}

/// Item of a streamed dispatch.
#[derive(Debug)]
pub enum StreamEvent {
    /// Backend increment, forwarded as soon as it arrives.
    Delta(BackendDelta),
    /// Always the last event.
    Completed(DispatchOutcome),
}

pub struct DispatchOrchestrator {
    registry: Arc<CapabilityRegistry>,
    config: OrchestratorConfig,
}

fn step(stages: &mut StageTracker, next: DispatchStage) {
    if let Err(e) = stages.advance(next) {
        warn!("{}", e);
    }
}

impl DispatchOrchestrator {
    pub fn new(registry: Arc<CapabilityRegistry>, config: OrchestratorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn plan(&self, intent: &DomainIntent, request: &ChatRequest) -> Result<DispatchPlan, GatewayError> {
        if !request.has_user_message() {
            return Err(GatewayError::InvalidRequest(
                "request contains no user message".to_string(),
            ));
        }
        let snapshot = self.registry.snapshot();
        let plan = DispatchPlan::build(intent, request, &snapshot, self.config.confidence_threshold)
            .ensure_routed(request, &snapshot)?;
        debug!(
            "Plan for {} (registry v{}): {:?} over [{}]",
            plan.primary_domain,
            snapshot.version,
            plan.mode,
            plan.calls
                .iter()
                .map(|c| c.backend_id())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(plan)
    }

    /// Run the request to completion and return every backend result.
    /// `stages` is the tracker opened before classification; the outcome
    /// carries it on.
    pub async fn dispatch(
        &self,
        intent: &DomainIntent,
        request: &ChatRequest,
        stages: StageTracker,
    ) -> Result<DispatchOutcome, GatewayError> {
        let plan = self.plan(intent, request)?;
        Ok(self.run(plan, request, stages, None).await)
    }

    /// Streaming variant. Chain plans forward every backend increment in
    /// order without buffering; fan-out plans deliver their combined result
    /// in the final [`StreamEvent::Completed`]. Dropping the returned stream
    /// cancels outstanding backend calls.
    pub fn dispatch_stream(
        self: &Arc<Self>,
        intent: &DomainIntent,
        request: &ChatRequest,
        stages: StageTracker,
    ) -> Result<ReceiverStream<StreamEvent>, GatewayError> {
        let plan = self.plan(intent, request)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = Arc::clone(self);
        let request = request.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Stream consumer went away, cancelling backend calls");
                }
                outcome = this.run(plan, &request, stages, Some(&tx)) => {
                    let _ = tx.send(StreamEvent::Completed(outcome)).await;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn run(
        &self,
        plan: DispatchPlan,
        request: &ChatRequest,
        mut stages: StageTracker,
        sink: Option<&mpsc::Sender<StreamEvent>>,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let deadline = started + self.config.budget;
        let sink = sink.filter(|_| plan.mode == PlanMode::Chain);
        let mut emitted = false;

        step(&mut stages, DispatchStage::Dispatching);
        if plan.is_fallback_only() {
            step(&mut stages, DispatchStage::FallbackDispatching);
            metrics::record_fallback(plan.primary_domain);
            if let Some(reason) = &plan.fallback_reason {
                warn!("{} request routed to the general model: {}", plan.primary_domain, reason);
            }
        }

        let mut results = match plan.mode {
            PlanMode::FanOut => join_all(plan.calls.iter().map(|call| self.execute(call, deadline))).await,
            PlanMode::Chain => {
                let mut results = Vec::with_capacity(plan.calls.len());
                for call in &plan.calls {
                    let result = self.call(call, deadline, sink, &mut emitted).await;
                    let next_replica = !result.success
                        && !emitted
                        && result.error_kind.map(|k| k.is_backend_fault()).unwrap_or(false);
                    results.push(result);
                    if !next_replica {
                        break;
                    }
                }
                results
            }
        };

        let budget_hit = results.iter().any(|r| r.error_kind == Some(ErrorKind::BudgetExceeded));
        let primary_failed =
            !plan.is_fallback_only() && !emitted && !budget_hit && results.iter().all(|r| !r.success);

        let mut fallback_reason = plan.fallback_reason.clone();
        if primary_failed {
            match self.fallback_call(&plan, &results, request) {
                Some(call) => {
                    step(&mut stages, DispatchStage::FallbackDispatching);
                    metrics::record_fallback(plan.primary_domain);
                    let reason = results
                        .first()
                        .and_then(|r| r.error_message.clone())
                        .unwrap_or_else(|| "primary call failed".to_string());
                    warn!(
                        "Primary {} call failed ({}), falling back to {}",
                        plan.primary_domain,
                        reason,
                        call.backend_id()
                    );
                    fallback_reason = Some(reason);
                    let result = self.call(&call, deadline, sink, &mut emitted).await;
                    results.push(result);
                }
                None => warn!("Primary {} call failed and no fallback backend is left", plan.primary_domain),
            }
        } else if !plan.is_fallback_only() {
            step(&mut stages, DispatchStage::Aggregating);
        }

        let any_success = results.iter().any(|r| r.success);
        let partial = budget_hit
            || (plan.mode == PlanMode::FanOut && any_success && results.iter().any(|r| !r.success));
        if any_success {
            step(&mut stages, DispatchStage::Assembling);
        } else {
            stages.fail();
        }
        if budget_hit {
            warn!(
                "Dispatch budget of {:?} exhausted for {} request",
                self.config.budget, plan.primary_domain
            );
        }

        let elapsed = started.elapsed();
        metrics::observe_dispatch(elapsed);
        info!(
            "[{}] Dispatched {} request: {} call(s), {} fallback, {} in {:?}",
            stages.request_id(),
            plan.primary_domain,
            results.len(),
            results.iter().filter(|r| r.is_fallback).count(),
            if any_success { "answered" } else { "failed" },
            elapsed
        );

        DispatchOutcome {
            primary_domain: plan.primary_domain,
            results,
            partial,
            streamed: emitted,
            fallback_reason,
            budget: self.config.budget,
            stages,
        }
    }

    /// The single fallback call after a primary failure. A GENERAL request
    /// only falls back to a different GENERAL backend.
    fn fallback_call(
        &self,
        plan: &DispatchPlan,
        results: &[BackendResult],
        request: &ChatRequest,
    ) -> Option<BackendCall> {
        let snapshot = self.registry.snapshot();
        if plan.primary_domain.is_specialized() {
            return snapshot
                .fallback_general(None)
                .map(|entry| BackendCall::fallback(entry, request));
        }
        let tried: Vec<&str> = results.iter().map(|r| r.backend_id.as_str()).collect();
        let entry = snapshot.fallback_general(tried.first().copied())?;
        if tried.contains(&entry.descriptor.id.as_str()) {
            return None;
        }
        Some(BackendCall::fallback(entry, request))
    }

    async fn call(
        &self,
        call: &BackendCall,
        deadline: Instant,
        sink: Option<&mpsc::Sender<StreamEvent>>,
        emitted: &mut bool,
    ) -> BackendResult {
        match sink {
            Some(tx) => self.stream_call(call, deadline, tx, emitted).await,
            None => self.execute(call, deadline).await,
        }
    }

    /// Deadline for one call and whether it is the request budget (rather
    /// than the backend's own timeout) that sets it.
    fn limit_for(&self, call: &BackendCall, deadline: Instant) -> (Instant, bool) {
        let own = Instant::now() + call.backend.descriptor.timeout();
        if deadline <= own {
            (deadline, true)
        } else {
            (own, false)
        }
    }

    fn timed_out(&self, call: &BackendCall, budget_bound: bool, latency: Duration) -> BackendResult {
        let (kind, message) = if budget_bound {
            (
                ErrorKind::BudgetExceeded,
                format!("dispatch budget of {:?} exhausted", self.config.budget),
            )
        } else {
            (
                ErrorKind::Timeout,
                format!("no reply within {:?}", call.backend.descriptor.timeout()),
            )
        };
        BackendResult::failed(call.backend_id(), call.domain(), call.is_fallback, kind, message, latency)
    }

    fn recorded(&self, result: BackendResult) -> BackendResult {
        metrics::record_backend_call(result.domain, result.outcome_label());
        if result.success {
            info!(
                "Backend {} ({}) answered in {:?}{}",
                result.backend_id,
                result.domain,
                result.latency,
                if result.is_fallback { " [fallback]" } else { "" }
            );
        } else {
            warn!(
                "Backend {} ({}) failed after {:?}: {}",
                result.backend_id,
                result.domain,
                result.latency,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }

    async fn execute(&self, call: &BackendCall, deadline: Instant) -> BackendResult {
        let started = Instant::now();
        let (limit, budget_bound) = self.limit_for(call, deadline);
        let entry = &call.backend;

        // Waiting for a slot counts against the call's own timeout.
        let attempt = async {
            let _permit = entry
                .slots()
                .acquire_owned()
                .await
                .map_err(|_| BackendError::Unavailable("backend slots are closed".to_string()))?;
            self.config
                .retry
                .run(call.backend_id(), || entry.client.invoke(&call.payload))
                .await
        };

        let result = match timeout_at(limit, attempt).await {
            Ok(Ok(reply)) => BackendResult::succeeded(
                call.backend_id(),
                call.domain(),
                call.is_fallback,
                reply,
                started.elapsed(),
            ),
            Ok(Err(err)) => BackendResult::failed(
                call.backend_id(),
                call.domain(),
                call.is_fallback,
                ErrorKind::from(&err),
                err.to_string(),
                started.elapsed(),
            ),
            Err(_) => self.timed_out(call, budget_bound, started.elapsed()),
        };
        self.recorded(result)
    }

    async fn stream_call(
        &self,
        call: &BackendCall,
        deadline: Instant,
        tx: &mpsc::Sender<StreamEvent>,
        emitted: &mut bool,
    ) -> BackendResult {
        let started = Instant::now();
        let (limit, budget_bound) = self.limit_for(call, deadline);
        let entry = &call.backend;

        let opened = timeout_at(limit, async {
            let permit = entry
                .slots()
                .acquire_owned()
                .await
                .map_err(|_| BackendError::Unavailable("backend slots are closed".to_string()))?;
            let stream = self
                .config
                .retry
                .run(call.backend_id(), || entry.client.invoke_stream(&call.payload))
                .await?;
            Ok::<_, BackendError>((permit, stream))
        })
        .await;

        let (_permit, mut stream) = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(err)) => {
                return self.recorded(BackendResult::failed(
                    call.backend_id(),
                    call.domain(),
                    call.is_fallback,
                    ErrorKind::from(&err),
                    err.to_string(),
                    started.elapsed(),
                ))
            }
            Err(_) => return self.recorded(self.timed_out(call, budget_bound, started.elapsed())),
        };

        let mut reply = BackendReply::text(String::new());
        let failure = loop {
            match timeout_at(limit, stream.next()).await {
                Ok(Some(Ok(delta))) => {
                    reply.content.push_str(&delta.content);
                    if let Some(finish) = delta.finish {
                        reply.finish = finish;
                    }
                    if delta.usage.is_some() {
                        reply.usage = delta.usage;
                    }
                    if delta.content.is_empty() {
                        continue;
                    }
                    if tx.send(StreamEvent::Delta(delta)).await.is_err() {
                        break Some(BackendResult::failed(
                            call.backend_id(),
                            call.domain(),
                            call.is_fallback,
                            ErrorKind::Unavailable,
                            "client disconnected",
                            started.elapsed(),
                        ));
                    }
                    *emitted = true;
                }
                Ok(Some(Err(err))) => {
                    break Some(BackendResult::failed(
                        call.backend_id(),
                        call.domain(),
                        call.is_fallback,
                        ErrorKind::from(&err),
                        err.to_string(),
                        started.elapsed(),
                    ))
                }
                Ok(None) => break None,
                Err(_) => break Some(self.timed_out(call, budget_bound, started.elapsed())),
            }
        };

        let result = match failure {
            None => BackendResult::succeeded(
                call.backend_id(),
                call.domain(),
                call.is_fallback,
                reply,
                started.elapsed(),
            ),
            Some(failed) => {
                let received = (!reply.content.is_empty()).then_some(reply);
                failed.with_partial_reply(received)
            }
        };
        self.recorded(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, IntentParams};
    use crate::protocol::Message;
    use crate::registry::{BackendDescriptor, HealthStatus, Protocol};
    use crate::testing::ScriptedClient;

    fn descriptor(id: &str, domain: Domain, protocol: Protocol) -> BackendDescriptor {
        BackendDescriptor::new(id, domain, format!("http://{}:9000", id), protocol)
    }

    fn add(registry: &CapabilityRegistry, descriptor: BackendDescriptor, client: ScriptedClient) -> Arc<ScriptedClient> {
        let client = Arc::new(client);
        registry.register_with_client(descriptor, client.clone()).unwrap();
        client
    }

    fn orchestrator(registry: CapabilityRegistry, budget: Duration) -> Arc<DispatchOrchestrator> {
        Arc::new(DispatchOrchestrator::new(
            Arc::new(registry),
            OrchestratorConfig {
                confidence_threshold: 0.5,
                budget,
                retry: RetryPolicy::none(),
            },
        ))
    }

    fn tracker() -> StageTracker {
        StageTracker::new("req-test")
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest::new("S1-Base", vec![Message::user(text)])
    }

    fn completion() -> DomainIntent {
        DomainIntent::new(
            Domain::ProteinStructure,
            0.85,
            IntentParams::ProteinCompletion {
                sequence: "QATSLRILNNGHAFNVEFDDSQDKAVL".into(),
                left_len: Some(50),
                right_len: Some(50),
                extra_sequences: Vec::new(),
            },
        )
    }

    fn general_backend(registry: &CapabilityRegistry) -> Arc<ScriptedClient> {
        add(
            registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::replying("general", Protocol::OpenaiChat, "general answer"),
        )
    }

    async fn collect(stream: ReceiverStream<StreamEvent>) -> (Vec<String>, DispatchOutcome) {
        let events: Vec<StreamEvent> = stream.collect().await;
        let mut deltas = Vec::new();
        let mut outcome = None;
        for event in events {
            match event {
                StreamEvent::Delta(delta) => deltas.push(delta.content),
                StreamEvent::Completed(o) => outcome = Some(o),
            }
        }
        (deltas, outcome.expect("stream ended without a completion event"))
    }

    // ===== Routing =====

    #[tokio::test]
    async fn test_general_request_single_call_no_fallback() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        let orch = orchestrator(registry, Duration::from_secs(5));

        let outcome = orch.dispatch(&DomainIntent::general(1.0), &request("hello"), tracker()).await.unwrap();
        assert_eq!(general.calls(), 1);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.fallback_calls(), 0);
        assert!(!outcome.answered_by_fallback());
        assert_eq!(outcome.stages.current(), DispatchStage::Assembling);
    }

    // ===== Lifecycle =====

    #[tokio::test]
    async fn test_answered_request_ends_done() {
        let registry = CapabilityRegistry::new();
        general_backend(&registry);
        let orch = orchestrator(registry, Duration::from_secs(5));

        let mut outcome = orch
            .dispatch(&DomainIntent::general(1.0), &request("hello"), StageTracker::new("req-7"))
            .await
            .unwrap();
        outcome.mark_done();
        assert_eq!(outcome.stages.request_id(), "req-7");
        assert_eq!(
            outcome.stages.history(),
            &[
                DispatchStage::Classifying,
                DispatchStage::Dispatching,
                DispatchStage::Aggregating,
                DispatchStage::Assembling,
                DispatchStage::Done,
            ]
        );
        assert!(!outcome.is_failed());
    }

    #[tokio::test]
    async fn test_streamed_fallback_ends_done() {
        let registry = CapabilityRegistry::new();
        add(
            &registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::streaming("general", Protocol::OpenaiChat, &["ok"], None),
        );
        add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::failing("esm3", Protocol::Esm3, BackendError::Protocol("garbled".into())),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let (_, mut outcome) = collect(orch.dispatch_stream(&completion(), &request("complete it"), tracker()).unwrap()).await;
        outcome.mark_done();
        assert_eq!(outcome.stages.current(), DispatchStage::Done);
        assert!(outcome.stages.went_through(DispatchStage::FallbackDispatching));
    }

    #[tokio::test]
    async fn test_no_user_message_issues_no_call() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        let orch = orchestrator(registry, Duration::from_secs(5));

        let req = ChatRequest::new("S1-Base", vec![Message::system("be brief")]);
        let err = orch.dispatch(&DomainIntent::general(1.0), &req, tracker()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert!(orch.dispatch_stream(&DomainIntent::general(1.0), &req, tracker()).is_err());
        assert_eq!(general.calls(), 0);
    }

    #[tokio::test]
    async fn test_domain_request_reaches_domain_backend() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        let esm3 = add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::replying("esm3", Protocol::Esm3, "completed"),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert_eq!(esm3.calls(), 1);
        assert_eq!(general.calls(), 0);
        assert_eq!(esm3.payloads()[0].params, completion().params);
        assert!(!outcome.all_failed());
    }

    // ===== Fallback =====

    #[tokio::test]
    async fn test_unavailable_primary_gets_exactly_one_fallback() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        let esm3 = add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::replying("esm3", Protocol::Esm3, "completed"),
        );
        registry.set_health("esm3", HealthStatus::Unavailable);
        let orch = orchestrator(registry, Duration::from_secs(5));

        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert_eq!(esm3.calls(), 0);
        assert_eq!(general.calls(), 1);
        assert_eq!(outcome.fallback_calls(), 1);
        assert!(outcome.answered_by_fallback());
        assert_eq!(outcome.fallback_reason.as_deref(), Some("backend is unavailable"));
        assert!(outcome.stages.went_through(DispatchStage::FallbackDispatching));
    }

    #[tokio::test]
    async fn test_protocol_error_falls_back_once() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        let esm3 = add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::failing("esm3", Protocol::Esm3, BackendError::Protocol("garbled".into())),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert_eq!(esm3.calls(), 1);
        assert_eq!(general.calls(), 1);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].error_kind, Some(ErrorKind::Protocol));
        assert!(outcome.results[1].is_fallback);
        assert!(outcome.fallback_reason.unwrap().contains("garbled"));
    }

    #[tokio::test]
    async fn test_primary_timeout_falls_back() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3).with_timeout(Duration::from_secs(1)),
            ScriptedClient::slow("esm3", Protocol::Esm3, Duration::from_secs(10), "too late"),
        );
        let orch = orchestrator(registry, Duration::from_secs(30));

        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert_eq!(outcome.results[0].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(general.calls(), 1);
        assert!(outcome.answered_by_fallback());
        assert!(!outcome.partial);
    }

    #[tokio::test]
    async fn test_primary_and_fallback_failing_is_failed() {
        let registry = CapabilityRegistry::new();
        add(
            &registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::failing("general", Protocol::OpenaiChat, BackendError::Unavailable("down".into())),
        );
        add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::failing("esm3", Protocol::Esm3, BackendError::Protocol("garbled".into())),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert!(outcome.all_failed());
        assert_eq!(outcome.fallback_calls(), 1);
        assert_eq!(outcome.stages.current(), DispatchStage::Failed);
        assert!(matches!(outcome.to_error(), Some(GatewayError::AllBackendsFailed { .. })));

        let mut outcome = outcome;
        outcome.mark_done();
        assert!(outcome.is_failed());
        assert!(!outcome.stages.went_through(DispatchStage::Done));
    }

    #[tokio::test]
    async fn test_general_failure_uses_other_general_backend_only() {
        let registry = CapabilityRegistry::new();
        let first = add(
            &registry,
            descriptor("g1", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::failing("g1", Protocol::OpenaiChat, BackendError::Protocol("bad".into())),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));
        let outcome = orch.dispatch(&DomainIntent::general(1.0), &request("hi"), tracker()).await.unwrap();
        assert_eq!(first.calls(), 1);
        assert_eq!(outcome.fallback_calls(), 0);

        let second = add(
            orch.registry(),
            descriptor("g2", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::replying("g2", Protocol::OpenaiChat, "second"),
        );
        // Both healthy; g1 was registered first and is still tried first.
        let outcome = orch.dispatch(&DomainIntent::general(1.0), &request("hi"), tracker()).await.unwrap();
        assert_eq!(second.calls(), 1);
        assert_eq!(outcome.fallback_calls(), 1);
        assert!(!outcome.answered_by_fallback());
    }

    #[tokio::test]
    async fn test_replica_chain_stops_at_first_success() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        let a = add(
            &registry,
            descriptor("esm3-a", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::failing("esm3-a", Protocol::Esm3, BackendError::Unavailable("refused".into())),
        );
        let b = add(
            &registry,
            descriptor("esm3-b", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::replying("esm3-b", Protocol::Esm3, "done"),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert_eq!((a.calls(), b.calls(), general.calls()), (1, 1, 0));
        assert_eq!(outcome.successes().count(), 1);
        assert_eq!(outcome.fallback_calls(), 0);
    }

    // ===== Budget and concurrency =====

    #[tokio::test]
    async fn test_budget_exhaustion_is_partial_without_fallback() {
        let registry = CapabilityRegistry::new();
        let general = general_backend(&registry);
        add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::slow("esm3", Protocol::Esm3, Duration::from_secs(10), "late"),
        );
        let orch = orchestrator(registry, Duration::from_millis(150));

        let started = std::time::Instant::now();
        let outcome = orch.dispatch(&completion(), &request("complete it"), tracker()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(outcome.partial);
        assert_eq!(outcome.results[0].error_kind, Some(ErrorKind::BudgetExceeded));
        assert_eq!(general.calls(), 0);
        assert!(matches!(outcome.to_error(), Some(GatewayError::BudgetExceeded(_))));
    }

    #[tokio::test]
    async fn test_fan_out_respects_backend_concurrency() {
        let registry = CapabilityRegistry::new();
        general_backend(&registry);
        let esm3 = add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3).with_max_concurrency(1),
            ScriptedClient::slow("esm3", Protocol::Esm3, Duration::from_millis(30), "done"),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let intent = DomainIntent::new(
            Domain::ProteinStructure,
            0.9,
            IntentParams::ProteinCompletion {
                sequence: "QATSLRILNNGHAFNVEFDDSQDKAVL".into(),
                left_len: None,
                right_len: None,
                extra_sequences: vec!["MKTAYIAKQRQISFVKSHFSRQ".into(), "GSHMSLFDFFKNKGSA".into()],
            },
        );
        let outcome = orch.dispatch(&intent, &request("complete all"), tracker()).await.unwrap();
        assert_eq!(esm3.calls(), 3);
        assert_eq!(esm3.max_in_flight(), 1);
        assert_eq!(outcome.successes().count(), 3);
        assert!(!outcome.partial);
    }

    // ===== Streaming =====

    #[tokio::test]
    async fn test_stream_preserves_chunk_order() {
        let registry = CapabilityRegistry::new();
        add(
            &registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::streaming("general", Protocol::OpenaiChat, &["Hel", "lo", " world"], None),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let stream = orch.dispatch_stream(&DomainIntent::general(1.0), &request("hi"), tracker()).unwrap();
        let (deltas, outcome) = collect(stream).await;
        assert_eq!(deltas, vec!["Hel", "lo", " world"]);
        assert!(outcome.streamed);
        assert_eq!(outcome.results[0].reply.as_ref().unwrap().content, "Hello world");
    }

    #[tokio::test]
    async fn test_stream_failure_before_first_delta_falls_back() {
        let registry = CapabilityRegistry::new();
        add(
            &registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::streaming("general", Protocol::OpenaiChat, &["fallback ", "answer"], None),
        );
        add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::failing("esm3", Protocol::Esm3, BackendError::Unavailable("refused".into())),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let stream = orch.dispatch_stream(&completion(), &request("complete it"), tracker()).unwrap();
        let (deltas, outcome) = collect(stream).await;
        assert_eq!(deltas.concat(), "fallback answer");
        assert!(outcome.answered_by_fallback());
        assert_eq!(outcome.fallback_calls(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_after_deltas_keeps_partial_text() {
        let registry = CapabilityRegistry::new();
        let general = add(
            &registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat),
            ScriptedClient::streaming(
                "general",
                Protocol::OpenaiChat,
                &["half ", "an answer"],
                Some(BackendError::Protocol("connection reset".into())),
            ),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));

        let stream = orch.dispatch_stream(&DomainIntent::general(1.0), &request("hi"), tracker()).unwrap();
        let (deltas, outcome) = collect(stream).await;
        assert_eq!(deltas.len(), 2);
        assert_eq!(general.calls(), 1);
        assert!(outcome.all_failed());
        assert!(outcome.streamed);
        assert_eq!(outcome.results[0].reply.as_ref().unwrap().content, "half an answer");
    }

    #[tokio::test]
    async fn test_stream_fan_out_completes_without_deltas() {
        let registry = CapabilityRegistry::new();
        general_backend(&registry);
        add(
            &registry,
            descriptor("esm3", Domain::ProteinStructure, Protocol::Esm3),
            ScriptedClient::replying("esm3", Protocol::Esm3, "done"),
        );
        let orch = orchestrator(registry, Duration::from_secs(5));
        let intent = DomainIntent::new(
            Domain::ProteinStructure,
            0.9,
            IntentParams::ProteinCompletion {
                sequence: "QATSLRILNNGHAFNVEFDDSQDKAVL".into(),
                left_len: None,
                right_len: None,
                extra_sequences: vec!["MKTAYIAKQRQISFVKSHFSRQ".into()],
            },
        );

        let (deltas, outcome) = collect(orch.dispatch_stream(&intent, &request("complete"), tracker()).unwrap()).await;
        assert!(deltas.is_empty());
        assert!(!outcome.streamed);
        assert_eq!(outcome.successes().count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_backend_slot() {
        let registry = CapabilityRegistry::new();
        let general = add(
            &registry,
            descriptor("general", Domain::General, Protocol::OpenaiChat).with_max_concurrency(1),
            ScriptedClient::slow("general", Protocol::OpenaiChat, Duration::from_secs(30), "never sent"),
        );
        let orch = orchestrator(registry, Duration::from_secs(60));
        let free_slots = || {
            orch.registry()
                .snapshot()
                .get("general")
                .map(|entry| entry.available_slots())
                .unwrap()
        };

        let stream = orch.dispatch_stream(&DomainIntent::general(1.0), &request("hi"), tracker()).unwrap();
        let started = std::time::Instant::now();
        while general.calls() == 0 && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(general.calls(), 1);
        assert_eq!(free_slots(), 0);

        drop(stream);
        let started = std::time::Instant::now();
        while free_slots() == 0 && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(free_slots(), 1);
        assert_eq!(general.calls(), 1);
    }
}
