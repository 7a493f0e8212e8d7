use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use super::state::{DispatchStage, StageTracker};
use crate::backend_client::{BackendError, BackendReply};
use crate::domain::Domain;
use crate::error::GatewayError;

/// Why a backend call did not produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unavailable,
    Timeout,
    Protocol,
    Rejected,
    InvalidPayload,
    /// The request-wide dispatch budget ran out while the call was pending.
    BudgetExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Rejected => "rejected",
            ErrorKind::InvalidPayload => "invalid_payload",
            ErrorKind::BudgetExceeded => "budget_exceeded",
        }
    }

    /// Failures another replica of the same backend might not have.
    /// Rejections and bad payloads would repeat anywhere.
    pub fn is_backend_fault(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::Protocol)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::BudgetExceeded)
    }
}

impl From<&BackendError> for ErrorKind {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::Unavailable(_) => ErrorKind::Unavailable,
            BackendError::Timeout(_) => ErrorKind::Timeout,
            BackendError::Protocol(_) => ErrorKind::Protocol,
            BackendError::Rejected { .. } => ErrorKind::Rejected,
            BackendError::InvalidPayload(_) => ErrorKind::InvalidPayload,
        }
    }
}

/// Outcome of one backend call. Immutable once produced.
#[derive(Debug, Clone)]
pub struct BackendResult {
    pub backend_id: String,
    pub domain: Domain,
    pub success: bool,
    /// Reply on success. For an interrupted stream, whatever arrived.
    pub reply: Option<BackendReply>,
    pub latency: Duration,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub is_fallback: bool,
}

impl BackendResult {
    pub fn succeeded(
        backend_id: impl Into<String>,
        domain: Domain,
        is_fallback: bool,
        reply: BackendReply,
        latency: Duration,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            domain,
            success: true,
            reply: Some(reply),
            latency,
            error_kind: None,
            error_message: None,
            is_fallback,
        }
    }

    pub fn failed(
        backend_id: impl Into<String>,
        domain: Domain,
        is_fallback: bool,
        kind: ErrorKind,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            domain,
            success: false,
            reply: None,
            latency,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            is_fallback,
        }
    }

    pub fn with_partial_reply(mut self, reply: Option<BackendReply>) -> Self {
        self.reply = reply;
        self
    }

    /// Metric label for this call.
    pub fn outcome_label(&self) -> &'static str {
        match self.error_kind {
            None => "success",
            Some(kind) => kind.as_str(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} ({})",
            self.error_message.as_deref().unwrap_or("unknown error"),
            self.backend_id
        )
    }
}

/// Everything dispatch produced for one request.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Domain the classifier picked; GENERAL when it was not sure.
    pub primary_domain: Domain,
    /// One entry per executed call, in execution order.
    pub results: Vec<BackendResult>,
    /// The budget ran out, or only some fan-out calls answered.
    pub partial: bool,
    /// Content already went to the client as stream deltas.
    pub streamed: bool,
    /// Why the request was (or had to be) answered by the general model.
    pub fallback_reason: Option<String>,
    pub budget: Duration,
    pub stages: StageTracker,
}

impl DispatchOutcome {
    pub fn successes(&self) -> impl Iterator<Item = &BackendResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn all_failed(&self) -> bool {
        !self.results.iter().any(|r| r.success)
    }

    pub fn fallback_calls(&self) -> usize {
        self.results.iter().filter(|r| r.is_fallback).count()
    }

    /// A specialized request whose answer came from the general model.
    pub fn answered_by_fallback(&self) -> bool {
        self.primary_domain.is_specialized()
            && self.successes().last().map(|r| r.is_fallback).unwrap_or(false)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::BudgetExceeded))
    }

    pub fn is_failed(&self) -> bool {
        self.stages.current() == DispatchStage::Failed
    }

    /// Close the request lifecycle once the answer went out. A failed
    /// outcome stays `Failed`.
    pub fn mark_done(&mut self) {
        if self.is_failed() {
            return;
        }
        if let Err(e) = self.stages.advance(DispatchStage::Done) {
            warn!("{}", e);
        }
    }

    /// Error to surface when no call succeeded.
    pub fn to_error(&self) -> Option<GatewayError> {
        if !self.all_failed() {
            return None;
        }
        let last = self.results.last()?;
        if self.results.iter().all(|r| r.error_kind == Some(ErrorKind::BudgetExceeded)) {
            return Some(GatewayError::BudgetExceeded(self.budget));
        }

        let primary = self.results.iter().find(|r| !r.is_fallback);
        let fallback = self.results.iter().rev().find(|r| r.is_fallback);
        let primary_error = primary
            .map(BackendResult::describe)
            .or_else(|| self.fallback_reason.clone())
            .unwrap_or_else(|| "not attempted".to_string());
        let fallback_error = fallback
            .map(BackendResult::describe)
            .unwrap_or_else(|| "no fallback backend was available".to_string());
        Some(GatewayError::AllBackendsFailed {
            primary: self.primary_domain,
            primary_error,
            fallback_error,
            timed_out: last.error_kind.map(|k| k.is_timeout()).unwrap_or(false),
        })
    }
}
