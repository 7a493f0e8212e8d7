//! Gateway error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::domain::Domain;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Client-caused; never retried and never forwarded to a backend.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("{domain} backend unavailable: {reason}")]
    BackendUnavailable { domain: Domain, reason: String },

    #[error("{domain} backend timed out after {after:?}")]
    BackendTimeout { domain: Domain, after: Duration },

    #[error("{domain} backend returned a malformed response: {reason}")]
    BackendProtocolError { domain: Domain, reason: String },

    #[error("dispatch budget of {0:?} exceeded")]
    BudgetExceeded(Duration),

    #[error("all backends failed (primary {primary}: {primary_error}; fallback: {fallback_error})")]
    AllBackendsFailed {
        primary: Domain,
        primary_error: String,
        fallback_error: String,
        timed_out: bool,
    },
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendProtocolError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BudgetExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::AllBackendsFailed { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::AllBackendsFailed { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// OpenAI-style `error.type` value.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::ModelNotFound(_) => "invalid_request_error",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::BackendTimeout { .. } => "backend_timeout",
            GatewayError::BackendProtocolError { .. } => "backend_protocol_error",
            GatewayError::BudgetExceeded(_) => "budget_exceeded",
            GatewayError::AllBackendsFailed { .. } => "all_backends_failed",
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            GatewayError::ModelNotFound(_) => Some("model_not_found"),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl From<&GatewayError> for ErrorEnvelope {
    fn from(err: &GatewayError) -> Self {
        ErrorEnvelope {
            error: ErrorBody {
                message: err.to_string(),
                kind: err.error_type().to_string(),
                code: err.code().map(str::to_string),
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorEnvelope::from(&self))).into_response()
    }
}
