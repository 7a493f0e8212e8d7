//! HTTP handlers of the gateway.

pub mod admin_api;
pub mod chat_api;
pub mod models_api;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use validator::{Validate, ValidationErrors};

use crate::error::{ErrorBody, ErrorEnvelope, GatewayError};

pub use admin_api::{delete_backend, health, list_backends, register_backend};
pub use chat_api::create_chat_completion;
pub use models_api::{get_model, list_models};

/// Header set when the general model answered in place of a domain backend.
pub const ROUTING_HEADER: &str = "x-sci-routing";
/// Header set when the dispatch budget cut the request short.
pub const PARTIAL_HEADER: &str = "x-sci-partial";
/// Header naming the domain the classifier picked.
pub const DOMAIN_HEADER: &str = "x-sci-domain";

/// Unwrap a JSON body and run its `validator` rules.
pub fn validated<T: Validate>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    let Json(value) = payload.map_err(|rejection| GatewayError::InvalidRequest(rejection.body_text()))?;
    value
        .validate()
        .map_err(|errors| GatewayError::InvalidRequest(describe_validation(&errors)))?;
    Ok(value)
}

/// `field: message` pairs, sorted for stable output.
fn describe_validation(errors: &ValidationErrors) -> String {
    let mut parts: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: failed {} check", field, e.code),
            })
        })
        .collect();
    parts.sort();
    parts.join("; ")
}

/// Error envelope for failures outside the [`GatewayError`] taxonomy.
pub fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            message: message.into(),
            kind: kind.to_string(),
            code: None,
        },
    };
    (status, Json(envelope)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatRequest, Message};

    #[test]
    fn test_validation_errors_are_described() {
        let mut request = ChatRequest::new("S1-Base", vec![Message::user("hi")]);
        request.temperature = Some(3.5);
        let err = validated(Ok(Json(request))).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(ref m) if m.contains("temperature")));
    }

    #[test]
    fn test_empty_messages_are_rejected() {
        let request = ChatRequest::new("S1-Base", vec![]);
        let err = validated(Ok(Json(request))).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("messages must not be empty"));
    }
}
