//! Administrative endpoints: liveness and runtime backend registration.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{info, warn};

use super::error_response;
use crate::domain::Domain;
use crate::error::GatewayError;
use crate::metrics;
use crate::registry::{BackendDescriptor, HealthStatus};
use crate::shared_state::{AppState, CounterSnapshot};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub registry_version: u64,
    pub backends: usize,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Serialize)]
pub struct BackendList {
    pub version: u64,
    pub backends: Vec<BackendDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct RegistryChange {
    pub id: String,
    pub version: u64,
}

/// `GET /healthz`. `degraded` when no general backend is routable, since
/// every request ultimately depends on one.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let general_routable = snapshot
        .entries()
        .iter()
        .any(|e| e.descriptor.domain == Domain::General && e.descriptor.health.is_routable());
    let status = if general_routable { "healthy" } else { "degraded" };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.uptime_seconds(),
            registry_version: snapshot.version,
            backends: snapshot.entries().len(),
            counters: state.counters.snapshot(),
        }),
    )
}

/// `GET /admin/backends`
pub async fn list_backends(State(state): State<AppState>) -> Json<BackendList> {
    metrics::inc_request("admin_backends", "200");
    let snapshot = state.registry.snapshot();
    Json(BackendList {
        version: snapshot.version,
        backends: snapshot.entries().iter().map(|e| e.descriptor.clone()).collect(),
    })
}

/// `POST /admin/backends`. Replaces a backend with the same id.
pub async fn register_backend(
    State(state): State<AppState>,
    payload: Result<Json<BackendDescriptor>, JsonRejection>,
) -> Response {
    let descriptor = match payload {
        Ok(Json(descriptor)) => descriptor,
        Err(rejection) => {
            metrics::inc_request("admin_register", "400");
            return GatewayError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    // Health is owned by the prober; new registrations start healthy.
    let descriptor = BackendDescriptor {
        health: HealthStatus::Healthy,
        ..descriptor
    };
    let id = descriptor.id.clone();
    match state.registry.register(descriptor) {
        Ok(version) => {
            metrics::inc_request("admin_register", "201");
            info!("Admin registered backend {} (registry v{})", id, version);
            (StatusCode::CREATED, Json(RegistryChange { id, version })).into_response()
        }
        Err(e) => {
            metrics::inc_request("admin_register", "400");
            warn!("Admin registration of {} refused: {}", id, e);
            GatewayError::InvalidRequest(e).into_response()
        }
    }
}

/// `DELETE /admin/backends/:id`. The last general backend cannot be
/// removed.
pub async fn delete_backend(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let snapshot = state.registry.snapshot();
    let Some(entry) = snapshot.get(&id) else {
        metrics::inc_request("admin_deregister", "404");
        return error_response(StatusCode::NOT_FOUND, "not_found_error", format!("backend '{}' is not registered", id));
    };

    let generals = snapshot
        .entries()
        .iter()
        .filter(|e| e.descriptor.domain == Domain::General)
        .count();
    if entry.descriptor.domain == Domain::General && generals == 1 {
        metrics::inc_request("admin_deregister", "409");
        return error_response(
            StatusCode::CONFLICT,
            "conflict_error",
            format!("backend '{}' is the last general backend", id),
        );
    }

    match state.registry.deregister(&id) {
        Some(_) => {
            metrics::inc_request("admin_deregister", "200");
            Json(RegistryChange {
                id,
                version: state.registry.version(),
            })
            .into_response()
        }
        None => {
            metrics::inc_request("admin_deregister", "404");
            error_response(StatusCode::NOT_FOUND, "not_found_error", format!("backend '{}' is not registered", id))
        }
    }
}
