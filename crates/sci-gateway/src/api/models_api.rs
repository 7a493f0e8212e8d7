use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::GatewayError;
use crate::metrics;
use crate::protocol::{ModelCard, ModelList};
use crate::shared_state::AppState;

const OWNER: &str = "sci-gateway";

fn card(id: &str, created: i64) -> ModelCard {
    ModelCard {
        id: id.to_string(),
        object: "model".to_string(),
        created,
        owned_by: OWNER.to_string(),
    }
}

fn started_at_unix(state: &AppState) -> i64 {
    chrono::Utc::now().timestamp() - state.uptime_seconds() as i64
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    metrics::inc_request("list_models", "200");
    let created = started_at_unix(&state);
    Json(ModelList {
        object: "list".to_string(),
        data: state
            .config
            .served_models
            .iter()
            .map(|id| card(id, created))
            .collect(),
    })
}

/// `GET /v1/models/:id`
pub async fn get_model(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !state.config.is_served_model(&id) {
        metrics::inc_request("get_model", "404");
        return GatewayError::ModelNotFound(id).into_response();
    }
    metrics::inc_request("get_model", "200");
    Json(card(&id, started_at_unix(&state))).into_response()
}
