use axum::{
    extract::{Path, State},
    Json,
};
use common_http_errors::{ApiError, ApiResult};
use serde_json::{json, Value};

use crate::app_state::AppState;

/// OpenAI-compatible catalog of logical model names.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .registry
        .model_names()
        .into_iter()
        .map(model_object)
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.registry.has_model(&id) {
        return Err(ApiError::not_found(format!("model '{id}' does not exist")));
    }
    Ok(Json(model_object(id)))
}

fn model_object(id: String) -> Value {
    json!({
        "id": id,
        "object": "model",
        "owned_by": "llm-gateway",
    })
}
