//! `GET /v1/models`, `GET /v1/models/:id` — enumerate the model ids
//! registered across both backends.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelObject>,
}

fn all_models(state: &AppState) -> Vec<ModelObject> {
    let mut models: Vec<ModelObject> = state
        .config
        .backends
        .persistent_models
        .iter()
        .map(|id| ModelObject {
            id: id.clone(),
            object: "model",
            owned_by: "persistent",
        })
        .chain(
            state
                .config
                .backends
                .ephemeral_models
                .iter()
                .map(|id| ModelObject {
                    id: id.clone(),
                    object: "model",
                    owned_by: "ephemeral",
                }),
        )
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models
}

pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelList {
        object: "list",
        data: all_models(&state),
    })
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match all_models(&state).into_iter().find(|m| m.id == id) {
        Some(model) => Json(model).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {
                    "message": format!("model not found: {id}"),
                    "type": "invalid_request_error",
                }
            })),
        )
            .into_response(),
    }
}
