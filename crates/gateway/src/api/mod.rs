//! OpenAI-compatible HTTP surface: chat completions (streaming + blocking)
//! and model enumeration.

pub mod chat;
pub mod models;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", axum::routing::post(chat::chat_completions))
        .route("/v1/models", get(models::list))
        .route("/v1/models/:id", get(models::get_one))
}
