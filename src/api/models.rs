use axum::response::{IntoResponse, Response};

use crate::state::AppState;

pub fn handler(state: &AppState) -> Response {
    let data: Vec<serde_json::Value> = state
        .config
        .grok
        .models
        .iter()
        .map(|model| {
            serde_json::json!({
                "id": model,
                "object": "model",
                "created": 0,
                "owned_by": "xai",
            })
        })
        .collect();

    axum::Json(serde_json::json!({
        "object": "list",
        "data": data,
    }))
    .into_response()
}
