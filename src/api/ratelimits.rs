use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// `GET /v1/rate-limits[?model=<name>]` — normalised per-model rate-limit
/// view, one entry per configured model unless narrowed by the query.
pub async fn handler(state: &AppState, query: &str) -> Response {
    let requested = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("model="))
        .map(str::trim)
        .filter(|model| !model.is_empty());

    let models: Vec<&str> = match requested {
        Some(model) => vec![model],
        None => state.config.grok.models.iter().map(String::as_str).collect(),
    };

    let mut data = Vec::with_capacity(models.len());
    for model in models {
        let result = state.fetch_rate_limit(model).await;
        data.push(serde_json::json!({
            "model": model,
            "known": result.known,
            "remaining": result.remaining,
            "reset_at": result.reset_at,
        }));
    }

    axum::Json(serde_json::json!({
        "object": "list",
        "data": data,
    }))
    .into_response()
}
