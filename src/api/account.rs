use std::sync::Arc;

use axum::response::{IntoResponse, Response};

use crate::auth::authenticate;
use crate::grpcweb::account::bootstrap_account;
use crate::state::AppState;

/// `POST /v1/account/bootstrap` — run the gRPC-Web account bootstrap flow
/// and report the per-step outcome.
pub async fn bootstrap_handler(state: Arc<AppState>, headers: http::HeaderMap) -> Response {
    if let Err(err) = authenticate(&headers, &state.allowed_client_keys) {
        return err.into_response();
    }

    let steps = bootstrap_account(
        &state.transport,
        &state.headers,
        &state.config.grok.account_base_url,
    )
    .await;
    let ok = steps.iter().all(|step| step.ok);

    axum::Json(serde_json::json!({
        "ok": ok,
        "steps": steps,
    }))
    .into_response()
}
