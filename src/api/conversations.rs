/// Conversation management surface: share, clone, delete, stats.
use std::sync::Arc;

use axum::response::{IntoResponse, Response};

use crate::auth::{self, authenticate};
use crate::error::GatewayError;
use crate::history;
use crate::session::SessionClient;
use crate::state::{now_ms, AppState};
use crate::store::ConversationRow;

fn scope_for(state: &AppState, headers: &http::HeaderMap, peer_ip: &str) -> String {
    let api_key = auth::extract_api_key(headers);
    let client_ip = auth::resolve_client_ip(
        headers,
        peer_ip,
        state.config.server.trust_forwarded_headers,
    );
    history::scope(api_key, &client_ip)
}

pub async fn stats_handler(state: &AppState) -> Response {
    match state.store.stats(10, now_ms()).await {
        Ok(stats) => axum::Json(stats).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(serde::Deserialize)]
struct ShareRequest {
    conversation_id: String,
}

/// Share a stored conversation upstream and remember the link id.
pub async fn share_handler(
    state: Arc<AppState>,
    headers: http::HeaderMap,
    peer_ip: String,
    body: bytes::Bytes,
) -> Response {
    match share(state, &headers, &peer_ip, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn share(
    state: Arc<AppState>,
    headers: &http::HeaderMap,
    peer_ip: &str,
    body: &[u8],
) -> Result<Response, GatewayError> {
    authenticate(headers, &state.allowed_client_keys)?;
    let request: ShareRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid share request: {err}")))?;
    let scope = scope_for(&state, headers, peer_ip);
    let now = now_ms();

    let mut row = state
        .store
        .get_by_id(&scope, &request.conversation_id, now)
        .await?
        .ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "unknown conversation '{}'",
                request.conversation_id
            ))
        })?;
    if row.grok_conversation_id.is_empty() || row.last_response_id.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "conversation has no upstream cursor to share".to_string(),
        ));
    }

    let session = SessionClient::new(&state.transport, &state.headers, &state.config.grok.base_url);
    let share_link_id = session
        .share_conversation(&row.grok_conversation_id, &row.last_response_id)
        .await?;

    row.share_link_id = share_link_id.clone();
    row.updated_at = now;
    state.store.upsert(&row).await?;

    Ok(axum::Json(serde_json::json!({ "share_link_id": share_link_id })).into_response())
}

#[derive(serde::Deserialize)]
struct CloneRequest {
    share_link_id: String,
}

/// Clone an upstream share link into a fresh stored conversation.
pub async fn clone_handler(
    state: Arc<AppState>,
    headers: http::HeaderMap,
    peer_ip: String,
    body: bytes::Bytes,
) -> Response {
    match clone(state, &headers, &peer_ip, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn clone(
    state: Arc<AppState>,
    headers: &http::HeaderMap,
    peer_ip: &str,
    body: &[u8],
) -> Result<Response, GatewayError> {
    authenticate(headers, &state.allowed_client_keys)?;
    let request: CloneRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid clone request: {err}")))?;
    let scope = scope_for(&state, headers, peer_ip);

    let session = SessionClient::new(&state.transport, &state.headers, &state.config.grok.base_url);
    let cloned = session.clone_share_link(&request.share_link_id).await?;

    let now = now_ms();
    let ttl_ms = i64::try_from(state.config.store.conversation_ttl_secs * 1000).unwrap_or(i64::MAX);
    let row = ConversationRow {
        scope,
        openai_conversation_id: uuid::Uuid::new_v4().to_string(),
        grok_conversation_id: cloned.conversation_id,
        last_response_id: cloned.last_response_id,
        share_link_id: request.share_link_id,
        token: state.token_fingerprint().to_string(),
        history_hash: String::new(),
        created_at: now,
        updated_at: now,
        expires_at: now + ttl_ms,
    };
    state.store.upsert(&row).await?;

    Ok(axum::Json(serde_json::json!({
        "conversation_id": row.openai_conversation_id,
    }))
    .into_response())
}

pub async fn delete_handler(
    state: Arc<AppState>,
    headers: http::HeaderMap,
    peer_ip: String,
    conversation_id: &str,
) -> Response {
    if let Err(err) = authenticate(&headers, &state.allowed_client_keys) {
        return err.into_response();
    }
    let scope = scope_for(&state, &headers, &peer_ip);
    match state.store.delete_by_id(&scope, conversation_id).await {
        Ok(()) => axum::Json(serde_json::json!({ "deleted": true })).into_response(),
        Err(err) => err.into_response(),
    }
}
