/// `POST /v1/chat/completions` — the request flow the rest of the crate
/// exists for: scope + history hash → stored-conversation lookup →
/// continue-or-start upstream → stream or collect → persist the cursor.
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use crate::auth::{self, authenticate};
use crate::error::GatewayError;
use crate::history;
use crate::ratelimit;
use crate::session::SessionClient;
use crate::state::{now_ms, AppState};
use crate::store::ConversationRow;
use crate::stream::collector::collect;
use crate::stream::transformer::StreamTransformer;
use crate::stream::{
    ConversationMeta, StreamContext, StreamFinishResult, StreamHooks, StreamSettings,
};

use super::{request_origin, sse_ok_response};

const UPSTREAM_ERROR_BODY_LIMIT: usize = 2048;

#[derive(serde::Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    stream: bool,
}

pub async fn handler(
    state: Arc<AppState>,
    headers: http::HeaderMap,
    peer_ip: String,
    body: bytes::Bytes,
) -> Response {
    match handle(state, headers, peer_ip, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: Arc<AppState>,
    headers: http::HeaderMap,
    peer_ip: String,
    body: bytes::Bytes,
) -> Result<Response, GatewayError> {
    authenticate(&headers, &state.allowed_client_keys)?;

    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid request body: {err}")))?;
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }
    if !state.config.grok.models.iter().any(|m| m == &request.model) {
        return Err(GatewayError::InvalidRequest(format!(
            "unknown model '{}'",
            request.model
        )));
    }

    let api_key = auth::extract_api_key(&headers);
    let client_ip = auth::resolve_client_ip(
        &headers,
        &peer_ip,
        state.config.server.trust_forwarded_headers,
    );
    let scope = history::scope(api_key, &client_ip);
    // The lookup drops the newest user turn (it is not yet stored); the
    // persisted hash covers the full history so the next request can find
    // this conversation again.
    let lookup_hash = history::history_hash(&request.messages, true);
    let store_hash = history::history_hash(&request.messages, false);

    let now = now_ms();
    let existing = state
        .store
        .find_by_history_hash(&scope, &lookup_hash, now)
        .await?;

    let session = SessionClient::new(&state.transport, &state.headers, &state.config.grok.base_url);
    let payload = build_upstream_payload(&request.model, &request.messages, existing.as_ref());

    let continuation = existing
        .as_ref()
        .filter(|row| !row.grok_conversation_id.is_empty());
    let response = match continuation {
        Some(row) => {
            tracing::debug!(
                "continuing conversation {} for scope {}",
                row.grok_conversation_id,
                scope
            );
            session
                .continue_conversation(&row.grok_conversation_id, &payload)
                .await?
        }
        None => session.new_conversation(&payload).await?,
    };

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        let message: String = message.chars().take(UPSTREAM_ERROR_BODY_LIMIT).collect();
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            message,
        });
    }

    let asset_base = if state.config.grok.asset_base_url.trim().is_empty() {
        request_origin(&headers)
    } else {
        state.config.grok.asset_base_url.clone()
    };
    let ctx = StreamContext::new(&request.model, &asset_base);
    let settings = StreamSettings::from_chat_config(&state.config.chat);

    let (openai_conversation_id, created_at) = match &existing {
        Some(row) => (row.openai_conversation_id.clone(), row.created_at),
        None => (uuid::Uuid::new_v4().to_string(), now),
    };
    let hooks = Arc::new(ConversationPersistence {
        state: Arc::clone(&state),
        scope,
        openai_conversation_id,
        history_hash: store_hash,
        share_link_id: existing
            .as_ref()
            .map(|row| row.share_link_id.clone())
            .unwrap_or_default(),
        created_at,
    });

    if request.stream {
        let transformer = StreamTransformer::new(ctx, settings, hooks);
        let sse = transformer.into_stream(response.bytes_stream());
        let body = Body::from_stream(sse.map(Ok::<_, Infallible>));
        return Ok(sse_ok_response(body));
    }

    let started = std::time::Instant::now();
    let collected = collect(ctx, &settings, response.bytes_stream()).await?;
    hooks.on_meta(&collected.meta).await;
    hooks
        .on_finish(StreamFinishResult {
            status: 200,
            duration_seconds: started.elapsed().as_secs_f64(),
            meta: collected.meta.clone(),
        })
        .await;

    Ok(axum::Json(collected.body).into_response())
}

/// Translate the OpenAI request into the upstream conversation payload.
///
/// New conversations carry the flattened history; continuations send only
/// the newest user turn plus the stored cursor.
fn build_upstream_payload(
    model: &str,
    messages: &[serde_json::Value],
    existing: Option<&ConversationRow>,
) -> serde_json::Value {
    let lower = model.to_ascii_lowercase();
    let message = if existing.is_some() {
        last_user_text(messages)
    } else {
        flatten_history(messages)
    };

    let mut payload = serde_json::json!({
        "temporary": false,
        "modelName": ratelimit::rate_limit_alias(model),
        "message": message,
        "fileAttachments": [],
        "imageAttachments": [],
        "disableSearch": false,
        "enableImageGeneration": lower.ends_with("-imagegen"),
        "returnImageBytes": false,
        "enableImageStreaming": true,
        "imageGenerationCount": 2,
        "forceConcise": false,
        "toolOverrides": {},
        "sendFinalMetadata": true,
    });

    if lower.ends_with("-search") {
        payload["toolOverrides"] = serde_json::json!({"webSearch": true});
    }
    if lower.ends_with("-deepsearch") || lower.ends_with("-deepersearch") {
        payload["deepsearchPreset"] = serde_json::Value::String("default".to_string());
    }
    if lower.ends_with("-reasoning") || lower.ends_with("-think") {
        payload["isReasoning"] = serde_json::Value::Bool(true);
    }
    if let Some(row) = existing {
        if !row.last_response_id.is_empty() {
            payload["parentResponseId"] =
                serde_json::Value::String(row.last_response_id.clone());
        }
    }

    payload
}

fn flatten_history(messages: &[serde_json::Value]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = message
            .get("role")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("user");
        let text = message
            .get("content")
            .map(history::extract_text)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&text);
    }
    out
}

fn last_user_text(messages: &[serde_json::Value]) -> String {
    for message in messages.iter().rev() {
        if message.get("role").and_then(serde_json::Value::as_str) == Some("user") {
            let text = message
                .get("content")
                .map(history::extract_text)
                .unwrap_or_default();
            if !text.is_empty() {
                return text;
            }
        }
    }
    flatten_history(messages)
}

/// Persists the upstream cursor as it becomes known and runs the
/// opportunistic store maintenance after the stream ends.
struct ConversationPersistence {
    state: Arc<AppState>,
    scope: String,
    openai_conversation_id: String,
    history_hash: String,
    share_link_id: String,
    created_at: i64,
}

#[async_trait::async_trait]
impl StreamHooks for ConversationPersistence {
    async fn on_meta(&self, meta: &ConversationMeta) {
        if meta.grok_conversation_id.is_empty() && meta.last_response_id.is_empty() {
            return;
        }
        let now = now_ms();
        let ttl_ms =
            i64::try_from(self.state.config.store.conversation_ttl_secs * 1000).unwrap_or(i64::MAX);
        let row = ConversationRow {
            scope: self.scope.clone(),
            openai_conversation_id: self.openai_conversation_id.clone(),
            grok_conversation_id: meta.grok_conversation_id.clone(),
            last_response_id: meta.last_response_id.clone(),
            share_link_id: self.share_link_id.clone(),
            token: self.state.token_fingerprint().to_string(),
            history_hash: self.history_hash.clone(),
            created_at: self.created_at,
            updated_at: now,
            expires_at: now + ttl_ms,
        };
        if let Err(err) = self.state.store.upsert(&row).await {
            tracing::warn!("conversation upsert failed: {err}");
        }
    }

    async fn on_finish(&self, result: StreamFinishResult) {
        tracing::info!(
            status = result.status,
            duration_seconds = result.duration_seconds,
            conversation = %result.meta.grok_conversation_id,
            "stream finished"
        );
        let now = now_ms();
        let batch = self.state.config.store.cleanup_batch;
        if let Err(err) = self.state.store.cleanup_expired(batch, now).await {
            tracing::warn!("expired-row cleanup failed: {err}");
        }
        let keep = self.state.config.store.keep_per_token;
        if let Err(err) = self
            .state
            .store
            .trim_for_token(&self.scope, self.state.token_fingerprint(), keep)
            .await
        {
            tracing::warn!("token trim failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_conversations_flatten_the_history() {
        let messages = vec![
            json!({"role": "system", "content": "S"}),
            json!({"role": "user", "content": "U1"}),
        ];
        let payload = build_upstream_payload("grok-3", &messages, None);
        assert_eq!(payload["message"], "system: S\nuser: U1");
        assert_eq!(payload["modelName"], "grok-3");
        assert!(payload.get("parentResponseId").is_none());
    }

    #[test]
    fn continuations_send_only_the_last_user_turn() {
        let messages = vec![
            json!({"role": "user", "content": "U1"}),
            json!({"role": "assistant", "content": "A1"}),
            json!({"role": "user", "content": "U2"}),
        ];
        let row = ConversationRow {
            scope: "s".into(),
            openai_conversation_id: "o".into(),
            grok_conversation_id: "g".into(),
            last_response_id: "r-9".into(),
            share_link_id: String::new(),
            token: "t".into(),
            history_hash: "h".into(),
            created_at: 0,
            updated_at: 0,
            expires_at: 1,
        };
        let payload = build_upstream_payload("grok-3", &messages, Some(&row));
        assert_eq!(payload["message"], "U2");
        assert_eq!(payload["parentResponseId"], "r-9");
    }

    #[test]
    fn model_variants_shape_the_payload() {
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let search = build_upstream_payload("grok-3-search", &messages, None);
        assert_eq!(search["modelName"], "grok-3");
        assert_eq!(search["toolOverrides"]["webSearch"], true);

        let image = build_upstream_payload("grok-3-imageGen", &messages, None);
        assert_eq!(image["enableImageGeneration"], true);

        let deep = build_upstream_payload("grok-3-deepsearch", &messages, None);
        assert_eq!(deep["deepsearchPreset"], "default");

        let reasoning = build_upstream_payload("grok-3-reasoning", &messages, None);
        assert_eq!(reasoning["isReasoning"], true);
    }
}
