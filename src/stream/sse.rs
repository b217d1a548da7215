/// OpenAI chat-completion frame encoding.
///
/// Everything the gateway emits client-side goes through these helpers so
/// the chunk shape stays identical across the transformer's branches.
use super::StreamContext;

const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Format an OpenAI-style SSE frame (no event type, just data).
#[must_use]
pub fn openai_sse_frame(json: &str) -> String {
    let mut out = String::with_capacity(10 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// The terminal `[DONE]` frame.
#[must_use]
pub fn done_frame() -> String {
    DONE_FRAME.to_owned()
}

/// Build one `chat.completion.chunk` SSE frame.
///
/// The delta carries `role`/`content` only when the content is non-empty;
/// finish-only chunks send an empty delta object.
#[must_use]
pub fn chat_chunk_frame(ctx: &StreamContext, content: &str, finish_reason: Option<&str>) -> String {
    let delta = if content.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::json!({"role": "assistant", "content": content})
    };
    let chunk = serde_json::json!({
        "id": ctx.completion_id,
        "object": "chat.completion.chunk",
        "created": ctx.created,
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    openai_sse_frame(&chunk.to_string())
}

/// Build the final non-stream `chat.completion` body.
#[must_use]
pub fn chat_completion_body(ctx: &StreamContext, content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": ctx.completion_id,
        "object": "chat.completion",
        "created": ctx.created,
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0,
        },
    })
}
