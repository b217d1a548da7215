/// Non-stream collection: same frame semantics as the transformer, folded
/// into a single `chat.completion` body.
use std::fmt;

use futures_util::{Stream, StreamExt};

use super::ndjson::NdjsonLineSplitter;
use super::sse::chat_completion_body;
use super::toolcard::{ToolCardOptions, ToolCardParser};
use super::{
    effective_filtered_tags, frame_meta, image_markdown, video_html_block, ConversationMeta,
    StreamContext, StreamSettings,
};
use crate::error::GatewayError;
use crate::proxy::normalize_asset_urls;

const EMPTY_UPSTREAM_HINT: &str = "上游未返回可用内容";

/// Result of collecting an upstream body.
#[derive(Debug)]
pub struct CollectedCompletion {
    pub body: serde_json::Value,
    pub meta: ConversationMeta,
}

struct CollectState {
    meta: ConversationMeta,
    filtered_tags: Vec<String>,
    token_parts: String,
    latest_message: Option<String>,
    latest_tool_lines: Vec<String>,
    merged_content: Option<String>,
    last_tool_rollout: String,
}

/// Consume the entire NDJSON body and synthesise one completion.
///
/// # Errors
///
/// Fails on upstream error frames, `modelResponse.error`, read failures,
/// and bodies that yield no usable content at all.
pub async fn collect<S, E>(
    mut ctx: StreamContext,
    settings: &StreamSettings,
    body: S,
) -> Result<CollectedCompletion, GatewayError>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send,
    E: fmt::Debug,
{
    let mut body = Box::pin(body);
    let mut splitter = NdjsonLineSplitter::new();
    let mut lines = Vec::new();
    let mut state = CollectState {
        meta: ConversationMeta::default(),
        filtered_tags: effective_filtered_tags(&settings.filtered_tags),
        token_parts: String::new(),
        latest_message: None,
        latest_tool_lines: Vec::new(),
        merged_content: None,
        last_tool_rollout: String::new(),
    };

    while let Some(item) = body.next().await {
        let bytes =
            item.map_err(|err| GatewayError::Stream(format!("upstream read failed: {err:?}")))?;
        lines.clear();
        splitter.feed(&bytes, &mut lines);
        for line in &lines {
            handle_line(line, &mut ctx, settings, &mut state)?;
        }
    }
    if let Some(tail) = splitter.finish() {
        handle_line(&tail, &mut ctx, settings, &mut state)?;
    }

    let emit_lines = settings.show_thinking && settings.show_search;
    let opts = ToolCardOptions {
        emit_lines,
        fallback_rollout_id: &state.last_tool_rollout,
    };

    // Content precedence: terminal media, then the final message, then the
    // accumulated token text.
    let (body_text, tool_lines) = if let Some(merged) = state.merged_content {
        (merged, state.latest_tool_lines)
    } else if let Some(message) = state.latest_message {
        (message, state.latest_tool_lines)
    } else {
        let replaced = ToolCardParser::replace_tool_usage_cards_in_text(&state.token_parts, &opts);
        (replaced.text, replaced.lines)
    };

    if body_text.trim().is_empty() && tool_lines.is_empty() {
        return Err(GatewayError::Upstream {
            status: 500,
            message: EMPTY_UPSTREAM_HINT.to_string(),
        });
    }

    let content = if tool_lines.is_empty() {
        body_text
    } else if body_text.trim().is_empty() {
        format!("<think>\n{}\n</think>", tool_lines.join("\n"))
    } else {
        format!("<think>\n{}\n</think>\n{}", tool_lines.join("\n"), body_text)
    };

    Ok(CollectedCompletion {
        body: chat_completion_body(&ctx, &content),
        meta: state.meta,
    })
}

fn handle_line(
    line: &str,
    ctx: &mut StreamContext,
    settings: &StreamSettings,
    state: &mut CollectState,
) -> Result<(), GatewayError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Ok(());
    };

    if let Some(message) = frame
        .pointer("/error/message")
        .and_then(serde_json::Value::as_str)
    {
        return Err(GatewayError::Upstream {
            status: 500,
            message: message.to_string(),
        });
    }

    let (conversation_id, response_id) = frame_meta(&frame);
    state.meta.merge(conversation_id, response_id);

    let Some(grok) = frame.pointer("/result/response") else {
        return Ok(());
    };

    if let Some(message) = grok
        .pointer("/modelResponse/error")
        .and_then(serde_json::Value::as_str)
    {
        return Err(GatewayError::Upstream {
            status: 500,
            message: message.to_string(),
        });
    }

    if let Some(model) = grok
        .pointer("/userResponse/model")
        .and_then(serde_json::Value::as_str)
    {
        if !model.is_empty() {
            ctx.model = model.to_string();
        }
    }

    if let Some(rollout) = grok
        .get("rolloutId")
        .or_else(|| grok.get("toolUsageCardId"))
        .and_then(serde_json::Value::as_str)
    {
        if !rollout.is_empty() {
            state.last_tool_rollout = rollout.to_string();
        }
    }

    if let Some(video) = grok.get("streamingVideoGenerationResponse") {
        if let Some(url) = video
            .get("videoUrl")
            .and_then(serde_json::Value::as_str)
            .filter(|url| !url.is_empty())
        {
            let thumbnail = video
                .get("thumbnailImageUrl")
                .and_then(serde_json::Value::as_str)
                .filter(|thumb| !thumb.is_empty());
            state.merged_content = Some(video_html_block(
                &ctx.asset_base_url,
                settings.video_poster_preview,
                url,
                thumbnail,
            ));
        }
        return Ok(());
    }

    if let Some(urls) = grok
        .pointer("/modelResponse/generatedImageUrls")
        .and_then(serde_json::Value::as_array)
    {
        let valid = normalize_asset_urls(urls);
        if !valid.is_empty() {
            state.merged_content = Some(image_markdown(&ctx.asset_base_url, &valid));
        }
    }

    if let Some(token) = grok.get("token").and_then(serde_json::Value::as_str) {
        if !token.is_empty()
            && !state
                .filtered_tags
                .iter()
                .any(|tag| token.contains(tag.as_str()))
        {
            state.token_parts.push_str(token);
        }
    }

    if let Some(message) = grok
        .pointer("/modelResponse/message")
        .and_then(serde_json::Value::as_str)
    {
        if !message.is_empty() {
            let rollout = state.last_tool_rollout.clone();
            let opts = ToolCardOptions {
                emit_lines: settings.show_thinking && settings.show_search,
                fallback_rollout_id: &rollout,
            };
            let replaced = ToolCardParser::replace_tool_usage_cards_in_text(message, &opts);
            state.latest_message = Some(replaced.text);
            state.latest_tool_lines = replaced.lines;
        }
    }

    Ok(())
}
