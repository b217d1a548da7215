//! Non-stream collector behaviour.
use std::convert::Infallible;
use std::time::Duration;

use grokify_rs::error::GatewayError;
use grokify_rs::proxy::proxy_image_url;
use grokify_rs::stream::collector::collect;
use grokify_rs::stream::{StreamContext, StreamSettings};

const ASSET_BASE: &str = "https://gw.test";

fn fixed_ctx() -> StreamContext {
    StreamContext::with_identity("chatcmpl-fixed", 1_700_000_000, "grok-3", ASSET_BASE)
}

fn settings() -> StreamSettings {
    let mut settings = StreamSettings::default();
    settings.first_chunk_timeout = Duration::ZERO;
    settings.chunk_timeout = Duration::ZERO;
    settings.total_timeout = Duration::ZERO;
    settings
}

fn body_of(frames: &[&str]) -> impl futures_util::Stream<Item = Result<bytes::Bytes, Infallible>> {
    let chunks: Vec<Result<bytes::Bytes, Infallible>> = frames
        .iter()
        .map(|frame| Ok(bytes::Bytes::from(frame.as_bytes().to_vec())))
        .collect();
    futures_util::stream::iter(chunks)
}

fn content_of(body: &serde_json::Value) -> &str {
    body["choices"][0]["message"]["content"].as_str().unwrap()
}

#[tokio::test]
async fn falls_back_to_tokens_when_no_model_response() {
    let collected = collect(
        fixed_ctx(),
        &settings(),
        body_of(&[
            "{\"result\":{\"response\":{\"token\":\"h\"}}}\n",
            "{\"result\":{\"response\":{\"token\":\"i\"}}}\n",
        ]),
    )
    .await
    .unwrap();
    assert_eq!(content_of(&collected.body), "hi");
    assert_eq!(collected.body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn model_response_message_wins_over_tokens() {
    let collected = collect(
        fixed_ctx(),
        &settings(),
        body_of(&[
            "{\"result\":{\"response\":{\"token\":\"partial\"}}}\n",
            "{\"result\":{\"response\":{\"modelResponse\":{\"message\":\"final answer\"}}}}\n",
        ]),
    )
    .await
    .unwrap();
    assert_eq!(content_of(&collected.body), "final answer");
}

#[tokio::test]
async fn fails_on_root_error_frame() {
    let err = collect(
        fixed_ctx(),
        &settings(),
        body_of(&["{\"error\":{\"message\":\"bad\"}}\n"]),
    )
    .await
    .unwrap_err();
    match err {
        GatewayError::Upstream { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "bad");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn fails_on_model_response_error() {
    let err = collect(
        fixed_ctx(),
        &settings(),
        body_of(&["{\"result\":{\"response\":{\"modelResponse\":{\"error\":\"generation failed\"}}}}\n"]),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("generation failed"));
}

#[tokio::test]
async fn fails_when_upstream_is_empty() {
    let err = collect(fixed_ctx(), &settings(), body_of(&[]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("上游未返回可用内容"));
}

#[tokio::test]
async fn tool_lines_become_a_think_prefix() {
    let collected = collect(
        fixed_ctx(),
        &settings(),
        body_of(&[
            "{\"result\":{\"response\":{\"rolloutId\":\"r1\",\"modelResponse\":{\"message\":\"<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\\\"query\\\":\\\"foo\\\"}]]></xai:tool_args></xai:tool_usage_card>body text\"}}}}\n",
        ]),
    )
    .await
    .unwrap();
    assert_eq!(
        content_of(&collected.body),
        "<think>\n[r1][WebSearch] foo\n</think>\nbody text"
    );
}

#[tokio::test]
async fn tool_lines_without_body_have_no_trailing_newline() {
    let collected = collect(
        fixed_ctx(),
        &settings(),
        body_of(&[
            "{\"result\":{\"response\":{\"rolloutId\":\"r1\",\"modelResponse\":{\"message\":\"<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\\\"query\\\":\\\"foo\\\"}]]></xai:tool_args></xai:tool_usage_card>\"}}}}\n",
        ]),
    )
    .await
    .unwrap();
    assert_eq!(
        content_of(&collected.body),
        "<think>\n[r1][WebSearch] foo\n</think>"
    );
}

#[tokio::test]
async fn image_terminal_overrides_text() {
    let collected = collect(
        fixed_ctx(),
        &settings(),
        body_of(&[
            "{\"result\":{\"response\":{\"token\":\"drawing...\"}}}\n",
            "{\"result\":{\"response\":{\"modelResponse\":{\"generatedImageUrls\":[\"https://x/y.png\"]}}}}\n",
        ]),
    )
    .await
    .unwrap();
    let expected = format!(
        "![Generated Image]({})",
        proxy_image_url(ASSET_BASE, "https://x/y.png")
    );
    assert_eq!(content_of(&collected.body), expected);
}

#[tokio::test]
async fn meta_is_recovered_from_frames() {
    let collected = collect(
        fixed_ctx(),
        &settings(),
        body_of(&[
            "{\"result\":{\"conversation\":{\"conversationId\":\"c3\"},\"response\":{\"token\":\"x\",\"responseId\":\"r3\"}}}\n",
        ]),
    )
    .await
    .unwrap();
    assert_eq!(collected.meta.grok_conversation_id, "c3");
    assert_eq!(collected.meta.last_response_id, "r3");
}

#[tokio::test]
async fn filtered_tokens_are_dropped() {
    let mut settings = settings();
    settings.filtered_tags = "xaiartifact".to_string();
    let collected = collect(
        fixed_ctx(),
        &settings,
        body_of(&[
            "{\"result\":{\"response\":{\"token\":\"<xaiartifact id=1>\"}}}\n",
            "{\"result\":{\"response\":{\"token\":\"kept\"}}}\n",
        ]),
    )
    .await
    .unwrap();
    assert_eq!(content_of(&collected.body), "kept");
}
