pub mod collector;
pub mod ndjson;
pub mod sse;
pub mod toolcard;
pub mod transformer;

use std::time::Duration;

use crate::config::ChatConfig;
use crate::proxy::proxy_image_url;

/// Tags the tool-card parser consumes itself; the generic tag filter must
/// never be allowed to shred these mid-stream.
const PARSER_OWNED_TAGS: &[&str] = &["<xai:tool_usage_card>", "<xai:tool_name>"];

/// Parse the filtered-tags CSV, dropping entries that would match the tool
/// card parser's own opening tags.
pub(crate) fn effective_filtered_tags(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .filter(|tag| {
            let lower = tag.to_ascii_lowercase();
            !PARSER_OWNED_TAGS
                .iter()
                .any(|owned| owned.contains(lower.as_str()))
        })
        .map(ToOwned::to_owned)
        .collect()
}

/// Render a finished video as an HTML block with proxied URLs.
pub(crate) fn video_html_block(
    asset_base_url: &str,
    poster_preview: bool,
    video_url: &str,
    thumbnail: Option<&str>,
) -> String {
    let video = proxy_image_url(asset_base_url, video_url);
    if poster_preview {
        match thumbnail {
            Some(thumb) => {
                let poster = proxy_image_url(asset_base_url, thumb);
                format!(
                    "\n<a href=\"{video}\" target=\"_blank\"><img src=\"{poster}\" alt=\"Generated Video\" /></a>\n"
                )
            }
            None => format!("\n<a href=\"{video}\" target=\"_blank\">Generated Video</a>\n"),
        }
    } else {
        match thumbnail {
            Some(thumb) => {
                let poster = proxy_image_url(asset_base_url, thumb);
                format!("\n<video controls src=\"{video}\" poster=\"{poster}\"></video>\n")
            }
            None => format!("\n<video controls src=\"{video}\"></video>\n"),
        }
    }
}

/// Render generated image URLs as Markdown, one image per line.
pub(crate) fn image_markdown(asset_base_url: &str, urls: &[&str]) -> String {
    urls.iter()
        .map(|url| format!("![Generated Image]({})", proxy_image_url(asset_base_url, url)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the (conversation id, response id) pair an NDJSON frame carries,
/// trying the response-id locations in their observed priority order.
pub(crate) fn frame_meta(frame: &serde_json::Value) -> (Option<&str>, Option<&str>) {
    let conversation_id = frame
        .pointer("/result/conversation/conversationId")
        .and_then(serde_json::Value::as_str);
    let response_id = frame
        .pointer("/result/response/responseId")
        .and_then(serde_json::Value::as_str)
        .or_else(|| {
            frame
                .pointer("/result/response/modelResponse/responseId")
                .and_then(serde_json::Value::as_str)
        })
        .or_else(|| {
            frame
                .pointer("/result/modelResponse/responseId")
                .and_then(serde_json::Value::as_str)
        })
        .or_else(|| {
            frame
                .pointer("/result/userResponse/responseId")
                .and_then(serde_json::Value::as_str)
        });
    (conversation_id, response_id)
}

/// Upstream conversation identifiers observed while streaming.
///
/// Both fields start empty; later frames may fill them but never blank them
/// out again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationMeta {
    pub grok_conversation_id: String,
    pub last_response_id: String,
}

impl ConversationMeta {
    /// Merge newly observed identifiers. Returns true when either field
    /// changed, which is the collaborators' signal to persist.
    pub fn merge(&mut self, conversation_id: Option<&str>, response_id: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(id) = conversation_id {
            if !id.is_empty() && id != self.grok_conversation_id {
                self.grok_conversation_id = id.to_string();
                changed = true;
            }
        }
        if let Some(id) = response_id {
            if !id.is_empty() && id != self.last_response_id {
                self.last_response_id = id.to_string();
                changed = true;
            }
        }
        changed
    }
}

/// Terminal report of one stream.
#[derive(Debug, Clone)]
pub struct StreamFinishResult {
    /// 200 for clean streams, 500 when an upstream error surfaced.
    pub status: u16,
    pub duration_seconds: f64,
    pub meta: ConversationMeta,
}

/// Collaborator callbacks driven by the transformer.
///
/// Both are awaited inline on the stream task; implementations must not
/// call back into the stream.
#[async_trait::async_trait]
pub trait StreamHooks: Send + Sync {
    async fn on_meta(&self, meta: &ConversationMeta);
    async fn on_finish(&self, result: StreamFinishResult);
}

/// Hooks that do nothing; useful for tests and fire-and-forget callers.
pub struct NoopHooks;

#[async_trait::async_trait]
impl StreamHooks for NoopHooks {
    async fn on_meta(&self, _meta: &ConversationMeta) {}
    async fn on_finish(&self, _result: StreamFinishResult) {}
}

/// Behavioural settings for one stream, resolved from config.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub show_thinking: bool,
    pub show_search: bool,
    /// Comma-separated tag names whose tokens are dropped.
    pub filtered_tags: String,
    pub video_poster_preview: bool,
    /// Zero disables the bound.
    pub first_chunk_timeout: Duration,
    pub chunk_timeout: Duration,
    pub total_timeout: Duration,
}

impl StreamSettings {
    #[must_use]
    pub fn from_chat_config(chat: &ChatConfig) -> Self {
        Self {
            show_thinking: chat.show_thinking,
            show_search: chat.show_search,
            filtered_tags: chat.filtered_tags.clone(),
            video_poster_preview: chat.video_poster_preview,
            first_chunk_timeout: Duration::from_millis(chat.first_chunk_timeout_ms),
            chunk_timeout: Duration::from_millis(chat.chunk_timeout_ms),
            total_timeout: Duration::from_millis(chat.total_timeout_ms),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_chat_config(&ChatConfig::default())
    }
}

/// Identity of one client-facing completion, fixed at stream start so the
/// output is independent of upstream chunk boundaries.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// `chatcmpl-<uuid v4>`.
    pub completion_id: String,
    /// Seconds epoch at stream start.
    pub created: u64,
    pub model: String,
    /// Base URL prefixed onto asset-proxy paths.
    pub asset_base_url: String,
}

impl StreamContext {
    #[must_use]
    pub fn new(model: &str, asset_base_url: &str) -> Self {
        let created = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |duration| duration.as_secs());
        Self {
            completion_id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created,
            model: model.to_string(),
            asset_base_url: asset_base_url.to_string(),
        }
    }

    /// Fixed-identity constructor for deterministic tests.
    #[must_use]
    pub fn with_identity(
        completion_id: &str,
        created: u64,
        model: &str,
        asset_base_url: &str,
    ) -> Self {
        Self {
            completion_id: completion_id.to_string(),
            created,
            model: model.to_string(),
            asset_base_url: asset_base_url.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_merge_is_monotonic() {
        let mut meta = ConversationMeta::default();
        assert!(meta.merge(Some("c1"), None));
        assert!(meta.merge(None, Some("r1")));
        assert!(!meta.merge(Some(""), Some("")));
        assert!(!meta.merge(Some("c1"), Some("r1")));
        assert!(meta.merge(None, Some("r2")));
        assert_eq!(meta.grok_conversation_id, "c1");
        assert_eq!(meta.last_response_id, "r2");
    }

    #[test]
    fn context_mints_chatcmpl_ids() {
        let ctx = StreamContext::new("grok-3", "");
        assert!(ctx.completion_id.starts_with("chatcmpl-"));
    }
}
