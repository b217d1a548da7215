/// NDJSON → SSE stream translation.
///
/// One transformer owns all transient state for a single stream: upstream
/// frames are parsed line by line and re-emitted as OpenAI chat-completion
/// chunks, with think-tag bracketing, tool-card extraction, video progress
/// framing, image terminals, and a three-tier timeout machine
/// (first-byte / inter-chunk / total).
///
/// The work runs on a spawned task feeding a bounded channel; if the client
/// goes away every later send becomes a no-op while `on_finish` still fires
/// exactly once.
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::ndjson::NdjsonLineSplitter;
use super::sse::{chat_chunk_frame, done_frame};
use super::toolcard::{ToolCardOptions, ToolCardParser};
use super::{
    effective_filtered_tags, frame_meta, image_markdown, video_html_block, ConversationMeta,
    StreamContext, StreamFinishResult, StreamHooks, StreamSettings,
};
use crate::proxy::normalize_asset_urls;

const THINK_OPEN: &str = "<think>\n";
const THINK_CLOSE: &str = "\n</think>\n";
const VIDEO_THINK_CLOSE: &str = "</think>\n";
const VIDEO_PROGRESS_PREFIX: &str = "视频已生成";
const EMPTY_UPSTREAM_HINT: &str = "上游未返回可用内容";

pub struct StreamTransformer {
    ctx: StreamContext,
    settings: StreamSettings,
    hooks: Arc<dyn StreamHooks>,
}

struct Emitter {
    tx: mpsc::Sender<bytes::Bytes>,
    closed: bool,
}

impl Emitter {
    async fn send(&mut self, frame: String) {
        if self.closed {
            return;
        }
        if self.tx.send(bytes::Bytes::from(frame)).await.is_err() {
            self.closed = true;
        }
    }
}

enum FrameOutcome {
    Continue,
    /// A terminal chunk and `[DONE]` were already emitted.
    Terminal,
}

enum Finish {
    Clean,
    AlreadyDone,
}

struct TransformState {
    meta: ConversationMeta,
    parser: ToolCardParser,
    filtered_tags: Vec<String>,
    first_received: bool,
    think_open: bool,
    video_think_open: bool,
    video_progress: f64,
    pending_video: Option<(String, Option<String>)>,
    video_emitted: bool,
    image_mode: bool,
    emitted_content: bool,
    latest_message: Option<String>,
    last_tool_rollout: String,
    final_status: u16,
}

impl TransformState {
    fn new(settings: &StreamSettings) -> Self {
        Self {
            meta: ConversationMeta::default(),
            parser: ToolCardParser::new(),
            filtered_tags: effective_filtered_tags(&settings.filtered_tags),
            first_received: false,
            think_open: false,
            video_think_open: false,
            video_progress: 0.0,
            pending_video: None,
            video_emitted: false,
            image_mode: false,
            emitted_content: false,
            latest_message: None,
            last_tool_rollout: String::new(),
            final_status: 200,
        }
    }
}

/// Effective timeout for the next read, or `None` for unbounded.
fn effective_timeout(
    settings: &StreamSettings,
    first_received: bool,
    elapsed: Duration,
) -> Option<Duration> {
    let per_read = if first_received {
        settings.chunk_timeout
    } else {
        settings.first_chunk_timeout
    };
    let per_read = (!per_read.is_zero()).then_some(per_read);
    let total_left = (!settings.total_timeout.is_zero())
        .then(|| settings.total_timeout.saturating_sub(elapsed));

    match (per_read, total_left) {
        (Some(read), Some(total)) => Some(read.min(total)),
        (bound, None) | (None, bound) => bound,
    }
}

impl StreamTransformer {
    #[must_use]
    pub fn new(ctx: StreamContext, settings: StreamSettings, hooks: Arc<dyn StreamHooks>) -> Self {
        Self {
            ctx,
            settings,
            hooks,
        }
    }

    /// Spawn the translation task and return the client-facing SSE stream.
    pub fn into_stream<S, E>(self, body: S) -> impl Stream<Item = bytes::Bytes> + Send
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: fmt::Debug + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            self.pump(body, tx).await;
        });
        futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
    }

    async fn pump<S, E>(mut self, body: S, tx: mpsc::Sender<bytes::Bytes>)
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: fmt::Debug,
    {
        let start = Instant::now();
        let mut emitter = Emitter { tx, closed: false };
        let mut state = TransformState::new(&self.settings);

        let outcome = self.process(body, &mut emitter, &mut state, start).await;
        match outcome {
            Ok(Finish::Clean) => self.finish_normal(&mut emitter, &mut state).await,
            Ok(Finish::AlreadyDone) => {}
            Err(message) => self.finish_exception(&mut emitter, &mut state, &message).await,
        }

        self.hooks
            .on_finish(StreamFinishResult {
                status: state.final_status,
                duration_seconds: start.elapsed().as_secs_f64(),
                meta: state.meta.clone(),
            })
            .await;
    }

    async fn process<S, E>(
        &mut self,
        body: S,
        emitter: &mut Emitter,
        state: &mut TransformState,
        start: Instant,
    ) -> Result<Finish, String>
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: fmt::Debug,
    {
        let mut body = Box::pin(body);
        let mut splitter = NdjsonLineSplitter::new();
        let mut lines = Vec::new();

        loop {
            let bound = effective_timeout(&self.settings, state.first_received, start.elapsed());
            let next = match bound {
                Some(bound) => match tokio::time::timeout(bound, body.next()).await {
                    Ok(item) => item,
                    // Graceful synthetic stop, never an error to the client.
                    Err(_) => return Ok(Finish::Clean),
                },
                None => body.next().await,
            };

            match next {
                Some(Ok(bytes)) => {
                    lines.clear();
                    splitter.feed(&bytes, &mut lines);
                    let drained: Vec<String> = lines.drain(..).collect();
                    for line in drained {
                        match self.handle_line(&line, emitter, state).await? {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Terminal => return Ok(Finish::AlreadyDone),
                        }
                    }
                }
                Some(Err(err)) => return Err(format!("upstream read failed: {err:?}")),
                None => {
                    if let Some(tail) = splitter.finish() {
                        match self.handle_line(&tail, emitter, state).await? {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Terminal => return Ok(Finish::AlreadyDone),
                        }
                    }
                    return Ok(Finish::Clean);
                }
            }
        }
    }

    async fn handle_line(
        &mut self,
        line: &str,
        emitter: &mut Emitter,
        state: &mut TransformState,
    ) -> Result<FrameOutcome, String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(FrameOutcome::Continue);
        }
        // One malformed line never poisons the stream.
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            return Ok(FrameOutcome::Continue);
        };

        self.update_meta(&frame, state).await;
        state.first_received = true;

        if let Some(message) = frame
            .pointer("/error/message")
            .and_then(serde_json::Value::as_str)
        {
            state.final_status = 500;
            self.flush_and_close(emitter, state).await;
            emitter
                .send(chat_chunk_frame(
                    &self.ctx,
                    &format!("Error: {message}"),
                    Some("stop"),
                ))
                .await;
            emitter.send(done_frame()).await;
            return Ok(FrameOutcome::Terminal);
        }

        let Some(grok) = frame.pointer("/result/response") else {
            return Ok(FrameOutcome::Continue);
        };

        if let Some(model) = grok
            .pointer("/userResponse/model")
            .and_then(serde_json::Value::as_str)
        {
            if !model.is_empty() {
                self.ctx.model = model.to_string();
            }
        }

        if let Some(video) = grok.get("streamingVideoGenerationResponse") {
            self.handle_video_frame(video, emitter, state).await;
            return Ok(FrameOutcome::Continue);
        }

        if grok.get("imageAttachmentInfo").is_some() {
            // Image mode is sticky for the remainder of the stream.
            state.image_mode = true;
        }
        if state.image_mode {
            return self.handle_image_frame(grok, emitter, state).await;
        }

        self.handle_text_frame(grok, emitter, state).await;
        Ok(FrameOutcome::Continue)
    }

    async fn update_meta(&mut self, frame: &serde_json::Value, state: &mut TransformState) {
        let (conversation_id, response_id) = frame_meta(frame);
        if state.meta.merge(conversation_id, response_id) {
            self.hooks.on_meta(&state.meta).await;
        }
    }

    async fn handle_video_frame(
        &mut self,
        video: &serde_json::Value,
        emitter: &mut Emitter,
        state: &mut TransformState,
    ) {
        let progress = video
            .get("progress")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);

        if progress > state.video_progress {
            if self.settings.show_thinking {
                let mut chunk = String::new();
                if !state.video_think_open {
                    chunk.push_str("<think>");
                    state.video_think_open = true;
                }
                chunk.push_str(VIDEO_PROGRESS_PREFIX);
                chunk.push_str(&format!("{}%", progress as u32));
                if progress >= 100.0 {
                    chunk.push_str("</think>\n");
                    state.video_think_open = false;
                } else {
                    chunk.push('\n');
                }
                emitter.send(chat_chunk_frame(&self.ctx, &chunk, None)).await;
                state.emitted_content = true;
            }
            state.video_progress = progress;
        }

        if let Some(url) = video
            .get("videoUrl")
            .and_then(serde_json::Value::as_str)
            .filter(|url| !url.is_empty())
        {
            let thumbnail = video
                .get("thumbnailImageUrl")
                .and_then(serde_json::Value::as_str)
                .filter(|thumb| !thumb.is_empty())
                .map(ToOwned::to_owned);
            state.pending_video = Some((url.to_string(), thumbnail));

            if progress >= 100.0 && !state.video_emitted {
                let block = self.pending_video_block(state);
                if !block.is_empty() {
                    emitter.send(chat_chunk_frame(&self.ctx, &block, None)).await;
                    state.video_emitted = true;
                    state.emitted_content = true;
                }
            }
        }
    }

    fn pending_video_block(&self, state: &TransformState) -> String {
        let Some((video_url, thumbnail)) = &state.pending_video else {
            return String::new();
        };
        video_html_block(
            &self.ctx.asset_base_url,
            self.settings.video_poster_preview,
            video_url,
            thumbnail.as_deref(),
        )
    }

    async fn handle_image_frame(
        &mut self,
        grok: &serde_json::Value,
        emitter: &mut Emitter,
        state: &mut TransformState,
    ) -> Result<FrameOutcome, String> {
        if let Some(urls) = grok
            .pointer("/modelResponse/generatedImageUrls")
            .and_then(serde_json::Value::as_array)
        {
            let valid = normalize_asset_urls(urls);
            if !valid.is_empty() {
                let mut content = String::new();
                if state.think_open {
                    content.push_str(THINK_CLOSE);
                    state.think_open = false;
                }
                if state.video_think_open {
                    content.push_str(VIDEO_THINK_CLOSE);
                    state.video_think_open = false;
                }
                content.push_str(&image_markdown(&self.ctx.asset_base_url, &valid));
                emitter
                    .send(chat_chunk_frame(&self.ctx, &content, Some("stop")))
                    .await;
                emitter.send(done_frame()).await;
                state.emitted_content = true;
                return Ok(FrameOutcome::Terminal);
            }
        }

        // Interim frames surface their raw token untouched.
        if let Some(token) = grok
            .get("token")
            .and_then(serde_json::Value::as_str)
            .filter(|token| !token.is_empty())
        {
            emitter.send(chat_chunk_frame(&self.ctx, token, None)).await;
            state.emitted_content = true;
        }
        Ok(FrameOutcome::Continue)
    }

    async fn handle_text_frame(
        &mut self,
        grok: &serde_json::Value,
        emitter: &mut Emitter,
        state: &mut TransformState,
    ) {
        let thinking = grok
            .get("isThinking")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if let Some(rollout) = grok
            .get("rolloutId")
            .or_else(|| grok.get("toolUsageCardId"))
        {
            if let Some(rollout) = scalar_as_string(rollout) {
                state.last_tool_rollout = rollout;
            }
        }

        if let Some(message) = grok
            .pointer("/modelResponse/message")
            .and_then(serde_json::Value::as_str)
        {
            if !message.is_empty() {
                state.latest_message = Some(message.to_string());
            }
        }

        let mut token = grok
            .get("token")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        if !token.is_empty() && state.filtered_tags.iter().any(|tag| token.contains(tag.as_str())) {
            token = "";
        }

        let emit_lines = self.settings.show_thinking && self.settings.show_search;
        let rollout = state.last_tool_rollout.clone();
        let opts = ToolCardOptions {
            emit_lines,
            fallback_rollout_id: &rollout,
        };
        let parsed = state.parser.consume(token, &opts);

        let mut chunk = String::new();
        if self.settings.show_thinking {
            if thinking && !state.think_open {
                chunk.push_str(THINK_OPEN);
                state.think_open = true;
            } else if !thinking && state.think_open {
                chunk.push_str(THINK_CLOSE);
                state.think_open = false;
            }
        }

        let suppressed = thinking && !self.settings.show_thinking;
        if !suppressed {
            for line in &parsed.lines {
                chunk.push_str(line);
                chunk.push('\n');
            }
            if grok.get("messageTag").and_then(serde_json::Value::as_str) == Some("header")
                && !parsed.text.is_empty()
            {
                chunk.push_str("\n\n");
                chunk.push_str(&parsed.text);
                chunk.push_str("\n\n");
            } else {
                chunk.push_str(&parsed.text);
            }
        }

        if !chunk.is_empty() {
            emitter.send(chat_chunk_frame(&self.ctx, &chunk, None)).await;
            state.emitted_content = true;
        }
    }

    /// Flush the tool-card buffer and close open think wrappers; used by
    /// the error paths where a terminal chunk follows immediately.
    async fn flush_and_close(&mut self, emitter: &mut Emitter, state: &mut TransformState) {
        let rollout = state.last_tool_rollout.clone();
        let opts = ToolCardOptions {
            emit_lines: self.settings.show_thinking && self.settings.show_search,
            fallback_rollout_id: &rollout,
        };
        let flushed = state.parser.flush(&opts, true);
        let mut chunk = String::new();
        for line in &flushed.lines {
            chunk.push_str(line);
            chunk.push('\n');
        }
        chunk.push_str(&flushed.text);
        if state.think_open {
            chunk.push_str(THINK_CLOSE);
            state.think_open = false;
        }
        if state.video_think_open {
            chunk.push_str(VIDEO_THINK_CLOSE);
            state.video_think_open = false;
        }
        if !chunk.is_empty() {
            emitter.send(chat_chunk_frame(&self.ctx, &chunk, None)).await;
            state.emitted_content = true;
        }
    }

    async fn finish_normal(&mut self, emitter: &mut Emitter, state: &mut TransformState) {
        let rollout = state.last_tool_rollout.clone();
        let emit_lines = self.settings.show_thinking && self.settings.show_search;
        let opts = ToolCardOptions {
            emit_lines,
            fallback_rollout_id: &rollout,
        };

        // Residual tool buffer goes out as text.
        let flushed = state.parser.flush(&opts, true);
        let mut chunk = String::new();
        for line in &flushed.lines {
            chunk.push_str(line);
            chunk.push('\n');
        }
        chunk.push_str(&flushed.text);
        if !chunk.is_empty() {
            emitter.send(chat_chunk_frame(&self.ctx, &chunk, None)).await;
            state.emitted_content = true;
        }

        // Streams that never produced tokens fall back to the final
        // modelResponse message, then to the empty-upstream hint.
        if !state.emitted_content {
            if let Some(message) = state.latest_message.take() {
                let replaced = ToolCardParser::replace_tool_usage_cards_in_text(&message, &opts);
                let mut fallback = String::new();
                for line in &replaced.lines {
                    fallback.push_str(line);
                    fallback.push('\n');
                }
                fallback.push_str(&replaced.text);
                if !fallback.is_empty() {
                    emitter
                        .send(chat_chunk_frame(&self.ctx, &fallback, None))
                        .await;
                    state.emitted_content = true;
                }
            }
        }
        if !state.emitted_content {
            emitter
                .send(chat_chunk_frame(&self.ctx, EMPTY_UPSTREAM_HINT, None))
                .await;
            state.emitted_content = true;
        }

        let mut close = String::new();
        if state.think_open {
            close.push_str(THINK_CLOSE);
            state.think_open = false;
        }
        if state.video_think_open {
            close.push_str(VIDEO_THINK_CLOSE);
            state.video_think_open = false;
        }
        if !close.is_empty() {
            emitter.send(chat_chunk_frame(&self.ctx, &close, None)).await;
        }

        if !state.video_emitted && state.pending_video.is_some() {
            let block = self.pending_video_block(state);
            if !block.is_empty() {
                emitter.send(chat_chunk_frame(&self.ctx, &block, None)).await;
                state.video_emitted = true;
            }
        }

        emitter
            .send(chat_chunk_frame(&self.ctx, "", Some("stop")))
            .await;
        emitter.send(done_frame()).await;
    }

    async fn finish_exception(
        &mut self,
        emitter: &mut Emitter,
        state: &mut TransformState,
        message: &str,
    ) {
        state.final_status = 500;
        self.flush_and_close(emitter, state).await;
        emitter
            .send(chat_chunk_frame(
                &self.ctx,
                &format!("处理错误: {message}"),
                Some("error"),
            ))
            .await;
        emitter.send(done_frame()).await;
    }
}

fn scalar_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_tags_exclude_parser_owned_tags() {
        let tags = effective_filtered_tags("xaiartifact, xai:tool_usage_card ,grok:render,");
        assert_eq!(tags, vec!["xaiartifact", "grok:render"]);
        // Substrings of the card opener would shred cards mid-stream.
        assert!(effective_filtered_tags("xai:").is_empty());
    }

    #[test]
    fn effective_timeout_picks_the_tightest_bound() {
        let mut settings = StreamSettings::default();
        settings.first_chunk_timeout = Duration::from_secs(10);
        settings.chunk_timeout = Duration::from_secs(30);
        settings.total_timeout = Duration::from_secs(60);

        assert_eq!(
            effective_timeout(&settings, false, Duration::ZERO),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            effective_timeout(&settings, true, Duration::from_secs(50)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            effective_timeout(&settings, true, Duration::from_secs(20)),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn zero_timeouts_disable_bounds() {
        let mut settings = StreamSettings::default();
        settings.first_chunk_timeout = Duration::ZERO;
        settings.chunk_timeout = Duration::ZERO;
        settings.total_timeout = Duration::ZERO;
        assert_eq!(effective_timeout(&settings, false, Duration::ZERO), None);
        assert_eq!(effective_timeout(&settings, true, Duration::from_secs(9999)), None);
    }
}
