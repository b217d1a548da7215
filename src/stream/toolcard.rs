/// Incremental extraction of `<xai:tool_usage_card>` fragments from the
/// upstream token stream.
///
/// Tokens arrive split at arbitrary points, so the parser buffers text and
/// only releases it once no card opening can still be completed by later
/// input. A card is never split across an emit boundary and surrounding
/// text is never dropped or duplicated, regardless of how the input was
/// chunked.
use memchr::{memchr, memmem};
use std::borrow::Cow;

const CARD_OPEN: &str = "<xai:tool_usage_card";
const CARD_CLOSE: &str = "</xai:tool_usage_card>";
const NAME_OPEN: &str = "<xai:tool_name>";
const NAME_CLOSE: &str = "</xai:tool_name>";
const ARGS_OPEN: &str = "<xai:tool_args>";
const ARGS_CLOSE: &str = "</xai:tool_args>";
const PARTIAL_GUARD: &str = "<xai:";
/// How far back a partial `<xai:` opening is looked for when flushing text.
const TAIL_WINDOW: usize = 64;

/// One parsed tool-usage card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUsageCard {
    pub rollout_id: String,
    pub card_type: String,
    pub content: String,
}

/// Per-call parser options.
#[derive(Debug, Clone, Copy)]
pub struct ToolCardOptions<'a> {
    /// Emit `[rollout][type] line` entries for parsed cards. When false,
    /// parsed cards are silently dropped.
    pub emit_lines: bool,
    /// Rollout id used when the card's args don't carry one.
    pub fallback_rollout_id: &'a str,
}

impl Default for ToolCardOptions<'_> {
    fn default() -> Self {
        Self {
            emit_lines: true,
            fallback_rollout_id: "",
        }
    }
}

/// Text and card lines released by one consume/flush call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOutput {
    pub text: String,
    pub lines: Vec<String>,
}

impl ConsumeOutput {
    fn absorb(&mut self, other: ConsumeOutput) {
        self.text.push_str(&other.text);
        self.lines.extend(other.lines);
    }
}

// ---------------------------------------------------------------------------
// Case-insensitive scanning helpers
// ---------------------------------------------------------------------------

fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let needle_bytes = needle.as_bytes();
    if from > bytes.len() || needle_bytes.is_empty() {
        return None;
    }
    let first = needle_bytes[0];
    debug_assert!(first.is_ascii());
    let mut cursor = from;
    while let Some(rel) = memchr(first, &bytes[cursor..]) {
        let start = cursor + rel;
        let end = start + needle_bytes.len();
        if end > bytes.len() {
            return None;
        }
        if bytes[start..end].eq_ignore_ascii_case(needle_bytes) {
            return Some(start);
        }
        cursor = start + 1;
    }
    None
}

fn rfind_ci(haystack: &str, needle: &str) -> Option<usize> {
    let mut best = None;
    let mut cursor = 0;
    while let Some(pos) = find_ci(haystack, needle, cursor) {
        best = Some(pos);
        cursor = pos + 1;
    }
    best
}

fn starts_with_ci(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len() && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Whether `text` is a (possibly empty) proper prefix of `full`,
/// case-insensitively. Used to decide if more input could still complete
/// a tag already begun.
fn is_ci_prefix_of(text: &str, full: &str) -> bool {
    text.len() < full.len() && full.as_bytes()[..text.len()].eq_ignore_ascii_case(text.as_bytes())
}

// ---------------------------------------------------------------------------
// Fragment parsing
// ---------------------------------------------------------------------------

/// Unwrap CDATA sections from a string, concatenating their contents.
fn unwrap_cdata(text: &str) -> Cow<'_, str> {
    const CDATA_OPEN: &[u8] = b"<![CDATA[";
    const CDATA_CLOSE: &[u8] = b"]]>";

    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut cursor = 0usize;

    while let Some(open_rel) = memmem::find(&bytes[cursor..], CDATA_OPEN) {
        if out.is_none() {
            out = Some(String::with_capacity(text.len()));
        }
        let open = cursor + open_rel;
        let content_start = open + CDATA_OPEN.len();
        let Some(close_rel) = memmem::find(&bytes[content_start..], CDATA_CLOSE) else {
            return Cow::Borrowed(text);
        };
        let content_end = content_start + close_rel;
        if let Some(part) = text.get(content_start..content_end) {
            out.get_or_insert_with(String::new).push_str(part);
        }
        cursor = content_end + CDATA_CLOSE.len();
    }

    out.map_or_else(|| Cow::Borrowed(text), Cow::Owned)
}

/// Strict pass: walk the fragment with quick-xml, collecting the tool name
/// and the raw args text (CDATA included).
fn parse_fragment_strict(fragment: &str) -> Option<(String, Option<String>)> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    #[derive(PartialEq)]
    enum Section {
        None,
        Name,
        Args,
    }

    let mut reader = Reader::from_str(fragment);
    reader.config_mut().check_end_names = false;

    let mut section = Section::None;
    let mut name = String::new();
    let mut args: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let tag = e.name();
                if tag.as_ref().eq_ignore_ascii_case(b"xai:tool_name") {
                    section = Section::Name;
                } else if tag.as_ref().eq_ignore_ascii_case(b"xai:tool_args") {
                    section = Section::Args;
                    args.get_or_insert_with(String::new);
                }
            }
            Ok(Event::End(ref e)) => {
                let tag = e.name();
                if tag.as_ref().eq_ignore_ascii_case(b"xai:tool_name")
                    || tag.as_ref().eq_ignore_ascii_case(b"xai:tool_args")
                {
                    section = Section::None;
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().ok()?;
                match section {
                    Section::Name => name.push_str(&text),
                    Section::Args => {
                        if let Some(args) = args.as_mut() {
                            args.push_str(&text);
                        }
                    }
                    Section::None => {}
                }
            }
            Ok(Event::CData(ref e)) => {
                let text = String::from_utf8_lossy(e.as_ref());
                match section {
                    Section::Name => name.push_str(&text),
                    Section::Args => {
                        if let Some(args) = args.as_mut() {
                            args.push_str(&text);
                        }
                    }
                    Section::None => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    if name.trim().is_empty() {
        return None;
    }
    Some((name, args))
}

/// Permissive pass: plain substring extraction for fragments strict XML
/// chokes on.
fn parse_fragment_manual(fragment: &str) -> Option<(String, Option<String>)> {
    let name_open = find_ci(fragment, NAME_OPEN, 0)?;
    let name_start = name_open + NAME_OPEN.len();
    let name_close = find_ci(fragment, NAME_CLOSE, name_start)?;
    let name = fragment[name_start..name_close].to_string();
    if name.trim().is_empty() {
        return None;
    }

    let args = find_ci(fragment, ARGS_OPEN, name_close).and_then(|args_open| {
        let args_start = args_open + ARGS_OPEN.len();
        let args_close = find_ci(fragment, ARGS_CLOSE, args_start)?;
        Some(fragment[args_start..args_close].to_string())
    });

    Some((name, args))
}

enum ParsedArgs {
    Json(serde_json::Value),
    Raw(String),
}

fn normalize_tool_type(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "web_search" | "web-search" | "websearch" => "WebSearch".to_string(),
        "search_image" | "search_images" | "image_search" => "SearchImage".to_string(),
        "agent_think" | "chatroom_send" => "AgentThink".to_string(),
        "" => "Unknown".to_string(),
        _ => name.to_string(),
    }
}

const ROLLOUT_KEYS: &[&str] = &["rollout_id", "rolloutid", "rollout-id", "rollout"];
const METADATA_KEYS: &[&str] = &[
    "rollout_id",
    "rolloutid",
    "rollout-id",
    "rollout",
    "id",
    "type",
    "tool",
    "tool_name",
    "toolname",
];

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_to_content(value: &serde_json::Value) -> Option<String> {
    if let Some(scalar) = scalar_to_string(value) {
        return Some(scalar);
    }
    if let serde_json::Value::Array(items) = value {
        let parts: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
        if !parts.is_empty() {
            return Some(parts.join(", "));
        }
    }
    None
}

fn find_rollout_id(value: &serde_json::Value, depth: u32) -> Option<String> {
    if depth == 0 {
        return None;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, field) in map {
                if ROLLOUT_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                    if let Some(scalar) = scalar_to_string(field) {
                        let trimmed = scalar.trim().to_string();
                        if !trimmed.is_empty() {
                            return Some(trimmed);
                        }
                    }
                }
            }
            for field in map.values() {
                if let Some(found) = find_rollout_id(field, depth - 1) {
                    return Some(found);
                }
            }
            None
        }
        serde_json::Value::Array(items) => items
            .iter()
            .find_map(|item| find_rollout_id(item, depth - 1)),
        _ => None,
    }
}

fn preferred_content_keys(card_type: &str) -> &'static [&'static str] {
    match card_type {
        "WebSearch" => &["query", "queries", "keyword", "keywords", "prompt", "text"],
        "SearchImage" => &["query", "prompt", "description", "keywords", "text"],
        "AgentThink" => &[
            "thought",
            "reason",
            "reasoning",
            "content",
            "text",
            "summary",
            "plan",
        ],
        _ => &["content", "text", "query", "prompt", "message"],
    }
}

fn find_by_key(value: &serde_json::Value, key: &str, depth: u32) -> Option<String> {
    if depth == 0 {
        return None;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (field_key, field) in map {
                if field_key.eq_ignore_ascii_case(key) {
                    if let Some(content) = value_to_content(field) {
                        return Some(content);
                    }
                }
            }
            map.values().find_map(|field| find_by_key(field, key, depth - 1))
        }
        serde_json::Value::Array(items) => {
            items.iter().find_map(|item| find_by_key(item, key, depth - 1))
        }
        _ => None,
    }
}

fn first_non_metadata_scalar(value: &serde_json::Value, depth: u32) -> Option<String> {
    if depth == 0 {
        return None;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, field) in map {
                if METADATA_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                    continue;
                }
                if let Some(content) = value_to_content(field) {
                    return Some(content);
                }
            }
            map.values()
                .find_map(|field| first_non_metadata_scalar(field, depth - 1))
        }
        serde_json::Value::Array(items) => items
            .iter()
            .find_map(|item| first_non_metadata_scalar(item, depth - 1)),
        _ => None,
    }
}

fn normalize_content(content: &str) -> String {
    content.replace("\r\n", "\n").trim().to_string()
}

fn parse_fragment(fragment: &str, fallback_rollout: &str) -> Option<ToolUsageCard> {
    let (raw_name, raw_args) =
        parse_fragment_strict(fragment).or_else(|| parse_fragment_manual(fragment))?;

    let tool_name = unwrap_cdata(raw_name.trim()).trim().to_string();
    if tool_name.is_empty() {
        return None;
    }

    let args = raw_args.map(|raw| {
        let unwrapped = unwrap_cdata(raw.trim()).trim().to_string();
        match serde_json::from_str::<serde_json::Value>(&unwrapped) {
            Ok(value) => ParsedArgs::Json(value),
            Err(_) => ParsedArgs::Raw(unwrapped),
        }
    });

    let card_type = normalize_tool_type(&tool_name);

    let rollout_id = match &args {
        Some(ParsedArgs::Json(value)) => find_rollout_id(value, 6),
        _ => None,
    }
    .or_else(|| {
        let fallback = fallback_rollout.trim();
        (!fallback.is_empty()).then(|| fallback.to_string())
    })
    .unwrap_or_else(|| "-".to_string());

    let content = match &args {
        Some(ParsedArgs::Json(value)) => preferred_content_keys(&card_type)
            .iter()
            .find_map(|key| find_by_key(value, key, 6))
            .or_else(|| first_non_metadata_scalar(value, 6))
            .unwrap_or_default(),
        Some(ParsedArgs::Raw(raw)) => raw.clone(),
        None => String::new(),
    };

    Some(ToolUsageCard {
        rollout_id,
        card_type,
        content: normalize_content(&content),
    })
}

/// Render a card as display lines: one per non-empty content line, or the
/// bare prefix when the content is empty.
#[must_use]
pub fn card_lines(card: &ToolUsageCard) -> Vec<String> {
    let prefix = format!("[{}][{}]", card.rollout_id, card.card_type);
    let lines: Vec<String> = card
        .content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("{prefix} {line}"))
        .collect();
    if lines.is_empty() {
        vec![prefix]
    } else {
        lines
    }
}

// ---------------------------------------------------------------------------
// Streaming parser
// ---------------------------------------------------------------------------

enum FragmentEnd {
    Complete(usize),
    Incomplete,
}

pub struct ToolCardParser {
    buffer: String,
}

impl ToolCardParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Append input and release whatever can be safely decided.
    pub fn consume(&mut self, input: &str, opts: &ToolCardOptions<'_>) -> ConsumeOutput {
        let mut out = ConsumeOutput::default();
        self.buffer.push_str(input);
        self.drain(opts, false, &mut out);
        out
    }

    /// End-of-stream pass. Complete fragments still waiting on an optional
    /// trailing close tag are parsed; with `emit_incomplete_as_text`, the
    /// residual buffer is released verbatim and cleared.
    pub fn flush(&mut self, opts: &ToolCardOptions<'_>, emit_incomplete_as_text: bool) -> ConsumeOutput {
        let mut out = ConsumeOutput::default();
        self.drain(opts, true, &mut out);
        if emit_incomplete_as_text && !self.buffer.is_empty() {
            out.text.push_str(&self.buffer);
            self.buffer.clear();
        }
        out
    }

    /// One-shot consume + flush over a complete text.
    #[must_use]
    pub fn replace_tool_usage_cards_in_text(input: &str, opts: &ToolCardOptions<'_>) -> ConsumeOutput {
        let mut parser = Self::new();
        let mut out = parser.consume(input, opts);
        out.absorb(parser.flush(opts, true));
        out
    }

    fn drain(&mut self, opts: &ToolCardOptions<'_>, finalize: bool, out: &mut ConsumeOutput) {
        loop {
            let card_pos = find_ci(&self.buffer, CARD_OPEN, 0);
            let name_pos = find_ci(&self.buffer, NAME_OPEN, 0);
            let start = match (card_pos, name_pos) {
                (Some(card), Some(name)) => Some(card.min(name)),
                (card, name) => card.or(name),
            };

            let Some(start) = start else {
                self.flush_plain_text(finalize, out);
                return;
            };

            if start > 0 {
                out.text.push_str(&self.buffer[..start]);
                self.buffer.drain(..start);
                continue;
            }

            let end = if name_pos == Some(0) {
                match self.tool_name_fragment_end(finalize) {
                    FragmentEnd::Complete(end) => end,
                    FragmentEnd::Incomplete => return,
                }
            } else {
                match find_ci(&self.buffer, CARD_CLOSE, 0) {
                    Some(close) => close + CARD_CLOSE.len(),
                    None => return,
                }
            };

            let fragment: String = self.buffer[..end].to_string();
            self.buffer.drain(..end);
            match parse_fragment(&fragment, opts.fallback_rollout_id) {
                Some(card) => {
                    if opts.emit_lines {
                        out.lines.extend(card_lines(&card));
                    }
                }
                None => out.text.push_str(&fragment),
            }
        }
    }

    /// End offset of a `<xai:tool_name>` fragment: the name close, the args
    /// close, and optionally a trailing card close after whitespace. When
    /// not finalizing, a tail that could still grow into that trailing
    /// close keeps the fragment pending.
    fn tool_name_fragment_end(&self, finalize: bool) -> FragmentEnd {
        let Some(name_close) = find_ci(&self.buffer, NAME_CLOSE, 0) else {
            return FragmentEnd::Incomplete;
        };
        let Some(args_close) = find_ci(&self.buffer, ARGS_CLOSE, name_close + NAME_CLOSE.len())
        else {
            return FragmentEnd::Incomplete;
        };
        let end = args_close + ARGS_CLOSE.len();
        let rest = &self.buffer[end..];
        let ws_len = rest.len() - rest.trim_start().len();
        let after_ws = &rest[ws_len..];
        if starts_with_ci(after_ws, CARD_CLOSE) {
            return FragmentEnd::Complete(end + ws_len + CARD_CLOSE.len());
        }
        if !finalize && is_ci_prefix_of(after_ws, CARD_CLOSE) {
            return FragmentEnd::Incomplete;
        }
        FragmentEnd::Complete(end)
    }

    /// No card opening in the buffer: release text, retaining only a tail
    /// that could still become a `<xai:` opening.
    fn flush_plain_text(&mut self, finalize: bool, out: &mut ConsumeOutput) {
        if finalize {
            out.text.push_str(&self.buffer);
            self.buffer.clear();
            return;
        }

        let mut window_start = self.buffer.len().saturating_sub(TAIL_WINDOW);
        while !self.buffer.is_char_boundary(window_start) {
            window_start -= 1;
        }
        if let Some(rel) = rfind_ci(&self.buffer[window_start..], PARTIAL_GUARD) {
            let keep_from = window_start + rel;
            out.text.push_str(&self.buffer[..keep_from]);
            self.buffer.drain(..keep_from);
            return;
        }

        let tail_keep = self.partial_guard_suffix_len();
        let flush_to = self.buffer.len() - tail_keep;
        out.text.push_str(&self.buffer[..flush_to]);
        self.buffer.drain(..flush_to);
    }

    /// Length of the longest proper prefix of `<xai:` this buffer ends
    /// with, so a split opening tag is never released as text.
    fn partial_guard_suffix_len(&self) -> usize {
        let bytes = self.buffer.as_bytes();
        let guard = PARTIAL_GUARD.as_bytes();
        for keep in (1..guard.len()).rev() {
            if bytes.len() >= keep && bytes[bytes.len() - keep..].eq_ignore_ascii_case(&guard[..keep])
            {
                return keep;
            }
        }
        0
    }
}

impl Default for ToolCardParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const WEB_SEARCH_CARD: &str = "<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\"query\":\"foo\"}]]></xai:tool_args></xai:tool_usage_card>";

    fn opts(emit: bool, rollout: &'static str) -> ToolCardOptions<'static> {
        ToolCardOptions {
            emit_lines: emit,
            fallback_rollout_id: rollout,
        }
    }

    #[test]
    fn whole_card_yields_one_line() {
        let out =
            ToolCardParser::replace_tool_usage_cards_in_text(WEB_SEARCH_CARD, &opts(true, "r1"));
        assert_eq!(out.text, "");
        assert_eq!(out.lines, vec!["[r1][WebSearch] foo"]);
    }

    #[test]
    fn tool_name_fragment_split_across_chunks() {
        let mut parser = ToolCardParser::new();
        let opts = opts(true, "r1");
        let first = parser.consume(
            "<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name>",
            &opts,
        );
        assert_eq!(first.text, "");
        assert!(first.lines.is_empty());
        let second = parser.consume(
            "<xai:tool_args><![CDATA[{\"query\":\"foo\"}]]></xai:tool_args></xai:tool_usage_card>",
            &opts,
        );
        let mut out = first;
        out.absorb(second);
        out.absorb(parser.flush(&opts, true));
        assert_eq!(out.text, "");
        assert_eq!(out.lines, vec!["[r1][WebSearch] foo"]);
    }

    #[test]
    fn any_split_matches_the_unsplit_output() {
        let input = format!("before {WEB_SEARCH_CARD} after");
        let opts = opts(true, "r9");
        let whole = ToolCardParser::replace_tool_usage_cards_in_text(&input, &opts);

        for split in 1..input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let mut parser = ToolCardParser::new();
            let mut out = parser.consume(&input[..split], &opts);
            out.absorb(parser.consume(&input[split..], &opts));
            out.absorb(parser.flush(&opts, true));
            assert_eq!(out, whole, "split at {split}");
        }
    }

    #[test]
    fn text_around_cards_is_preserved() {
        let input = format!("hello {WEB_SEARCH_CARD} world");
        let out = ToolCardParser::replace_tool_usage_cards_in_text(&input, &opts(true, "r1"));
        assert_eq!(out.text, "hello  world");
        assert_eq!(out.lines.len(), 1);
    }

    #[test]
    fn cards_are_dropped_when_lines_disabled() {
        let out = ToolCardParser::replace_tool_usage_cards_in_text(WEB_SEARCH_CARD, &opts(false, "r1"));
        assert_eq!(out.text, "");
        assert!(out.lines.is_empty());
    }

    #[test]
    fn rollout_id_prefers_args_over_fallback() {
        let card = "<xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\"rollout_id\":\"abc\",\"query\":\"q\"}]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "fallback"));
        assert_eq!(out.lines, vec!["[abc][WebSearch] q"]);
    }

    #[test]
    fn missing_rollout_falls_back_to_dash() {
        let card = "<xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\"query\":\"q\"}]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, ""));
        assert_eq!(out.lines, vec!["[-][WebSearch] q"]);
    }

    #[test]
    fn unknown_tool_keeps_raw_name() {
        let card = "<xai:tool_name>browse_page</xai:tool_name><xai:tool_args><![CDATA[{\"url\":\"https://x\"}]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "r1"));
        assert_eq!(out.lines, vec!["[r1][browse_page] https://x"]);
    }

    #[test]
    fn agent_think_maps_thought_content() {
        let card = "<xai:tool_name>agent_think</xai:tool_name><xai:tool_args><![CDATA[{\"thought\":\"line one\\r\\nline two\"}]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "r1"));
        assert_eq!(
            out.lines,
            vec!["[r1][AgentThink] line one", "[r1][AgentThink] line two"]
        );
    }

    #[test]
    fn empty_content_emits_bare_prefix() {
        let card = "<xai:tool_name>agent_think</xai:tool_name><xai:tool_args><![CDATA[{}]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "r1"));
        assert_eq!(out.lines, vec!["[r1][AgentThink]"]);
    }

    #[test]
    fn cdata_wrapped_tool_name_is_unwrapped() {
        let card = "<xai:tool_name><![CDATA[web_search]]></xai:tool_name><xai:tool_args><![CDATA[{\"query\":\"q\"}]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "r1"));
        assert_eq!(out.lines, vec!["[r1][WebSearch] q"]);
    }

    #[test]
    fn non_json_args_become_raw_content() {
        let card = "<xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[not json]]></xai:tool_args>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "r1"));
        assert_eq!(out.lines, vec!["[r1][WebSearch] not json"]);
    }

    #[test]
    fn unparsable_fragment_is_reemitted_verbatim() {
        let fragment = "<xai:tool_usage_card>no name here</xai:tool_usage_card>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(fragment, &opts(true, "r1"));
        assert_eq!(out.text, fragment);
        assert!(out.lines.is_empty());
    }

    #[test]
    fn partial_open_is_retained_until_resolved() {
        let mut parser = ToolCardParser::new();
        let opts = opts(true, "r1");
        let out = parser.consume("text <xai:", &opts);
        assert_eq!(out.text, "text ");
        let out = parser.consume("tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\"query\":\"q\"}]]></xai:tool_args>", &opts);
        assert!(out.text.is_empty());
        let out = parser.flush(&opts, true);
        assert_eq!(out.lines, vec!["[r1][WebSearch] q"]);
    }

    #[test]
    fn lone_angle_bracket_tail_is_retained() {
        let mut parser = ToolCardParser::new();
        let opts = opts(true, "r1");
        let out = parser.consume("see <", &opts);
        assert_eq!(out.text, "see ");
        let out = parser.consume("3 items", &opts);
        assert_eq!(out.text, "<3 items");
    }

    #[test]
    fn unrelated_xai_tag_is_eventually_released() {
        let opts = opts(true, "r1");
        let input = format!("<xai:artifact>x</xai:artifact>{}", "y".repeat(100));
        let out = ToolCardParser::replace_tool_usage_cards_in_text(&input, &opts);
        assert_eq!(out.text, input);
        assert!(out.lines.is_empty());
    }

    #[test]
    fn flush_without_emit_keeps_incomplete_fragment() {
        let mut parser = ToolCardParser::new();
        let opts = opts(true, "r1");
        parser.consume("<xai:tool_usage_card><xai:tool_name>web_se", &opts);
        let out = parser.flush(&opts, false);
        assert_eq!(out.text, "");
        assert!(out.lines.is_empty());
        // The fragment is still buffered; a later flush can release it.
        let out = parser.flush(&opts, true);
        assert!(out.text.starts_with("<xai:tool_usage_card>"));
    }

    #[test]
    fn trailing_card_close_after_args_is_consumed() {
        let card = "<xai:tool_name>web_search</xai:tool_name><xai:tool_args><![CDATA[{\"query\":\"q\"}]]></xai:tool_args>\n</xai:tool_usage_card>";
        let out = ToolCardParser::replace_tool_usage_cards_in_text(card, &opts(true, "r1"));
        assert_eq!(out.text, "");
        assert_eq!(out.lines, vec!["[r1][WebSearch] q"]);
    }

    #[test]
    fn replace_equals_consume_plus_flush() {
        let input = format!("a {WEB_SEARCH_CARD} b <xai:tool_name>agent_think</xai:tool_name><xai:tool_args><![CDATA[{{\"thought\":\"t\"}}]]></xai:tool_args> c");
        let opts = opts(true, "rx");
        let replaced = ToolCardParser::replace_tool_usage_cards_in_text(&input, &opts);

        let mut parser = ToolCardParser::new();
        let mut manual = parser.consume(&input, &opts);
        manual.absorb(parser.flush(&opts, true));
        assert_eq!(replaced, manual);
    }
}
