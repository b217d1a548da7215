/// Deterministic identity for "the same conversation so far".
///
/// The hash covers the ordered system and user texts of the request history;
/// assistant turns are deliberately excluded so a stored conversation can be
/// re-entered from the client's next request, whose history repeats the
/// server-generated assistant content verbatim or not at all.
use sha2::{Digest, Sha256};

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Extract the text of one OpenAI-style message content value.
///
/// String content is used as-is; array content concatenates the `text` field
/// of every `text`-typed item. Anything else yields an empty string.
pub(crate) fn extract_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if item.get("type").and_then(serde_json::Value::as_str) == Some("text") {
                    if let Some(text) = item.get("text").and_then(serde_json::Value::as_str) {
                        out.push_str(text);
                    }
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Hash the non-assistant history of an OpenAI message array.
///
/// Parts are `system:<text>` for each system message with non-empty text,
/// then `user:<text>` for each user message with non-empty text. With
/// `exclude_last_user`, the final user part is dropped when the history
/// contains at least one assistant message — that request is a continuation
/// and its new user turn is not yet part of the stored conversation.
///
/// Returns `""` when no parts remain.
#[must_use]
pub fn history_hash(messages: &[serde_json::Value], exclude_last_user: bool) -> String {
    let mut system_parts: Vec<String> = Vec::new();
    let mut user_parts: Vec<String> = Vec::new();
    let mut has_assistant = false;

    for message in messages {
        let role = message.get("role").and_then(serde_json::Value::as_str);
        match role {
            Some("system") => {
                let text = message.get("content").map(extract_text).unwrap_or_default();
                if !text.is_empty() {
                    system_parts.push(format!("system:{text}"));
                }
            }
            Some("user") => {
                let text = message.get("content").map(extract_text).unwrap_or_default();
                if !text.is_empty() {
                    user_parts.push(format!("user:{text}"));
                }
            }
            Some("assistant") => has_assistant = true,
            _ => {}
        }
    }

    if exclude_last_user && has_assistant && !user_parts.is_empty() {
        user_parts.pop();
    }

    let mut parts = system_parts;
    parts.extend(user_parts);
    if parts.is_empty() {
        return String::new();
    }
    sha256_hex(&parts.join("\n"))
}

/// Derive the tenant scope for conversation isolation.
///
/// A non-empty API key wins over the client IP; both are hashed so the scope
/// column never stores raw credentials.
#[must_use]
pub fn scope(api_key: Option<&str>, client_ip: &str) -> String {
    if let Some(key) = api_key {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return format!("k:{}", sha256_hex(trimmed));
        }
    }
    let ip = if client_ip.is_empty() {
        "0.0.0.0"
    } else {
        client_ip
    };
    format!("ip:{}", sha256_hex(ip))
}
