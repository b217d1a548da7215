/// Tolerant extraction of per-model rate-limit data.
///
/// The upstream's rate-limit payloads have no stable shape: fields move
/// between releases, nest under per-model buckets, and mix relative and
/// absolute reset encodings. Instead of chasing the schema, a bounded DFS
/// scores every plausible (key, value) pair against model-derived priority
/// lists and keeps the best candidate per field.
use chrono::{DateTime, NaiveDateTime};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

const MAX_DEPTH: u32 = 8;
const NESTED_HIT_MULTIPLIER: i64 = 4;

const BASE_REMAINING_KEYS: &[&str] = &[
    "remainingtokens",
    "remainingqueries",
    "remaining",
    "quota",
    "left",
    "available",
    "balance",
];
const BASE_RESET_KEYS: &[&str] = &[
    "resetat",
    "resettime",
    "retryafter",
    "timeuntilreset",
    "cooldownuntil",
    "waittime",
    "reset",
    "expiresat",
];
const MODEL_HINT_KEYS: &[&str] = &["model", "modelname", "name", "bucket", "kind", "type"];

/// Normalised rate-limit view for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub known: bool,
    pub remaining: Option<f64>,
    /// Epoch milliseconds of the next window reset.
    pub reset_at: Option<i64>,
}

impl RateLimitResult {
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            known: false,
            remaining: None,
            reset_at: None,
        }
    }
}

/// The upstream request kind a model maps to when querying rate limits.
#[must_use]
pub fn request_kind(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.ends_with("-deepersearch") || lower.ends_with("-deepsearch") {
        "DEEPSEARCH"
    } else if lower.ends_with("-reasoning") || lower.ends_with("-think") {
        "REASONING"
    } else {
        "DEFAULT"
    }
}

/// The model name the upstream rate-limit surface buckets this model under.
///
/// Variant suffixes share the base model's budget.
#[must_use]
pub fn rate_limit_alias(model: &str) -> String {
    const VARIANT_SUFFIXES: &[&str] = &[
        "-deepersearch",
        "-deepsearch",
        "-imagegen",
        "-reasoning",
        "-search",
        "-think",
    ];
    let lower = model.to_ascii_lowercase();
    for suffix in VARIANT_SUFFIXES {
        if let Some(base) = lower.strip_suffix(suffix) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    lower
}

fn normalize(input: &str) -> String {
    input
        .chars()
        .filter_map(|ch| {
            let lower = ch.to_ascii_lowercase();
            lower.is_ascii_alphanumeric().then_some(lower)
        })
        .collect()
}

fn alpha_tokens(input: &str) -> Vec<String> {
    input
        .split(|ch: char| !ch.is_ascii_alphabetic())
        .filter(|token| token.len() >= 2)
        .map(str::to_ascii_lowercase)
        .collect()
}

struct Strategy {
    aliases: Vec<String>,
    tokens: Vec<String>,
    remaining_priority: Vec<String>,
    reset_priority: Vec<String>,
}

fn dedupe_preserving_order(entries: Vec<String>) -> Vec<String> {
    let mut seen = rustc_hash::FxHashSet::default();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

fn build_priority(tokens: &[String], base: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(base.len() * (tokens.len() * 2 + 1));
    for token in tokens {
        for key in base {
            out.push(format!("{token}{key}"));
            out.push(format!("{key}{token}"));
        }
    }
    out.extend(base.iter().map(|key| (*key).to_string()));
    dedupe_preserving_order(out)
}

impl Strategy {
    fn for_model(model: &str) -> Self {
        let alias = rate_limit_alias(model);
        let aliases = dedupe_preserving_order(vec![normalize(model), normalize(&alias)]);
        let mut tokens: Vec<String> = alpha_tokens(model);
        tokens.extend(alpha_tokens(&alias));
        let tokens = dedupe_preserving_order(tokens)
            .into_iter()
            .filter(|token| {
                aliases
                    .iter()
                    .any(|candidate| candidate.contains(token.as_str()))
            })
            .collect::<Vec<_>>();
        let remaining_priority = build_priority(&tokens, BASE_REMAINING_KEYS);
        let reset_priority = build_priority(&tokens, BASE_RESET_KEYS);
        Self {
            aliases,
            tokens,
            remaining_priority,
            reset_priority,
        }
    }

    /// Position-weighted bonus for a key matching a priority entry.
    fn priority_bonus(priority: &[String], key_norm: &str) -> Option<i64> {
        priority
            .iter()
            .position(|entry| key_norm.contains(entry.as_str()))
            .map(|idx| ((priority.len() - idx) as i64) * 5)
    }

    fn key_affinity(&self, key_norm: &str) -> i64 {
        let mut best = 0i64;
        for alias in &self.aliases {
            if alias.is_empty() {
                continue;
            }
            if key_norm == alias.as_str() {
                best = best.max(120);
            } else if key_norm.contains(alias.as_str()) {
                best = best.max(70);
            }
        }
        for token in &self.tokens {
            if key_norm == token.as_str() {
                best = best.max(45);
            } else if key_norm.contains(token.as_str()) {
                best = best.max(25);
            }
        }
        best
    }

    fn value_matches_alias(&self, value: &serde_json::Value) -> bool {
        let Some(text) = value.as_str() else {
            return false;
        };
        let norm = normalize(text);
        !norm.is_empty()
            && self.aliases.iter().any(|alias| {
                alias.as_str() == norm || alias.contains(norm.as_str()) || norm.contains(alias.as_str())
            })
    }
}

#[derive(Debug, Default)]
struct Candidates {
    remaining: Option<(i64, f64)>,
    reset_at: Option<(i64, i64)>,
}

impl Candidates {
    fn offer_remaining(&mut self, score: i64, value: f64) {
        if self.remaining.is_none_or(|(best, _)| score > best) {
            self.remaining = Some((score, value));
        }
    }

    fn offer_reset(&mut self, score: i64, value: i64) {
        if self.reset_at.is_none_or(|(best, _)| score > best) {
            self.reset_at = Some((score, value));
        }
    }
}

fn numeric_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(num) => num.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_iso_timestamp(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.timestamp_millis());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    None
}

/// Interpret a numeric reset value using the key's naming as the unit hint.
fn interpret_reset_number(key_norm: &str, value: f64, now_ms: i64) -> i64 {
    let relative_seconds_key = key_norm.contains("retryafter")
        || key_norm.contains("untilreset")
        || key_norm.contains("seconds");
    if relative_seconds_key {
        if value > 1e9 {
            return (value * 1000.0) as i64;
        }
        return now_ms + (value * 1000.0) as i64;
    }
    if key_norm.ends_with("millis") || key_norm.ends_with("ms") {
        return now_ms + value as i64;
    }
    if value >= 1e12 {
        return value as i64;
    }
    if value >= 1e9 {
        return (value * 1000.0) as i64;
    }
    now_ms + (value * 1000.0) as i64
}

fn reset_candidate(key_norm: &str, value: &serde_json::Value, now_ms: i64) -> Option<i64> {
    match value {
        serde_json::Value::String(text) => {
            if let Some(ms) = parse_iso_timestamp(text) {
                return Some(ms);
            }
            let number = text.trim().parse::<f64>().ok()?;
            Some(interpret_reset_number(key_norm, number, now_ms))
        }
        serde_json::Value::Number(num) => {
            Some(interpret_reset_number(key_norm, num.as_f64()?, now_ms))
        }
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn walk(
    value: &serde_json::Value,
    strategy: &Strategy,
    candidates: &mut Candidates,
    now_ms: i64,
    depth: u32,
    inherited: i64,
    hit_multiplier: i64,
) {
    if depth == 0 {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            let hinted = map.iter().any(|(key, field)| {
                MODEL_HINT_KEYS.contains(&normalize(key).as_str())
                    && strategy.value_matches_alias(field)
            });
            let key_multiplier = if hinted { 2 } else { 1 };

            for (key, field) in map {
                let key_norm = normalize(key);
                let affinity = strategy.key_affinity(&key_norm);

                if let Some(bonus) = Strategy::priority_bonus(&strategy.remaining_priority, &key_norm)
                {
                    let score = inherited + (bonus * hit_multiplier + affinity) * key_multiplier;
                    if let Some(number) = numeric_value(field) {
                        candidates.offer_remaining(score, number);
                    } else if field.is_object() || field.is_array() {
                        walk(
                            field,
                            strategy,
                            candidates,
                            now_ms,
                            depth - 1,
                            score,
                            NESTED_HIT_MULTIPLIER,
                        );
                        continue;
                    }
                }

                if let Some(bonus) = Strategy::priority_bonus(&strategy.reset_priority, &key_norm) {
                    let score = inherited + (bonus * hit_multiplier + affinity) * key_multiplier;
                    if let Some(reset) = reset_candidate(&key_norm, field, now_ms) {
                        candidates.offer_reset(score, reset);
                    } else if field.is_object() || field.is_array() {
                        walk(
                            field,
                            strategy,
                            candidates,
                            now_ms,
                            depth - 1,
                            score,
                            NESTED_HIT_MULTIPLIER,
                        );
                        continue;
                    }
                }

                if field.is_object() || field.is_array() {
                    // Alias-affine containers carry their affinity down so a
                    // per-model bucket outranks a sibling model's bucket.
                    walk(
                        field,
                        strategy,
                        candidates,
                        now_ms,
                        depth - 1,
                        inherited + affinity,
                        hit_multiplier,
                    );
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk(
                    item,
                    strategy,
                    candidates,
                    now_ms,
                    depth - 1,
                    inherited,
                    hit_multiplier,
                );
            }
        }
        _ => {}
    }
}

/// Mine an arbitrary JSON payload for this model's remaining quota and
/// reset time. `now_ms` anchors relative reset encodings.
#[must_use]
pub fn extract_rate_limit(
    model: &str,
    payload: &serde_json::Value,
    now_ms: i64,
) -> RateLimitResult {
    let strategy = Strategy::for_model(model);
    let mut candidates = Candidates::default();
    walk(payload, &strategy, &mut candidates, now_ms, MAX_DEPTH, 0, 1);

    let remaining = candidates.remaining.map(|(_, value)| value);
    let reset_at = candidates.reset_at.map(|(_, value)| value);
    RateLimitResult {
        known: remaining.is_some() || reset_at.is_some(),
        remaining,
        reset_at,
    }
}

// ---------------------------------------------------------------------------
// TTL cache
// ---------------------------------------------------------------------------

/// Per-model cache of normalised rate-limit results.
pub struct RateLimitCache {
    entries: RwLock<FxHashMap<String, (i64, RateLimitResult)>>,
    ttl_ms: i64,
}

impl RateLimitCache {
    #[must_use]
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl_ms,
        }
    }

    #[must_use]
    pub fn get(&self, model: &str, now_ms: i64) -> Option<RateLimitResult> {
        let entries = self.entries.read();
        let (stored_at, result) = entries.get(model)?;
        (now_ms - stored_at < self.ttl_ms).then_some(*result)
    }

    pub fn put(&self, model: &str, result: RateLimitResult, now_ms: i64) {
        self.entries
            .write()
            .insert(model.to_string(), (now_ms, result));
    }
}
