use sha2::{Digest, Sha256};

use crate::auth::{build_allowed_key_set, AllowedClientKeys};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::headers::HeaderBuilder;
use crate::ratelimit::{self, RateLimitCache, RateLimitResult};
use crate::store::ConversationStore;
use crate::transport::HttpTransport;

const RATE_LIMIT_CACHE_TTL_MS: i64 = 60_000;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub headers: HeaderBuilder,
    pub store: ConversationStore,
    pub allowed_client_keys: AllowedClientKeys,
    rate_limits: RateLimitCache,
    /// Fingerprint of the configured account cookies; clusters this
    /// account's conversation rows for trimming and stats.
    token_fingerprint: String,
}

fn fingerprint_cookies(cookies: &[String]) -> String {
    let digest = Sha256::digest(cookies.join(";").as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Current epoch time in milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

impl AppState {
    /// Build the full application state, opening the conversation store.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the store cannot be opened.
    pub async fn new(config: AppConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.server);
        let headers = HeaderBuilder::new(&config.grok);
        let store = ConversationStore::connect(&config.store.path).await?;
        let allowed_client_keys = build_allowed_key_set(&config);
        let token_fingerprint = fingerprint_cookies(&config.grok.cookies);
        Ok(Self {
            config,
            transport,
            headers,
            store,
            allowed_client_keys,
            rate_limits: RateLimitCache::new(RATE_LIMIT_CACHE_TTL_MS),
            token_fingerprint,
        })
    }

    #[must_use]
    pub fn token_fingerprint(&self) -> &str {
        &self.token_fingerprint
    }

    /// Fetch (or serve from cache) the rate-limit view for one model.
    /// Upstream failures degrade to `known: false`, never an error.
    pub async fn fetch_rate_limit(&self, model: &str) -> RateLimitResult {
        let now = now_ms();
        if let Some(cached) = self.rate_limits.get(model, now) {
            return cached;
        }

        let url = format!("{}/rate-limits", self.config.grok.base_url);
        let payload = serde_json::json!({
            "requestKind": ratelimit::request_kind(model),
            "modelName": ratelimit::rate_limit_alias(model),
        });

        let result = match self
            .transport
            .post_json(&url, self.headers.json_headers(), &payload)
            .await
        {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => ratelimit::extract_rate_limit(model, &body, now),
                    Err(err) => {
                        tracing::warn!("rate-limit body unreadable for {model}: {err}");
                        RateLimitResult::unknown()
                    }
                }
            }
            Ok(response) => {
                tracing::debug!(
                    "rate-limit fetch for {model} returned {}",
                    response.status()
                );
                RateLimitResult::unknown()
            }
            Err(err) => {
                tracing::warn!("rate-limit fetch for {model} failed: {err}");
                RateLimitResult::unknown()
            }
        };

        self.rate_limits.put(model, result, now);
        result
    }
}
