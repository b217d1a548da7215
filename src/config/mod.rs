pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upstream request timeout in seconds (non-stream bodies).
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(default)]
    pub http_use_env_proxy: bool,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            base_path: String::new(),
            trust_forwarded_headers: false,
            http_use_env_proxy: false,
        }
    }
}

/// Grok upstream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrokConfig {
    /// Root of the upstream REST API, without a trailing slash.
    #[serde(default = "default_grok_base_url")]
    pub base_url: String,
    /// Root of the gRPC-Web account service.
    #[serde(default = "default_account_base_url")]
    pub account_base_url: String,
    /// Public base URL used when minting asset-proxy links. Empty means
    /// "fall back to the incoming request origin".
    #[serde(default)]
    pub asset_base_url: String,
    /// Account cookies, attached verbatim to every upstream call.
    #[serde(default)]
    pub cookies: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Models advertised on `/v1/models`.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

fn default_grok_base_url() -> String {
    "https://grok.com/rest/app-chat".to_string()
}
fn default_account_base_url() -> String {
    "https://accounts.x.ai".to_string()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36".to_string()
}
fn default_models() -> Vec<String> {
    vec![
        "grok-3".to_string(),
        "grok-3-search".to_string(),
        "grok-3-imageGen".to_string(),
        "grok-3-deepsearch".to_string(),
        "grok-3-reasoning".to_string(),
        "grok-4".to_string(),
    ]
}

impl Default for GrokConfig {
    fn default() -> Self {
        Self {
            base_url: default_grok_base_url(),
            account_base_url: default_account_base_url(),
            asset_base_url: String::new(),
            cookies: Vec::new(),
            user_agent: default_user_agent(),
            models: default_models(),
        }
    }
}

/// Chat streaming behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Surface `<think>` wrappers around reasoning deltas.
    #[serde(default = "default_true")]
    pub show_thinking: bool,
    /// Surface tool-usage-card lines (needs `show_thinking` too).
    #[serde(default = "default_true")]
    pub show_search: bool,
    /// Comma-separated tag names stripped from upstream tokens.
    #[serde(default)]
    pub filtered_tags: String,
    /// Render generated videos as a poster link instead of a `<video>` tag.
    #[serde(default)]
    pub video_poster_preview: bool,
    /// Max wait for the first parsed frame, ms. 0 disables.
    #[serde(default = "default_first_chunk_timeout_ms")]
    pub first_chunk_timeout_ms: u64,
    /// Max idle between frames after the first, ms. 0 disables.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Absolute wall-clock bound for one stream, ms. 0 disables.
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_first_chunk_timeout_ms() -> u64 {
    30_000
}
fn default_chunk_timeout_ms() -> u64 {
    60_000
}
fn default_total_timeout_ms() -> u64 {
    600_000
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            show_thinking: true,
            show_search: true,
            filtered_tags: String::new(),
            video_poster_preview: false,
            first_chunk_timeout_ms: default_first_chunk_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
        }
    }
}

/// Conversation store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Lifetime of a conversation row, seconds.
    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,
    /// Rows kept per (scope, token) pair by the trim pass.
    #[serde(default = "default_keep_per_token")]
    pub keep_per_token: u32,
    /// Expired rows deleted per opportunistic cleanup pass.
    #[serde(default = "default_cleanup_batch")]
    pub cleanup_batch: u32,
}

fn default_store_path() -> String {
    "data/conversations.db".to_string()
}
fn default_conversation_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_keep_per_token() -> u32 {
    50
}
fn default_cleanup_batch() -> u32 {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            conversation_ttl_secs: default_conversation_ttl_secs(),
            keep_per_token: default_keep_per_token(),
            cleanup_batch: default_cleanup_batch(),
        }
    }
}

/// Log verbosity, normalized from the config's `features.log_level`.
///
/// The YAML keeps the upstream-style spellings (`WARNING`, `CRITICAL`,
/// `DISABLED`); everything downstream works with this typed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Disabled,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Parse a config spelling; `None` means the value is not a level we
    /// know, which validation turns into a startup error.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DISABLED" | "OFF" => Some(Self::Disabled),
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warning),
            "ERROR" | "CRITICAL" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Feature toggles that do not belong to a specific subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl FeaturesConfig {
    /// Typed view of `log_level`; validation guarantees it parses, so the
    /// fallback is unreachable in a loaded config.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level).unwrap_or(LogLevel::Info)
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Client authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API keys accepted from clients. Empty list means open access.
    #[serde(default)]
    pub allowed_keys: Vec<String>,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub grok: GrokConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load and validate configuration from a YAML file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read, parsed, or fails
/// validation.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&raw)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: AppConfig = serde_yaml::from_str("server:\n  port: 9000\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.chat.chunk_timeout_ms, 60_000);
        assert!(config.grok.base_url.starts_with("https://grok.com"));
        assert!(config.auth.allowed_keys.is_empty());
    }

    #[test]
    fn chat_flags_round_trip() {
        let yaml = "chat:\n  show_thinking: false\n  filtered_tags: \"xaiartifact,grok:render\"\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.chat.show_thinking);
        assert!(config.chat.show_search);
        assert_eq!(config.chat.filtered_tags, "xaiartifact,grok:render");
    }

    #[test]
    fn log_level_spellings_normalize() {
        assert_eq!(LogLevel::parse("disabled"), Some(LogLevel::Disabled));
        assert_eq!(LogLevel::parse("OFF"), Some(LogLevel::Disabled));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("CRITICAL"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("verbose"), None);

        let config: AppConfig =
            serde_yaml::from_str("features:\n  log_level: warning\n").unwrap();
        assert_eq!(config.features.level(), LogLevel::Warning);
    }
}
