/// HTTP transport for upstream calls.
///
/// Two lazily-built reqwest clients: one with a whole-request timeout for
/// JSON calls, one without it for NDJSON streams, whose pacing is enforced
/// by the stream transformer's own timeout machine. Requests are never
/// retried here.
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::GatewayError;

pub struct HttpTransport {
    json_client: OnceLock<Arc<reqwest::Client>>,
    stream_client: OnceLock<Arc<reqwest::Client>>,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    request_timeout: Duration,
    use_env_proxy: bool,
}

fn build_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Option<Duration>,
    use_env_proxy: bool,
) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

impl HttpTransport {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        Self {
            json_client: OnceLock::new(),
            stream_client: OnceLock::new(),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            request_timeout: Duration::from_secs(config.timeout),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    fn json_client(&self) -> Result<Arc<reqwest::Client>, GatewayError> {
        if let Some(client) = self.json_client.get() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(build_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            Some(self.request_timeout),
            self.use_env_proxy,
        )?);
        Ok(Arc::clone(self.json_client.get_or_init(|| client)))
    }

    fn stream_client(&self) -> Result<Arc<reqwest::Client>, GatewayError> {
        if let Some(client) = self.stream_client.get() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(build_client(
            self.pool_max_idle_per_host,
            self.pool_idle_timeout,
            None,
            self.use_env_proxy,
        )?);
        Ok(Arc::clone(self.stream_client.get_or_init(|| client)))
    }

    /// POST a JSON payload and await the full response.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    pub async fn post_json(
        &self,
        url: &str,
        headers: http::HeaderMap,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        self.json_client()?
            .post(url)
            .headers(headers)
            .json(payload)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("POST {url} failed: {err}")))
    }

    /// POST raw bytes (gRPC-Web frames) and await the full response.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    pub async fn post_bytes(
        &self,
        url: &str,
        headers: http::HeaderMap,
        payload: Vec<u8>,
    ) -> Result<reqwest::Response, GatewayError> {
        self.json_client()?
            .post(url)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("POST {url} failed: {err}")))
    }

    /// POST a JSON payload expecting a long-lived NDJSON response body.
    ///
    /// The returned response has no whole-request timeout; callers own
    /// read pacing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    pub async fn post_json_stream(
        &self,
        url: &str,
        headers: http::HeaderMap,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        self.stream_client()?
            .post(url)
            .headers(headers)
            .json(payload)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("POST {url} failed: {err}")))
    }
}
