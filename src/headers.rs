/// Dynamic upstream header construction.
///
/// Every upstream call gets a fresh request id; the cookie jar, user agent,
/// and browser-shaped headers come from config and are shared across calls.
use http::header::{ACCEPT, CONTENT_TYPE, COOKIE, ORIGIN, REFERER, USER_AGENT};
use http::{HeaderMap, HeaderValue};

use crate::config::GrokConfig;

const X_REQUEST_ID: http::HeaderName = http::HeaderName::from_static("x-request-id");

/// Builds per-request upstream header maps from static account material.
pub struct HeaderBuilder {
    cookie: Option<HeaderValue>,
    user_agent: HeaderValue,
    origin: HeaderValue,
}

impl HeaderBuilder {
    #[must_use]
    pub fn new(config: &GrokConfig) -> Self {
        let cookie = if config.cookies.is_empty() {
            None
        } else {
            HeaderValue::from_str(&config.cookies.join("; ")).ok()
        };
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("Mozilla/5.0"));
        let origin = origin_of(&config.base_url)
            .and_then(|origin| HeaderValue::from_str(&origin).ok())
            .unwrap_or_else(|| HeaderValue::from_static("https://grok.com"));
        Self {
            cookie,
            user_agent,
            origin,
        }
    }

    fn common(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, self.user_agent.clone());
        headers.insert(ORIGIN, self.origin.clone());
        headers.insert(REFERER, self.origin.clone());
        if let Some(cookie) = &self.cookie {
            headers.insert(COOKIE, cookie.clone());
        }
        if let Ok(request_id) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, request_id);
        }
        headers
    }

    /// Headers for JSON REST calls (chat, session operations, rate limits).
    #[must_use]
    pub fn json_headers(&self) -> HeaderMap {
        let mut headers = self.common();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers
    }

    /// Headers for gRPC-Web calls; the caller sets the exact content type.
    #[must_use]
    pub fn grpc_web_headers(&self) -> HeaderMap {
        let mut headers = self.common();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers
    }
}

fn origin_of(base_url: &str) -> Option<String> {
    let url = url::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{host}:{port}", url.scheme())),
        None => Some(format!("{}://{host}", url.scheme())),
    }
}
