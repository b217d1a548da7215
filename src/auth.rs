use http::header::AUTHORIZATION;
use rustc_hash::FxHashSet;

use crate::config::AppConfig;
use crate::error::GatewayError;

const X_FORWARDED_FOR: http::HeaderName = http::HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: http::HeaderName = http::HeaderName::from_static("x-real-ip");

/// Compact key index used in hot-path authentication.
pub enum AllowedClientKeys {
    Empty,
    Single { raw: Box<str> },
    Multiple(FxHashSet<String>),
}

/// Build the allowed-key index from config. An empty list means open access.
#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let keys: Vec<&str> = config
        .auth
        .allowed_keys
        .iter()
        .map(String::as_str)
        .filter(|key| !key.trim().is_empty())
        .collect();
    match keys.len() {
        0 => AllowedClientKeys::Empty,
        1 => AllowedClientKeys::Single {
            raw: keys[0].into(),
        },
        _ => AllowedClientKeys::Multiple(keys.into_iter().map(ToOwned::to_owned).collect()),
    }
}

/// Extract the bearer API key from request headers, if present.
#[must_use]
pub fn extract_api_key(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Authenticate an ingress request using the prebuilt key index.
///
/// # Errors
///
/// Returns `GatewayError::Auth` when keys are configured and the request
/// carries none of them.
pub fn authenticate(
    headers: &http::HeaderMap,
    allowed: &AllowedClientKeys,
) -> Result<(), GatewayError> {
    match allowed {
        AllowedClientKeys::Empty => Ok(()),
        AllowedClientKeys::Single { raw } => {
            let key = extract_api_key(headers)
                .ok_or_else(|| GatewayError::Auth("Missing API key".to_string()))?;
            if key == raw.as_ref() {
                Ok(())
            } else {
                Err(GatewayError::Auth("Invalid API key".to_string()))
            }
        }
        AllowedClientKeys::Multiple(set) => {
            let key = extract_api_key(headers)
                .ok_or_else(|| GatewayError::Auth("Missing API key".to_string()))?;
            if set.contains(key) {
                Ok(())
            } else {
                Err(GatewayError::Auth("Invalid API key".to_string()))
            }
        }
    }
}

/// Resolve the client IP for scope derivation.
///
/// Honours `x-forwarded-for` / `x-real-ip` only when the server is configured
/// to trust forwarding proxies; otherwise the socket peer address wins.
#[must_use]
pub fn resolve_client_ip(
    headers: &http::HeaderMap,
    peer_ip: &str,
    trust_forwarded_headers: bool,
) -> String {
    if trust_forwarded_headers {
        if let Some(forwarded) = headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = headers.get(X_REAL_IP).and_then(|v| v.to_str().ok()) {
            let real_ip = real_ip.trim();
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
    }
    peer_ip.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn headers_with_bearer(key: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {key}").parse().expect("header"),
        );
        headers
    }

    #[test]
    fn empty_key_list_is_open_access() {
        let allowed = build_allowed_key_set(&AppConfig::default());
        assert!(authenticate(&http::HeaderMap::new(), &allowed).is_ok());
    }

    #[test]
    fn single_key_must_match() {
        let mut config = AppConfig::default();
        config.auth.allowed_keys = vec!["sk-test".to_string()];
        let allowed = build_allowed_key_set(&config);
        assert!(authenticate(&headers_with_bearer("sk-test"), &allowed).is_ok());
        assert!(authenticate(&headers_with_bearer("sk-other"), &allowed).is_err());
        assert!(authenticate(&http::HeaderMap::new(), &allowed).is_err());
    }

    #[test]
    fn forwarded_ip_only_when_trusted() {
        let mut headers = http::HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "10.0.0.9, 10.0.0.1".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers, "127.0.0.1", false), "127.0.0.1");
        assert_eq!(resolve_client_ip(&headers, "127.0.0.1", true), "10.0.0.9");
    }
}
