/// Opaque encoding of upstream asset URLs into image-proxy paths.
///
/// The gateway never serves asset bytes itself; it mints `/images/<encoded>`
/// paths that a matching decoder in the image-proxy collaborator reverses.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Encode a raw asset URL into an opaque proxy path segment.
///
/// Absolute URLs keep their full text under a `u_` prefix; relative inputs
/// are normalised to a leading-slash path under a `p_` prefix. Total and
/// deterministic for any input string.
#[must_use]
pub fn encode_asset_url(raw: &str) -> String {
    if parse_absolute(raw).is_some() {
        return format!("u_{}", URL_SAFE_NO_PAD.encode(raw));
    }
    if raw.starts_with('/') {
        format!("p_{}", URL_SAFE_NO_PAD.encode(raw))
    } else {
        format!("p_{}", URL_SAFE_NO_PAD.encode(format!("/{raw}")))
    }
}

/// Build the client-facing proxy URL for one asset.
#[must_use]
pub fn proxy_image_url(base_url: &str, raw: &str) -> String {
    format!(
        "{}/images/{}",
        base_url.trim_end_matches('/'),
        encode_asset_url(raw)
    )
}

/// Filter a JSON array down to proxy-worthy asset URLs.
///
/// Drops non-strings, blank entries, the bare `/` path, and absolute URLs
/// that point at an origin root with no query or fragment.
#[must_use]
pub fn normalize_asset_urls(values: &[serde_json::Value]) -> Vec<&str> {
    values
        .iter()
        .filter_map(serde_json::Value::as_str)
        .filter(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed == "/" {
                return false;
            }
            if let Some(url) = parse_absolute(trimmed) {
                if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
                    return false;
                }
            }
            true
        })
        .collect()
}

fn parse_absolute(raw: &str) -> Option<url::Url> {
    let url = url::Url::parse(raw).ok()?;
    // `url` happily parses scheme-only strings like "mailto:x"; asset URLs
    // are always host-bearing.
    url.has_host().then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absolute_urls_get_u_prefix() {
        let encoded = encode_asset_url("https://assets.grok.com/gen/1.png");
        assert!(encoded.starts_with("u_"));
        let payload = encoded.strip_prefix("u_").unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(payload).unwrap();
        assert_eq!(decoded, b"https://assets.grok.com/gen/1.png");
    }

    #[test]
    fn relative_paths_get_p_prefix_with_leading_slash() {
        let with_slash = encode_asset_url("/users/a/img.png");
        let without_slash = encode_asset_url("users/a/img.png");
        assert_eq!(with_slash, without_slash);
        assert!(with_slash.starts_with("p_"));
    }

    #[test]
    fn encoding_strips_base64_padding() {
        // Any length that would normally pad.
        let encoded = encode_asset_url("/a");
        assert!(!encoded.contains('='));
    }

    #[test]
    fn proxy_url_joins_base_and_encoding() {
        let url = proxy_image_url("https://gw.example/", "/gen/1.png");
        assert!(url.starts_with("https://gw.example/images/p_"));
    }

    #[test]
    fn normalize_drops_junk_entries() {
        let values = vec![
            json!("https://assets.grok.com/x.png"),
            json!("   "),
            json!("/"),
            json!(42),
            json!("https://assets.grok.com/"),
            json!("https://assets.grok.com/?v=1"),
            json!("relative/path.png"),
        ];
        let kept = normalize_asset_urls(&values);
        assert_eq!(
            kept,
            vec![
                "https://assets.grok.com/x.png",
                "https://assets.grok.com/?v=1",
                "relative/path.png",
            ]
        );
    }
}
