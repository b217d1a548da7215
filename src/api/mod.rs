pub mod account;
pub mod chat;
pub mod conversations;
pub mod health;
pub mod models;
pub mod ratelimits;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

enum RouteMatch<'a> {
    Health,
    Models,
    ChatCompletions,
    RateLimits,
    ConversationStats,
    ShareConversation,
    CloneConversation,
    DeleteConversation { conversation_id: &'a str },
    AccountBootstrap,
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    peer_ip: String,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, request_body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());
    let query = parts.uri.query().unwrap_or("").to_string();

    let response = match route {
        RouteMatch::Health => health::handler(),
        RouteMatch::Models => models::handler(&state),
        RouteMatch::RateLimits => ratelimits::handler(&state, &query).await,
        RouteMatch::ConversationStats => conversations::stats_handler(&state).await,
        RouteMatch::ChatCompletions => {
            let body_bytes = match read_request_body(request_body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            chat::handler(state, parts.headers, peer_ip, body_bytes).await
        }
        RouteMatch::ShareConversation => {
            let body_bytes = match read_request_body(request_body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            conversations::share_handler(state, parts.headers, peer_ip, body_bytes).await
        }
        RouteMatch::CloneConversation => {
            let body_bytes = match read_request_body(request_body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            conversations::clone_handler(state, parts.headers, peer_ip, body_bytes).await
        }
        RouteMatch::DeleteConversation { conversation_id } => {
            conversations::delete_handler(state, parts.headers, peer_ip, conversation_id).await
        }
        RouteMatch::AccountBootstrap => account::bootstrap_handler(state, parts.headers).await,
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(request_body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(request_body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 2MiB)",
            )
                .into_response()
        })
}

fn match_route<'a>(method: &Method, path: &'a str, base_path: &str) -> RouteMatch<'a> {
    let Some(path) = path.strip_prefix(base_path) else {
        return RouteMatch::NotFound;
    };
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    match path {
        "/health" => match *method {
            Method::GET => RouteMatch::Health,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/models" => match *method {
            Method::GET => RouteMatch::Models,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/chat/completions" => match *method {
            Method::POST => RouteMatch::ChatCompletions,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/rate-limits" => match *method {
            Method::GET => RouteMatch::RateLimits,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/conversations/stats" => match *method {
            Method::GET => RouteMatch::ConversationStats,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/conversations/share" => match *method {
            Method::POST => RouteMatch::ShareConversation,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/conversations/clone" => match *method {
            Method::POST => RouteMatch::CloneConversation,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/v1/account/bootstrap" => match *method {
            Method::POST => RouteMatch::AccountBootstrap,
            _ => RouteMatch::MethodNotAllowed,
        },
        _ => {
            if let Some(conversation_id) = path
                .strip_prefix("/v1/conversations/")
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            {
                return match *method {
                    Method::DELETE => RouteMatch::DeleteConversation { conversation_id },
                    _ => RouteMatch::MethodNotAllowed,
                };
            }
            RouteMatch::NotFound
        }
    }
}

/// Standard SSE response wrapper.
#[must_use]
pub(crate) fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

/// Origin of the incoming request, used when config omits an asset base URL.
#[must_use]
pub(crate) fn request_origin(headers: &http::HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_path_variants() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("/api/"), "/api");
        assert_eq!(normalize_base_path("api"), "/api");
    }

    #[test]
    fn route_matching_covers_the_surface() {
        assert!(matches!(
            match_route(&Method::POST, "/v1/chat/completions", ""),
            RouteMatch::ChatCompletions
        ));
        assert!(matches!(
            match_route(&Method::GET, "/v1/chat/completions", ""),
            RouteMatch::MethodNotAllowed
        ));
        assert!(matches!(
            match_route(&Method::DELETE, "/v1/conversations/abc", ""),
            RouteMatch::DeleteConversation {
                conversation_id: "abc"
            }
        ));
        assert!(matches!(
            match_route(&Method::GET, "/api/v1/models", "/api"),
            RouteMatch::Models
        ));
        assert!(matches!(
            match_route(&Method::GET, "/nope", ""),
            RouteMatch::NotFound
        ));
    }
}
