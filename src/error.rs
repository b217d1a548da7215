/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream protocol error: {0}")]
    Stream(String),
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Client-fault upstream statuses pass through unchanged; everything else
/// the gateway reports as its own failure, so a flaky upstream 502 does
/// not masquerade as a client error.
fn passthrough_upstream_status(status: u16) -> http::StatusCode {
    match status {
        400 => http::StatusCode::BAD_REQUEST,
        401 => http::StatusCode::UNAUTHORIZED,
        403 => http::StatusCode::FORBIDDEN,
        429 => http::StatusCode::TOO_MANY_REQUESTS,
        _ => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl GatewayError {
    /// The HTTP status this error surfaces as.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => http::StatusCode::UNAUTHORIZED,
            GatewayError::Upstream { status, .. } => passthrough_upstream_status(*status),
            GatewayError::Config(_)
            | GatewayError::Transport(_)
            | GatewayError::Stream(_)
            | GatewayError::Store(_)
            | GatewayError::Internal(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The OpenAI `error.type` label matching [`Self::status_code`].
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self.status_code() {
            http::StatusCode::BAD_REQUEST => "invalid_request_error",
            http::StatusCode::UNAUTHORIZED => "authentication_error",
            http::StatusCode::FORBIDDEN => "permission_error",
            http::StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            _ => "server_error",
        }
    }
}

/// Format an error as (`status_code`, OpenAI-style JSON body).
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let status = err.status_code();
    let body = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "code": status.as_u16(),
        }
    });
    (status, body)
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_fault_upstream_statuses_pass_through() {
        let rate_limited = GatewayError::Upstream {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(rate_limited.status_code(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rate_limited.error_type(), "rate_limit_error");
    }

    #[test]
    fn other_upstream_statuses_become_gateway_failures() {
        for status in [302u16, 500, 502, 503] {
            let err = GatewayError::Upstream {
                status,
                message: String::new(),
            };
            assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(err.error_type(), "server_error");
        }
    }

    #[test]
    fn format_error_carries_openai_shape() {
        let err = GatewayError::Auth("Missing API key".into());
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], 401);
    }
}
