/// Account bootstrap over gRPC-Web.
///
/// The upstream exposes a handful of account endpoints that speak
/// `application/grpc-web+proto`. The flow below walks them in order and
/// stops at the first failed step, reporting a structured record per step so
/// callers can see exactly where bootstrap broke down.
use serde::Serialize;

use crate::grpcweb::{encode_grpc_web_frame, parse_grpc_web_response};
use crate::headers::HeaderBuilder;
use crate::transport::HttpTransport;

const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

/// Outcome of one bootstrap step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_status: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl StepResult {
    fn ok(step: &str, status: u16) -> Self {
        Self {
            step: step.to_string(),
            ok: true,
            status: Some(status),
            grpc_status: None,
            error: String::new(),
        }
    }

    fn failed(step: &str, status: Option<u16>, grpc_status: Option<i32>, error: String) -> Self {
        Self {
            step: step.to_string(),
            ok: false,
            status,
            grpc_status,
            error,
        }
    }
}

struct BootstrapStep {
    name: &'static str,
    url: String,
    payload: Vec<u8>,
}

fn bootstrap_steps(account_base_url: &str) -> Vec<BootstrapStep> {
    let base = account_base_url.trim_end_matches('/');
    vec![
        BootstrapStep {
            name: "start-session",
            url: format!("{base}/auth.v1.AuthService/StartSession"),
            payload: Vec::new(),
        },
        BootstrapStep {
            name: "verify-session",
            url: format!("{base}/auth.v1.AuthService/VerifySession"),
            payload: Vec::new(),
        },
        BootstrapStep {
            name: "account-snapshot",
            url: format!("{base}/account.v1.AccountService/GetAccountSnapshot"),
            payload: Vec::new(),
        },
    ]
}

/// Run the account bootstrap flow, short-circuiting on the first failure.
///
/// Every attempted step yields a [`StepResult`]; the last entry of a
/// partial run is the failing step.
pub async fn bootstrap_account(
    transport: &HttpTransport,
    headers: &HeaderBuilder,
    account_base_url: &str,
) -> Vec<StepResult> {
    let mut results = Vec::new();

    for step in bootstrap_steps(account_base_url) {
        let framed = encode_grpc_web_frame(&step.payload);
        let mut header_map = headers.grpc_web_headers();
        header_map.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(GRPC_WEB_CONTENT_TYPE),
        );

        let response = match transport.post_bytes(&step.url, header_map, framed).await {
            Ok(response) => response,
            Err(err) => {
                results.push(StepResult::failed(step.name, None, None, err.to_string()));
                return results;
            }
        };

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let content_type = response_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                results.push(StepResult::failed(
                    step.name,
                    Some(status),
                    None,
                    format!("failed to read body: {err}"),
                ));
                return results;
            }
        };

        if !(200..300).contains(&status) {
            results.push(StepResult::failed(
                step.name,
                Some(status),
                None,
                format!("unexpected HTTP status {status}"),
            ));
            return results;
        }

        match parse_grpc_web_response(&body, Some(&response_headers), content_type.as_deref()) {
            Ok(parsed) => {
                let grpc_status = parsed.grpc_status.unwrap_or(0);
                if grpc_status != 0 {
                    results.push(StepResult::failed(
                        step.name,
                        Some(status),
                        Some(grpc_status),
                        parsed.grpc_message,
                    ));
                    return results;
                }
                results.push(StepResult::ok(step.name, status));
            }
            Err(err) => {
                results.push(StepResult::failed(
                    step.name,
                    Some(status),
                    None,
                    err.to_string(),
                ));
                return results;
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered_and_rooted() {
        let steps = bootstrap_steps("https://accounts.x.ai/");
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].name, "start-session");
        assert!(steps[2]
            .url
            .starts_with("https://accounts.x.ai/account.v1."));
    }

    #[test]
    fn step_result_serialization_omits_empty_fields() {
        let ok = StepResult::ok("start-session", 200);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("error").is_none());
        assert!(json.get("grpc_status").is_none());
    }
}
