/// Thin upstream session operations: start, continue, share, and clone.
///
/// Payloads are opaque to these helpers; response parsing is limited to the
/// identifiers the conversation store needs.
use crate::error::GatewayError;
use crate::headers::HeaderBuilder;
use crate::transport::HttpTransport;

/// Identifiers recovered from a cloned share link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonedConversation {
    pub conversation_id: String,
    pub last_response_id: String,
}

pub struct SessionClient<'a> {
    transport: &'a HttpTransport,
    headers: &'a HeaderBuilder,
    base_url: &'a str,
}

impl<'a> SessionClient<'a> {
    #[must_use]
    pub fn new(transport: &'a HttpTransport, headers: &'a HeaderBuilder, base_url: &'a str) -> Self {
        Self {
            transport,
            headers,
            base_url,
        }
    }

    /// Start a fresh upstream conversation; the response body is the NDJSON
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    pub async fn new_conversation(
        &self,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/conversations/new", self.base_url);
        self.transport
            .post_json_stream(&url, self.headers.json_headers(), payload)
            .await
    }

    /// Append a response to an existing upstream conversation; the response
    /// body is the NDJSON stream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    pub async fn continue_conversation(
        &self,
        conversation_id: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/conversations/{conversation_id}/responses", self.base_url);
        self.transport
            .post_json_stream(&url, self.headers.json_headers(), payload)
            .await
    }

    /// Create a share link for a conversation response. Returns the share
    /// link id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] on send failure or
    /// [`GatewayError::Upstream`] on a non-2xx or unreadable reply.
    pub async fn share_conversation(
        &self,
        conversation_id: &str,
        response_id: &str,
    ) -> Result<String, GatewayError> {
        let url = format!("{}/conversations/{conversation_id}/share", self.base_url);
        let payload = serde_json::json!({
            "responseId": response_id,
            "allowIndexing": true,
        });
        let response = self
            .transport
            .post_json(&url, self.headers.json_headers(), &payload)
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream { status, message });
        }
        let body: serde_json::Value = response.json().await.map_err(|err| {
            GatewayError::Upstream {
                status,
                message: format!("unreadable share response: {err}"),
            }
        })?;

        body.get("shareLinkId")
            .or_else(|| body.pointer("/shareLink/id"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| GatewayError::Upstream {
                status,
                message: "share response carried no link id".to_string(),
            })
    }

    /// Clone a shared conversation into the account, recovering the new
    /// conversation id and continuation cursor.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] on send failure or
    /// [`GatewayError::Upstream`] on a non-2xx or unusable reply.
    pub async fn clone_share_link(
        &self,
        share_link_id: &str,
    ) -> Result<ClonedConversation, GatewayError> {
        let url = format!("{}/share_links/{share_link_id}/clone", self.base_url);
        let response = self
            .transport
            .post_json(&url, self.headers.json_headers(), &serde_json::json!({}))
            .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream { status, message });
        }
        let body: serde_json::Value = response.json().await.map_err(|err| {
            GatewayError::Upstream {
                status,
                message: format!("unreadable clone response: {err}"),
            }
        })?;

        parse_clone_response(&body).ok_or_else(|| GatewayError::Upstream {
            status,
            message: "clone response carried no conversation id".to_string(),
        })
    }
}

/// Pull (conversation id, last response id) out of a clone reply. The
/// cursor prefers the last assistant-sender response and falls back to the
/// last response of any sender.
fn parse_clone_response(body: &serde_json::Value) -> Option<ClonedConversation> {
    let conversation_id = body
        .get("conversationId")
        .or_else(|| body.pointer("/conversation/conversationId"))
        .and_then(serde_json::Value::as_str)?
        .to_string();

    let mut last_any = "";
    let mut last_assistant = "";
    if let Some(responses) = body.get("responses").and_then(serde_json::Value::as_array) {
        for response in responses {
            let Some(response_id) = response
                .get("responseId")
                .and_then(serde_json::Value::as_str)
                .filter(|id| !id.is_empty())
            else {
                continue;
            };
            last_any = response_id;
            let sender = response
                .get("sender")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if sender.eq_ignore_ascii_case("assistant") {
                last_assistant = response_id;
            }
        }
    }

    let last_response_id = if last_assistant.is_empty() {
        last_any
    } else {
        last_assistant
    };

    Some(ClonedConversation {
        conversation_id,
        last_response_id: last_response_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clone_prefers_last_assistant_response() {
        let body = json!({
            "conversationId": "c-1",
            "responses": [
                {"responseId": "r-1", "sender": "human"},
                {"responseId": "r-2", "sender": "ASSISTANT"},
                {"responseId": "r-3", "sender": "human"},
            ]
        });
        let cloned = parse_clone_response(&body).unwrap();
        assert_eq!(cloned.conversation_id, "c-1");
        assert_eq!(cloned.last_response_id, "r-2");
    }

    #[test]
    fn clone_falls_back_to_last_any_sender() {
        let body = json!({
            "conversation": {"conversationId": "c-2"},
            "responses": [
                {"responseId": "r-1", "sender": "human"},
                {"responseId": "r-2", "sender": "human"},
            ]
        });
        let cloned = parse_clone_response(&body).unwrap();
        assert_eq!(cloned.conversation_id, "c-2");
        assert_eq!(cloned.last_response_id, "r-2");
    }

    #[test]
    fn clone_without_conversation_id_is_rejected() {
        assert!(parse_clone_response(&json!({"responses": []})).is_none());
    }
}
