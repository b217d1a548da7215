pub mod account;

/// gRPC-Web wire codec: frame encoding, frame/trailer decoding, and the
/// base64-text transport heuristic.
///
/// Only the observable subset of the protocol is implemented: enough to
/// drive the account-bootstrap endpoints and read their replies.
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use percent_encoding::percent_decode_str;
use rustc_hash::FxHashMap;

use crate::error::GatewayError;

/// Trailer frames carry this flag bit.
const TRAILER_FLAG: u8 = 0x80;
/// Compressed frames carry this flag bit; compression is unsupported.
const COMPRESSED_FLAG: u8 = 0x01;
/// How much of the body the base64-text sniffer inspects.
const BASE64_SNIFF_LIMIT: usize = 1024;

/// Parsed gRPC-Web response: message payloads plus merged trailer metadata.
#[derive(Debug, Default)]
pub struct GrpcWebParseResult {
    pub messages: Vec<Vec<u8>>,
    pub trailers: FxHashMap<String, String>,
    pub grpc_status: Option<i32>,
    pub grpc_message: String,
}

/// Encode one payload as a gRPC-Web data frame: flag byte, big-endian
/// length, payload.
#[must_use]
pub fn encode_grpc_web_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(0x00);
    out.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[inline]
fn is_base64_text_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=' | b'\r' | b'\n')
}

fn looks_like_base64_text(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    body.iter()
        .take(BASE64_SNIFF_LIMIT)
        .all(|&byte| is_base64_text_byte(byte))
}

fn decode_base64_text(body: &[u8]) -> Option<Vec<u8>> {
    let stripped: Vec<u8> = body
        .iter()
        .copied()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    BASE64_STANDARD.decode(&stripped).ok()
}

fn uri_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn parse_trailer_block(block: &[u8], trailers: &mut FxHashMap<String, String>) {
    let text = String::from_utf8_lossy(block);
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if key == "grpc-message" {
            uri_decode(value)
        } else {
            value.to_string()
        };
        trailers.insert(key, value);
    }
}

/// Parse a complete gRPC-Web response body.
///
/// The base64-text transport is detected from the content type or by
/// sniffing the leading bytes; trailer metadata missing from the body is
/// recovered from the HTTP response headers.
///
/// # Errors
///
/// Returns [`GatewayError::Stream`] when a compressed frame is encountered.
pub fn parse_grpc_web_response(
    body: &[u8],
    headers: Option<&http::HeaderMap>,
    content_type: Option<&str>,
) -> Result<GrpcWebParseResult, GatewayError> {
    let is_text_transport = content_type.is_some_and(|ct| ct.contains("grpc-web-text"));
    let decoded;
    let mut bytes = body;
    if is_text_transport || looks_like_base64_text(body) {
        if let Some(plain) = decode_base64_text(body) {
            decoded = plain;
            bytes = &decoded;
        }
    }

    let mut result = GrpcWebParseResult::default();
    let mut offset = 0usize;
    while offset + 5 <= bytes.len() {
        let flag = bytes[offset];
        let length = u32::from_be_bytes([
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
            bytes[offset + 4],
        ]) as usize;
        let end = offset + 5 + length;
        if end > bytes.len() {
            break;
        }
        let payload = &bytes[offset + 5..end];
        if flag & TRAILER_FLAG != 0 {
            parse_trailer_block(payload, &mut result.trailers);
        } else if flag & COMPRESSED_FLAG != 0 {
            return Err(GatewayError::Stream(
                "grpc-web compressed frame is not supported".to_string(),
            ));
        } else {
            result.messages.push(payload.to_vec());
        }
        offset = end;
    }

    if let Some(headers) = headers {
        if !result.trailers.contains_key("grpc-status") {
            if let Some(status) = headers.get("grpc-status").and_then(|v| v.to_str().ok()) {
                result
                    .trailers
                    .insert("grpc-status".to_string(), status.trim().to_string());
            }
        }
        if !result.trailers.contains_key("grpc-message") {
            if let Some(message) = headers.get("grpc-message").and_then(|v| v.to_str().ok()) {
                result
                    .trailers
                    .insert("grpc-message".to_string(), uri_decode(message.trim()));
            }
        }
    }

    result.grpc_status = result
        .trailers
        .get("grpc-status")
        .and_then(|s| s.parse::<i32>().ok());
    result.grpc_message = result
        .trailers
        .get("grpc-message")
        .cloned()
        .unwrap_or_default();

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trailer_frame(block: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + block.len());
        out.push(0x80);
        out.extend_from_slice(&u32::try_from(block.len()).unwrap().to_be_bytes());
        out.extend_from_slice(block);
        out
    }

    #[test]
    fn frame_round_trip() {
        let payload = b"\x0a\x05hello".to_vec();
        let body = encode_grpc_web_frame(&payload);
        let parsed = parse_grpc_web_response(&body, None, None).unwrap();
        assert_eq!(parsed.messages, vec![payload]);
        assert_eq!(parsed.grpc_status, None);
    }

    #[test]
    fn trailer_frame_sets_status_and_message() {
        let mut body = encode_grpc_web_frame(b"msg");
        body.extend_from_slice(&trailer_frame(
            b"grpc-status: 3\r\ngrpc-message: Invalid%20argument\r\n",
        ));
        let parsed = parse_grpc_web_response(&body, None, None).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.grpc_status, Some(3));
        assert_eq!(parsed.grpc_message, "Invalid argument");
    }

    #[test]
    fn status_falls_back_to_response_headers() {
        let body = encode_grpc_web_frame(b"msg");
        let mut headers = http::HeaderMap::new();
        headers.insert("grpc-status", "7".parse().unwrap());
        headers.insert("grpc-message", "Permission%20denied".parse().unwrap());
        let parsed = parse_grpc_web_response(&body, Some(&headers), None).unwrap();
        assert_eq!(parsed.grpc_status, Some(7));
        assert_eq!(parsed.grpc_message, "Permission denied");
    }

    #[test]
    fn base64_text_transport_is_decoded() {
        use base64::engine::general_purpose::STANDARD;
        let frame = encode_grpc_web_frame(b"payload");
        let text = STANDARD.encode(&frame);
        let parsed =
            parse_grpc_web_response(text.as_bytes(), None, Some("application/grpc-web-text"))
                .unwrap();
        assert_eq!(parsed.messages, vec![b"payload".to_vec()]);
    }

    #[test]
    fn base64_text_is_sniffed_without_content_type() {
        use base64::engine::general_purpose::STANDARD;
        let frame = encode_grpc_web_frame(b"sniffed");
        let text = STANDARD.encode(&frame);
        let parsed = parse_grpc_web_response(text.as_bytes(), None, None).unwrap();
        assert_eq!(parsed.messages, vec![b"sniffed".to_vec()]);
    }

    #[test]
    fn compressed_frame_is_a_hard_failure() {
        let mut body = vec![0x01];
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(b"abc");
        let err = parse_grpc_web_response(&body, None, None).unwrap_err();
        assert!(err.to_string().contains("compressed frame"));
    }

    #[test]
    fn truncated_frame_stops_the_walk() {
        let mut body = encode_grpc_web_frame(b"whole");
        body.push(0x00);
        body.extend_from_slice(&100u32.to_be_bytes());
        body.extend_from_slice(b"short");
        let parsed = parse_grpc_web_response(&body, None, None).unwrap();
        assert_eq!(parsed.messages, vec![b"whole".to_vec()]);
    }
}
