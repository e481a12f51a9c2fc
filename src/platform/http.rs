//! HTTP plumbing shared by every platform client: one lazily built reqwest
//! client, header assembly, SSE payload extraction, and status mapping.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::MusterError;

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// The SSE end-of-stream marker used by OpenAI-style endpoints.
pub const SSE_DONE: &str = "[DONE]";

/// The process-wide HTTP client. All platform clients share it, so
/// connection pooling happens in one place.
pub fn shared_client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(10)
            .build()
            .expect("http client construction")
    })
}

/// Baseline headers for a JSON API call.
pub fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Add an `Authorization: Bearer` header. A key that is not a valid header
/// value is skipped; the request then fails with the API's own 401.
pub fn with_bearer(mut headers: HeaderMap, api_key: &str) -> HeaderMap {
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}

/// Add a vendor auth header such as `api-key` or `x-api-key`.
pub fn with_header(mut headers: HeaderMap, name: &'static str, value: &str) -> HeaderMap {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
    headers
}

/// Extract the payload of an SSE `data:` line. Non-data lines and the
/// `[DONE]` marker yield `None`.
pub fn sse_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim_start();
    (payload != SSE_DONE).then_some(payload)
}

/// Map a non-success HTTP status to the matching error variant.
pub fn error_for_status(status: u16, body: &str) -> MusterError {
    match status {
        401 | 403 => MusterError::Authentication(body.to_string()),
        429 => MusterError::RateLimited {
            retry_after_ms: retry_hint(body),
        },
        _ => MusterError::Api {
            status,
            message: body.to_string(),
        },
    }
}

/// A retry-after hint in milliseconds, if the JSON error body carries one
/// (either nested under `error` or at the top level, in seconds).
fn retry_hint(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let seconds = value
        .pointer("/error/retry_after")
        .or_else(|| value.get("retry_after"))
        .and_then(|v| v.as_f64())?;
    Some((seconds * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_payload_extraction() {
        assert_eq!(sse_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_payload("data:{\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_payload("data: [DONE]"), None);
        assert_eq!(sse_payload("event: ping"), None);
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_for_status(401, "nope"),
            MusterError::Authentication(_)
        ));
        assert!(matches!(
            error_for_status(500, "boom"),
            MusterError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn rate_limit_carries_retry_hint() {
        let err = error_for_status(429, r#"{"error":{"retry_after":1.5}}"#);
        assert!(matches!(
            err,
            MusterError::RateLimited {
                retry_after_ms: Some(1500)
            }
        ));
        let bare = error_for_status(429, r#"{"retry_after":2}"#);
        assert!(matches!(
            bare,
            MusterError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
    }
}
