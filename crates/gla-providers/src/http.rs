//! Status and transport error classification shared by the HTTP backends.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};

use crate::BackendError;

const OVERFLOW_MARKERS: &[&str] = &["context", "length", "too long", "too many tokens"];

pub(crate) fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

/// `retry-after` in seconds, if present and numeric.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

pub(crate) fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> BackendError {
    let message = format!("{}: {}", status.as_u16(), body.trim());
    match status.as_u16() {
        401 | 403 => BackendError::Auth(message),
        429 => BackendError::RateLimit { retry_after, message },
        400 | 413 if mentions_overflow(body) => BackendError::ContextOverflow(message),
        408 | 504 => BackendError::Timeout(message),
        // 5xx, 529 overloaded and anything unexpected
        _ => BackendError::Unavailable(message),
    }
}

fn mentions_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    OVERFLOW_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub(crate) fn classify_transport(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Unavailable(error.to_string())
    }
}

/// Turn a non-success response into a [`BackendError`].
pub(crate) async fn error_from_response(response: Response) -> BackendError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    classify_status(status, retry_after, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    #[test]
    fn test_classify_auth_and_rate_limit() {
        assert!(matches!(classify_status(status(401), None, "bad key"), BackendError::Auth(_)));
        assert!(matches!(classify_status(status(403), None, ""), BackendError::Auth(_)));

        match classify_status(status(429), Some(Duration::from_secs(3)), "slow down") {
            BackendError::RateLimit { retry_after, .. } => assert_eq!(retry_after, Some(Duration::from_secs(3))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_overflow_only_with_marker() {
        assert!(matches!(
            classify_status(status(400), None, "prompt is too long: 210000 tokens > 200000 maximum"),
            BackendError::ContextOverflow(_)
        ));
        assert!(matches!(
            classify_status(status(400), None, "This model's maximum context length is 8192 tokens"),
            BackendError::ContextOverflow(_)
        ));
        assert!(matches!(
            classify_status(status(413), None, "request exceeds context"),
            BackendError::ContextOverflow(_)
        ));
        assert!(matches!(
            classify_status(status(400), None, "invalid temperature"),
            BackendError::Unavailable(_)
        ));
    }

    #[test]
    fn test_classify_timeouts_and_server_errors() {
        assert!(matches!(classify_status(status(408), None, ""), BackendError::Timeout(_)));
        assert!(matches!(classify_status(status(504), None, ""), BackendError::Timeout(_)));
        assert!(matches!(classify_status(status(500), None, ""), BackendError::Unavailable(_)));
        assert!(matches!(classify_status(status(529), None, "overloaded"), BackendError::Unavailable(_)));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
