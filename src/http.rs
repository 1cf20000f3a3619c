use std::time::Duration;

use reqwest::{
    header::{HeaderMap, RETRY_AFTER},
    StatusCode,
};

use crate::{
    errors::{APIError, Error},
    REQUEST_ID_HEADER,
};

/// Retry/backoff configuration for language model calls
/// (defaults use 2 attempts + jittered exponential backoff).
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Jittered exponential backoff for the given attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = if attempt == 0 {
            0
        } else {
            (attempt - 1).min(10)
        };
        let base = self.base_backoff.saturating_mul(2u32.saturating_pow(exp));
        let capped = std::cmp::min(base, self.max_backoff);
        let jitter = 0.5 + fastrand::f64(); // 0.5x .. 1.5x
        let seconds = (capped.as_secs_f64() * jitter).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    /// Delay before the next attempt, preferring a server-supplied `Retry-After`
    /// (capped at `max_backoff`).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_backoff),
            None => self.backoff_delay(attempt),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
        }
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in [REQUEST_ID_HEADER, "x-request-id", "openai-request-id"] {
        if let Some(value) = headers.get(name) {
            if let Ok(s) = value.to_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// Parses `Retry-After` expressed in (possibly fractional) seconds.
///
/// Negative, non-finite or out-of-range values are ignored.
pub(crate) fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds = raw.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Maps a non-success response onto the error taxonomy.
///
/// Throttling becomes `UpstreamRateLimited`; auth failures, timeouts and server
/// errors become `UpstreamUnavailable`; everything else is an `Api` error the
/// loop does not retry.
pub(crate) fn parse_api_error_parts(status: StatusCode, headers: &HeaderMap, body: String) -> Error {
    let api = parse_error_envelope(status, headers, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Error::UpstreamRateLimited {
            message: api.message,
            retry_after: retry_after_from_headers(headers),
            retries: None,
        };
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return Error::UpstreamUnavailable {
            message: api.to_string(),
            retries: None,
        };
    }
    api.into()
}

fn parse_error_envelope(status: StatusCode, headers: &HeaderMap, body: String) -> APIError {
    let request_id = request_id_from_headers(headers);
    let status_code = status.as_u16();
    let status_text = status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string();

    if body.is_empty() {
        return APIError {
            request_id,
            ..APIError::new(status_code, status_text)
        };
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(err_obj) = value.get("error").and_then(|v| v.as_object()) {
            let code = err_obj.get("code").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            let kind = err_obj
                .get("type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let message = err_obj
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| status_text.clone());
            return APIError {
                status: status_code,
                code,
                kind,
                message,
                request_id,
                retries: None,
                raw_body: Some(body),
            };
        }

        if let Some(message) = value.get("message").and_then(|v| v.as_str()) {
            return APIError {
                message: message.to_string(),
                request_id,
                raw_body: Some(body.clone()),
                ..APIError::new(status_code, "")
            };
        }
    }

    APIError {
        message: body.clone(),
        request_id,
        raw_body: Some(body),
        ..APIError::new(status_code, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_respects_max_and_jitter() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(1),
        };

        let delay = retry.backoff_delay(5);
        assert!(delay <= Duration::from_secs(1));
        assert!(delay >= Duration::from_millis(250));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(
            retry.delay_for(1, Some(Duration::from_secs(30))),
            Duration::from_secs(5)
        );
        assert_eq!(
            retry.delay_for(1, Some(Duration::from_millis(10))),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn disabled_retry_sets_single_attempt() {
        assert_eq!(RetryConfig::disabled().max_attempts, 1);
    }

    #[test]
    fn rate_limit_status_maps_to_rate_limited() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        let err = parse_api_error_parts(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#
                .to_string(),
        );
        match err {
            Error::UpstreamRateLimited {
                message,
                retry_after,
                ..
            } => {
                assert_eq!(message, "Rate limit reached");
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_ignores_unrepresentable_values() {
        for raw in ["1e30", "-1", "NaN", "inf", "soon"] {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_str(raw).unwrap());
            assert_eq!(retry_after_from_headers(&headers), None, "{raw}");
        }
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.25"));
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn auth_and_server_errors_map_to_unavailable() {
        let headers = HeaderMap::new();
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = parse_api_error_parts(status, &headers, String::new());
            assert!(
                matches!(err, Error::UpstreamUnavailable { .. }),
                "{status} should be unavailable"
            );
        }
    }

    #[test]
    fn client_errors_keep_envelope() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req_9"));
        let err = parse_api_error_parts(
            StatusCode::BAD_REQUEST,
            &headers,
            r#"{"error":{"message":"Unknown model","type":"invalid_request_error","code":"model_not_found"}}"#
                .to_string(),
        );
        match err {
            Error::Api(api) => {
                assert_eq!(api.status, 400);
                assert_eq!(api.code.as_deref(), Some("model_not_found"));
                assert_eq!(api.kind.as_deref(), Some("invalid_request_error"));
                assert_eq!(api.request_id.as_deref(), Some("req_9"));
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_body_becomes_message() {
        let err = parse_error_envelope(
            StatusCode::NOT_FOUND,
            &HeaderMap::new(),
            "no such route".to_string(),
        );
        assert_eq!(err.message, "no such route");
        assert_eq!(err.status, 404);
    }
}
