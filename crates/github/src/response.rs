//! Mapping HTTP responses and transport failures onto [`PortError`].
//!
//! Shared by the REST client and the registry client so that both report
//! rate limiting, authentication failures, and server errors identically.

use std::time::Duration;

use dispatch::PortError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Longest response body kept in an error message.
const MAX_BODY_LEN: usize = 512;

/// Maps a non-success response onto a [`PortError`].
///
/// `what` names the resource for `NotFound` messages; `now_epoch` is the
/// current Unix time, used to turn `x-ratelimit-reset` into a delay.
pub(crate) fn error_for_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    what: &str,
    now_epoch: i64,
) -> PortError {
    match status.as_u16() {
        401 => PortError::Unauthorized {
            message: message_from_body(body),
        },
        404 => PortError::NotFound {
            what: what.to_string(),
        },
        403 | 429 if is_rate_limited(status, headers) => PortError::RateLimited {
            retry_after: retry_after(headers, now_epoch),
        },
        403 => PortError::Unauthorized {
            message: message_from_body(body),
        },
        code => PortError::UnexpectedResponse {
            status: code,
            body: truncate(body),
        },
    }
}

/// Maps a transport-level failure.
pub(crate) fn transport_error(err: reqwest::Error) -> PortError {
    if err.is_decode() {
        PortError::Decode {
            message: err.to_string(),
        }
    } else {
        PortError::Transport {
            message: err.to_string(),
        }
    }
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || headers.contains_key("retry-after")
        || header_str(headers, "x-ratelimit-remaining") == Some("0")
}

/// Reads the advised delay from `retry-after` (seconds) or, failing that,
/// from `x-ratelimit-reset` (Unix time).
pub(crate) fn retry_after(headers: &HeaderMap, now_epoch: i64) -> Option<Duration> {
    if let Some(secs) = header_str(headers, "retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    header_str(headers, "x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|reset| Duration::from_secs(reset.saturating_sub(now_epoch).max(0) as u64))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extracts GitHub's `{"message": ...}` or the registry's
/// `{"errors": [{"message": ...}]}`, falling back to the raw body.
pub(crate) fn message_from_body(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        value
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| {
                value
                    .get("errors")
                    .and_then(|e| e.get(0))
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
            })
            .map(str::to_string)
    });
    message.unwrap_or_else(|| truncate(body))
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_BODY_LEN {
        return body.to_string();
    }
    let mut end = MAX_BODY_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_not_found_names_resource() {
        let err = error_for_status(StatusCode::NOT_FOUND, &HeaderMap::new(), "", "run 42", 0);
        assert_eq!(
            err,
            PortError::NotFound {
                what: "run 42".into()
            }
        );
    }

    #[test]
    fn test_unauthorized_uses_github_message() {
        let err = error_for_status(
            StatusCode::UNAUTHORIZED,
            &HeaderMap::new(),
            r#"{"message":"Bad credentials","documentation_url":"https://docs.github.com"}"#,
            "repo",
            0,
        );
        assert_eq!(
            err,
            PortError::Unauthorized {
                message: "Bad credentials".into()
            }
        );
    }

    #[test]
    fn test_registry_error_body_message() {
        assert_eq!(
            message_from_body(r#"{"errors":[{"code":"DENIED","message":"requested access to the resource is denied"}]}"#),
            "requested access to the resource is denied"
        );
    }

    #[test]
    fn test_forbidden_with_exhausted_quota_is_rate_limited() {
        let h = headers(&[
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1700000060"),
        ]);
        let err = error_for_status(StatusCode::FORBIDDEN, &h, "", "runs", 1_700_000_000);
        assert_eq!(
            err,
            PortError::RateLimited {
                retry_after: Some(Duration::from_secs(60))
            }
        );
    }

    #[test]
    fn test_plain_forbidden_is_unauthorized() {
        let err = error_for_status(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "4999")]),
            r#"{"message":"Resource not accessible by integration"}"#,
            "workflow",
            0,
        );
        assert!(matches!(err, PortError::Unauthorized { .. }));
    }

    #[test]
    fn test_secondary_rate_limit_retry_after() {
        let err = error_for_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "17")]),
            "",
            "runs",
            0,
        );
        assert_eq!(
            err,
            PortError::RateLimited {
                retry_after: Some(Duration::from_secs(17))
            }
        );
    }

    #[test]
    fn test_reset_in_the_past_means_no_wait() {
        let h = headers(&[("x-ratelimit-reset", "100")]);
        assert_eq!(retry_after(&h, 200), Some(Duration::ZERO));
    }

    #[test]
    fn test_server_error_keeps_truncated_body() {
        let body = "x".repeat(2000);
        match error_for_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), &body, "runs", 0) {
            PortError::UnexpectedResponse { status, body } => {
                assert_eq!(status, 502);
                assert!(body.len() < 600);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
