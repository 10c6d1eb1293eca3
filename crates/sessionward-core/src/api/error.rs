use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: ErrorBody },

    #[error("Session expired - please log in again ({body})")]
    AuthExpired {
        body: ErrorBody,
        /// Why the refresh did not rescue the request, if one was attempted
        cause: Option<String>,
    },

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        ApiError::Http {
            status,
            body: ErrorBody::parse(status, body),
        }
    }

    /// HTTP status carried by the error, if a response was obtained
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::AuthExpired { .. } => Some(401),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401, .. })
    }
}

/// Structured error payload returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl ErrorBody {
    /// Parse an error response body.
    ///
    /// Accepts `{code, message, details}`, the same wrapped in `{"detail": ..}`,
    /// or `{"detail": "text"}`. Anything else becomes a minimal body built from
    /// the status line.
    pub fn parse(status: u16, body: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if let Some(parsed) = Self::from_value(&value) {
                return parsed;
            }
        }
        Self::from_status_line(status, body)
    }

    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if let Some(message) = object.get("message").and_then(Value::as_str) {
            return Some(Self {
                code: object.get("code").and_then(Value::as_str).map(str::to_string),
                message: message.to_string(),
                details: object.get("details").cloned(),
            });
        }
        match object.get("detail")? {
            Value::String(text) => Some(Self {
                code: None,
                message: text.clone(),
                details: None,
            }),
            nested @ Value::Object(_) => Self::from_value(nested),
            // Validation errors arrive as a list under "detail"
            other => Some(Self {
                code: None,
                message: "Request validation failed".to_string(),
                details: Some(other.clone()),
            }),
        }
    }

    fn from_status_line(status: u16, body: &str) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown Status");
        let body = body.trim();
        Self {
            code: None,
            message: format!("{} {}", status, reason),
            details: (!body.is_empty()).then(|| Value::String(ApiError::truncate_body(body))),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_flat_error_body() {
        let body = ErrorBody::parse(
            429,
            r#"{"code":"GLB_RATE_LIMIT","message":"Too many requests","details":{"wait_seconds":60}}"#,
        );
        assert_eq!(body.code.as_deref(), Some("GLB_RATE_LIMIT"));
        assert_eq!(body.message, "Too many requests");
        assert_eq!(body.details, Some(json!({ "wait_seconds": 60 })));
    }

    #[test]
    fn test_parse_wrapped_error_body() {
        let body = ErrorBody::parse(
            401,
            r#"{"detail":{"code":"AUTH_INVALID_TOKEN","message":"Refresh token missing"}}"#,
        );
        assert_eq!(body.code.as_deref(), Some("AUTH_INVALID_TOKEN"));
        assert_eq!(body.message, "Refresh token missing");
        assert_eq!(body.to_string(), "Refresh token missing [AUTH_INVALID_TOKEN]");
    }

    #[test]
    fn test_parse_string_detail() {
        let body = ErrorBody::parse(400, r#"{"detail":"The CAPTCHA validation failed."}"#);
        assert_eq!(body.code, None);
        assert_eq!(body.message, "The CAPTCHA validation failed.");
    }

    #[test]
    fn test_parse_validation_list() {
        let body = ErrorBody::parse(422, r#"{"detail":[{"loc":["body","identifier"]}]}"#);
        assert_eq!(body.message, "Request validation failed");
        assert!(body.details.is_some());
    }

    #[test]
    fn test_unparseable_body_uses_status_line() {
        let body = ErrorBody::parse(502, "<html>Bad Gateway</html>");
        assert_eq!(body.message, "502 Bad Gateway");
        assert_eq!(body.details, Some(json!("<html>Bad Gateway</html>")));

        let empty = ErrorBody::parse(503, "");
        assert_eq!(empty.message, "503 Service Unavailable");
        assert_eq!(empty.details, None);
    }

    #[test]
    fn test_long_body_is_truncated() {
        let long = "x".repeat(2000);
        let body = ErrorBody::parse(500, &long);
        let Some(Value::String(details)) = body.details else {
            panic!("expected string details");
        };
        assert!(details.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(details.ends_with("(truncated, 2000 total bytes)"));
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(ApiError::from_status(404, "").status(), Some(404));
        assert_eq!(ApiError::Timeout.status(), None);
        assert!(ApiError::from_status(401, "").is_unauthorized());
        assert!(!ApiError::from_status(403, "").is_unauthorized());
    }
}
