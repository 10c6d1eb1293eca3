use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::transport::{Body, FormPart, Method};
use super::ApiError;

/// Whether a 401 on this request may be rescued by a token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary API call
    Standard,
    /// Login, 2FA or registration: a 401 means bad credentials, not a stale token
    Credential,
}

/// One logical request, as the caller describes it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Body,
    pub requires_auth: bool,
    pub kind: RequestKind,
    /// Per-attempt deadline; the client default applies when `None`
    pub timeout: Option<Duration>,
    /// Extra attempts for transient failures; 0 executes once
    pub max_retries: u32,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: Body::Empty,
            requires_auth: true,
            kind: RequestKind::Standard,
            timeout: None,
            max_retries: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to serialize body: {}", e)))?;
        self.body = Body::Json(value);
        Ok(self)
    }

    pub fn json_value(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = Body::Multipart(parts);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    /// Mark as a login/registration call: sent without a bearer token and
    /// never answered with a refresh.
    pub fn credential(mut self) -> Self {
        self.kind = RequestKind::Credential;
        self.requires_auth = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn refreshable(&self) -> bool {
        self.requires_auth && self.kind == RequestKind::Standard
    }
}

/// Successful response. A 204 or empty body is an empty result.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_empty(&self) -> bool {
        self.status == 204 || self.body.trim().is_empty()
    }

    /// Parsed JSON body, `None` for empty results.
    pub fn value(&self) -> Result<Option<Value>, ApiError> {
        if self.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.body)
            .map(Some)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        // Deserializing from null lets `()` and `Option<T>` accept empty results
        let body = if self.is_empty() { "null" } else { self.body.as_str() };
        serde_json::from_str(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_credential_requests_skip_auth_and_refresh() {
        let request = ApiRequest::post("/auth/login").credential();
        assert!(!request.requires_auth);
        assert!(!request.refreshable());

        let anonymous = ApiRequest::get("/health").without_auth();
        assert!(!anonymous.refreshable());

        assert!(ApiRequest::get("/journal").refreshable());
    }

    #[test]
    fn test_no_content_is_empty_result() {
        let response = ApiResponse {
            status: 204,
            body: String::new(),
        };
        assert!(response.is_empty());
        assert_eq!(response.value().unwrap(), None);
        response.json::<()>().unwrap();
        let maybe: Option<Vec<u32>> = response.json().unwrap();
        assert_eq!(maybe, None);
    }

    #[test]
    fn test_json_body_decodes() {
        #[derive(Deserialize)]
        struct Entry {
            id: u32,
        }
        let response = ApiResponse {
            status: 200,
            body: r#"{"id": 7}"#.to_string(),
        };
        assert_eq!(response.json::<Entry>().unwrap().id, 7);
    }

    #[test]
    fn test_invalid_json_is_invalid_response() {
        let response = ApiResponse {
            status: 200,
            body: "<html>".to_string(),
        };
        assert!(matches!(response.value(), Err(ApiError::InvalidResponse(_))));
    }
}
