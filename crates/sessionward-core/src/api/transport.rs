//! HTTP transport boundary.
//!
//! The dispatcher only needs "send this, give me a status and a body, or tell
//! me the network failed". [`ReqwestTransport`] is the production
//! implementation; its cookie jar carries the refresh credential the server
//! sets at login, which this crate never reads or writes itself.

use std::future::Future;
use std::time::Duration;

use reqwest::{header, multipart, Client};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::ApiError;

/// Connect timeout for the underlying client. Request deadlines are enforced
/// per call by the dispatcher.
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File {
        filename: String,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormPart {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Bearer token to present, if any
    pub bearer: Option<String>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(msg) => ApiError::Network(msg),
            TransportError::Timeout => ApiError::Timeout,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Issues a single HTTP exchange. Dropping the returned future aborts it.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// reqwest-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client, e.g. one with a custom cookie jar.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn multipart_form(parts: Vec<FormPart>) -> Result<multipart::Form, TransportError> {
        let mut form = multipart::Form::new();
        for part in parts {
            form = match part.value {
                FormValue::Text(text) => form.text(part.name, text),
                FormValue::File {
                    filename,
                    content_type,
                    bytes,
                } => {
                    let mut file = multipart::Part::bytes(bytes).file_name(filename);
                    if let Some(mime) = content_type {
                        file = file.mime_str(&mime)?;
                    }
                    form.part(part.name, file)
                }
            };
        }
        Ok(form)
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url)
            .header(header::ACCEPT, "application/json");

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Multipart(parts) => builder.multipart(Self::multipart_form(parts)?),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(method = ?request.method, url = %request.url, status, "HTTP exchange complete");
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_maps_to_api_error() {
        assert_eq!(ApiError::from(TransportError::Timeout), ApiError::Timeout);
        assert_eq!(
            ApiError::from(TransportError::Network("dns".to_string())),
            ApiError::Network("dns".to_string())
        );
    }

    #[test]
    fn test_multipart_form_accepts_text_and_files() {
        let form = ReqwestTransport::multipart_form(vec![
            FormPart {
                name: "title".to_string(),
                value: FormValue::Text("entry".to_string()),
            },
            FormPart {
                name: "attachment".to_string(),
                value: FormValue::File {
                    filename: "notes.txt".to_string(),
                    content_type: Some("text/plain".to_string()),
                    bytes: b"hello".to_vec(),
                },
            },
        ]);
        assert!(form.is_ok());
    }

    #[test]
    fn test_multipart_form_rejects_bad_mime() {
        let form = ReqwestTransport::multipart_form(vec![FormPart {
            name: "attachment".to_string(),
            value: FormValue::File {
                filename: "x".to_string(),
                content_type: Some("not a mime type".to_string()),
                bytes: Vec::new(),
            },
        }]);
        assert!(matches!(form, Err(TransportError::Network(_))));
    }
}
