//! Shared fixtures for unit tests: a scripted transport and session helpers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::api::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::auth::{MemoryStore, Session, SessionStore, UserIdentity};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure, recording every request it sees.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    delays: Vec<(String, Duration)>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delays: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delay responses to URLs ending in `suffix`.
    pub(crate) fn with_delay(mut self, suffix: &str, delay: Duration) -> Self {
        self.delays.push((suffix.to_string(), delay));
        self
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .count()
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = self
            .delays
            .iter()
            .find(|(suffix, _)| request.url.ends_with(suffix.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }
}

pub(crate) fn respond(status: u16, body: Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status,
        body: body.to_string(),
    })
}

pub(crate) fn respond_empty(status: u16) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status,
        body: String::new(),
    })
}

pub(crate) fn unauthorized() -> Result<HttpResponse, TransportError> {
    respond(
        401,
        json!({ "detail": { "code": "AUTH_INVALID_TOKEN", "message": "Token expired" } }),
    )
}

/// Token with an `exp` one hour out, tagged so tests can tell tokens apart.
pub(crate) fn fresh_token(tag: &str) -> String {
    let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
    crate::auth::token::encode_test_token(&json!({ "sub": tag, "exp": exp }))
}

pub(crate) fn identity() -> UserIdentity {
    UserIdentity {
        id: 1,
        username: "alice".to_string(),
        email: None,
        display_name: None,
    }
}

pub(crate) fn session_with(token: &str) -> Session {
    Session {
        identity: identity(),
        access_token: token.to_string(),
        absolute_expiry: Utc::now() + chrono::Duration::days(30),
    }
}

pub(crate) fn memory_session_store() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(MemoryStore::new(), MemoryStore::new()))
}
