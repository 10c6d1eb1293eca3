//! Request dispatcher.
//!
//! `ApiClient::execute` runs one logical request: attach the bearer token,
//! enforce the deadline, classify the response, rescue a stale token through
//! the refresh coordinator at most once, and optionally wrap all of that in
//! the retry policy.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::refresh::RefreshCoordinator;
use super::request::{ApiRequest, ApiResponse};
use super::retry::RetryPolicy;
use super::transport::{HttpRequest, HttpResponse, Transport};
use super::{ApiError, ErrorBody};
use crate::auth::{token, AuthFailureBroadcaster, SessionStore};
use crate::config::ClientConfig;

/// Token refreshes a single logical request may trigger.
const MAX_AUTH_REPLAYS: u32 = 1;

pub struct ApiClient<T> {
    transport: Arc<T>,
    store: Arc<SessionStore>,
    refresh: RefreshCoordinator<T>,
    retry: RetryPolicy,
    base_url: String,
    default_timeout: Duration,
}

impl<T> Clone for ApiClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            store: Arc::clone(&self.store),
            refresh: self.refresh.clone(),
            retry: self.retry,
            base_url: self.base_url.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

impl<T: Transport> ApiClient<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<SessionStore>,
        broadcaster: AuthFailureBroadcaster,
        config: &ClientConfig,
    ) -> Self {
        let default_timeout = config.request_timeout();
        let refresh = RefreshCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            broadcaster,
            config.url(&config.refresh_path),
            default_timeout,
        );
        Self {
            transport,
            store,
            refresh,
            retry: config.retry,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_timeout,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator<T> {
        &self.refresh
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Execute `request`, retrying transient failures if it asked for retries.
    /// The last error is returned unchanged once attempts run out.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        // One refresh per logical request, however many attempts it takes
        let mut replays_left = if request.refreshable() { MAX_AUTH_REPLAYS } else { 0 };
        let mut attempt = 0;
        loop {
            match self.execute_once(request, &mut replays_left).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < request.max_retries && self.retry.is_retryable(&e) => {
                    let delay = self.retry.next_delay(attempt);
                    attempt += 1;
                    warn!(
                        path = %request.path,
                        attempt,
                        max_retries = request.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt under the request deadline, including any wait on a refresh.
    async fn execute_once(&self, request: &ApiRequest, replays_left: &mut u32) -> Result<ApiResponse, ApiError> {
        let deadline = request.timeout.unwrap_or(self.default_timeout);
        // Dropping the attempt on deadline aborts the transport call or the
        // refresh wait; the refresh itself runs on in its own task
        match tokio::time::timeout(deadline, self.attempt(request, replays_left)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(path = %request.path, deadline_ms = deadline.as_millis() as u64, "Request timed out");
                Err(ApiError::Timeout)
            }
        }
    }

    async fn attempt(&self, request: &ApiRequest, replays_left: &mut u32) -> Result<ApiResponse, ApiError> {
        let refreshable = request.refreshable();
        let mut bearer = if request.requires_auth {
            self.store.load().map(|session| session.access_token)
        } else {
            None
        };

        // A token we already know is expired would only earn a 401
        if refreshable && *replays_left > 0 && bearer.as_deref().is_some_and(token::is_expired) {
            debug!(path = %request.path, "Access token expired, refreshing before send");
            *replays_left -= 1;
            match self.refresh.acquire().await {
                Ok(fresh) => bearer = Some(fresh),
                Err(e) => {
                    return Err(ApiError::AuthExpired {
                        body: ErrorBody::parse(401, ""),
                        cause: Some(e.to_string()),
                    })
                }
            }
        }

        loop {
            let response = self.send(request, bearer.clone()).await?;

            if response.status == 401 && refreshable {
                let body = ErrorBody::parse(response.status, &response.body);
                if *replays_left == 0 {
                    // The server refused the token it just issued: the session is gone
                    warn!(path = %request.path, "Rejected again after refresh, ending session");
                    self.store.clear();
                    self.refresh.broadcaster().signal();
                    return Err(ApiError::AuthExpired { body, cause: None });
                }
                *replays_left -= 1;
                debug!(path = %request.path, "Unauthorized, waiting on token refresh");
                match self.refresh.acquire().await {
                    Ok(fresh) => {
                        bearer = Some(fresh);
                        continue;
                    }
                    Err(e) => {
                        return Err(ApiError::AuthExpired {
                            body,
                            cause: Some(e.to_string()),
                        })
                    }
                }
            }

            return Self::classify(response);
        }
    }

    async fn send(&self, request: &ApiRequest, bearer: Option<String>) -> Result<HttpResponse, ApiError> {
        let http = HttpRequest {
            method: request.method,
            url: self.url(&request.path),
            bearer,
            body: request.body.clone(),
        };
        self.transport.send(http).await.map_err(ApiError::from)
    }

    fn classify(response: HttpResponse) -> Result<ApiResponse, ApiError> {
        if (200..300).contains(&response.status) {
            Ok(ApiResponse {
                status: response.status,
                body: response.body,
            })
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    // ===== Typed helpers =====

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ApiError> {
        self.execute(&ApiRequest::get(path)).await?.json()
    }

    pub async fn post<R: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<R, ApiError> {
        let request = ApiRequest::post(path).json(body)?;
        self.execute(&request).await?.json()
    }
}
