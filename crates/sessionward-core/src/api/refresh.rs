//! Single-flight access token refresh.
//!
//! The first caller to need a new token moves the coordinator from `Idle` to
//! `Refreshing` and spawns the refresh call; everyone who arrives while it is
//! in flight queues behind it. When the call settles the queue is drained in
//! arrival order with the same outcome, and the state returns to `Idle`.
//!
//! The refresh runs in its own task so that a caller giving up (its request
//! deadline passing, its future being dropped) never cancels the refresh the
//! other waiters depend on.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::transport::{Body, HttpRequest, Method, Transport};
use super::ApiError;
use crate::auth::{AuthFailureBroadcaster, SessionStore};

type Waiter = oneshot::Sender<Result<String, ApiError>>;

enum RefreshState {
    Idle,
    Refreshing(Vec<Waiter>),
}

/// Observable phase, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing { waiters: usize },
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "token")]
    access_token: Option<String>,
}

struct Inner<T> {
    transport: Arc<T>,
    store: Arc<SessionStore>,
    broadcaster: AuthFailureBroadcaster,
    refresh_url: String,
    timeout: Duration,
    state: Mutex<RefreshState>,
}

pub struct RefreshCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RefreshCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> RefreshCoordinator<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<SessionStore>,
        broadcaster: AuthFailureBroadcaster,
        refresh_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                broadcaster,
                refresh_url: refresh_url.into(),
                timeout,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        match &*self.inner.lock_state() {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Refreshing(waiters) => RefreshPhase::Refreshing {
                waiters: waiters.len(),
            },
        }
    }

    pub fn broadcaster(&self) -> &AuthFailureBroadcaster {
        &self.inner.broadcaster
    }

    /// Wait for a fresh access token, starting a refresh if none is in flight.
    ///
    /// Fails with [`ApiError::RefreshFailed`] when the refresh does; in that
    /// case the session has already been cleared and the failure broadcast.
    pub async fn acquire(&self) -> Result<String, ApiError> {
        let (tx, rx) = oneshot::channel();
        let leader = {
            // Check and transition under one lock: no await in between
            let mut state = self.inner.lock_state();
            if let RefreshState::Refreshing(waiters) = &mut *state {
                waiters.push(tx);
                debug!(queued = waiters.len(), "Refresh in flight, queued behind it");
                false
            } else {
                *state = RefreshState::Refreshing(vec![tx]);
                true
            }
        };

        if leader {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_cycle().await });
        }

        rx.await
            .map_err(|_| ApiError::RefreshFailed("refresh was abandoned".to_string()))?
    }
}

impl<T: Transport> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        // Nothing panics while holding the lock; recover the data regardless
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_cycle(&self) {
        info!("Refreshing access token");
        let outcome = match AssertUnwindSafe(self.call_refresh()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiError::RefreshFailed("refresh task panicked".to_string())),
        };

        // Persist before anyone is woken so replays and new requests agree on the token
        let outcome = outcome.and_then(|token| {
            if self.store.update_token(&token) {
                Ok(token)
            } else {
                Err(ApiError::RefreshFailed(
                    "session ended while refreshing".to_string(),
                ))
            }
        });
        if outcome.is_err() {
            self.store.clear();
        }

        let waiters = match std::mem::replace(&mut *self.lock_state(), RefreshState::Idle) {
            RefreshState::Refreshing(waiters) => waiters,
            RefreshState::Idle => Vec::new(),
        };

        match &outcome {
            Ok(_) => info!(waiters = waiters.len(), "Access token refreshed"),
            Err(e) => {
                warn!(waiters = waiters.len(), error = %e, "Access token refresh failed");
                self.broadcaster.signal();
            }
        }

        for waiter in waiters {
            // A waiter whose request was dropped has nobody listening
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn call_refresh(&self) -> Result<String, ApiError> {
        let request = HttpRequest {
            method: Method::Post,
            url: self.refresh_url.clone(),
            bearer: None,
            body: Body::Empty,
        };

        let response = tokio::time::timeout(self.timeout, self.transport.send(request))
            .await
            .map_err(|_| ApiError::RefreshFailed("refresh timed out".to_string()))?
            .map_err(|e| ApiError::RefreshFailed(e.to_string()))?;

        if !(200..300).contains(&response.status) {
            let error = ApiError::from_status(response.status, &response.body);
            return Err(ApiError::RefreshFailed(error.to_string()));
        }

        let parsed: RefreshResponse = serde_json::from_str(&response.body)
            .map_err(|e| ApiError::RefreshFailed(format!("unreadable refresh response: {}", e)))?;
        match parsed.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ApiError::RefreshFailed(
                "refresh response carried no access token".to_string(),
            )),
        }
    }
}
