//! Login, logout and session lifecycle.
//!
//! `SessionController` owns the calls that create or end a session and is
//! the listener that reacts to the auth failure broadcast.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AuthFailureBroadcaster, Session, SessionStore, UserIdentity};
use crate::activity::{InactivityMonitor, MonitorState};
use crate::api::{ApiClient, ApiError, ApiRequest, ApiResponse, RequestKind, Transport};
use crate::config::ClientConfig;

/// Status the server uses to ask for a second factor
const TWO_FACTOR_STATUS: u16 = 202;

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// Call `verify_two_factor` with this token and the code the user received
    TwoFactorRequired { pre_auth_token: String },
}

/// Advisory notice attached to a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginWarning {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    id: i64,
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    warnings: Vec<LoginWarning>,
}

#[derive(Debug, Deserialize)]
struct TwoFactorChallenge {
    pre_auth_token: String,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct TwoFactorBody<'a> {
    pre_auth_token: &'a str,
    code: &'a str,
}

pub struct SessionController<T> {
    client: ApiClient<T>,
    store: Arc<SessionStore>,
    broadcaster: AuthFailureBroadcaster,
    config: ClientConfig,
    monitor: Option<Arc<InactivityMonitor>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<SessionStore>,
        broadcaster: AuthFailureBroadcaster,
        config: ClientConfig,
    ) -> Self {
        let client = ApiClient::new(transport, Arc::clone(&store), broadcaster.clone(), &config);
        Self {
            client,
            store,
            broadcaster,
            config,
            monitor: None,
            listener: Mutex::new(None),
        }
    }

    /// Arm `monitor` whenever a session starts and disarm it when one ends.
    pub fn with_monitor(mut self, monitor: Arc<InactivityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn client(&self) -> &ApiClient<T> {
        &self.client
    }

    pub fn monitor(&self) -> Option<&Arc<InactivityMonitor>> {
        self.monitor.as_ref()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.store.load()
    }

    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        remember: bool,
    ) -> Result<LoginOutcome, ApiError> {
        let request = ApiRequest::post(self.config.login_path.as_str())
            .credential()
            .json(&LoginBody {
                identifier,
                password,
            })?;
        let response = self.client.execute(&request).await?;

        if response.status == TWO_FACTOR_STATUS {
            let challenge: TwoFactorChallenge = response.json()?;
            info!("Second factor required");
            return Ok(LoginOutcome::TwoFactorRequired {
                pre_auth_token: challenge.pre_auth_token,
            });
        }

        self.establish(&response, remember).map(LoginOutcome::Authenticated)
    }

    pub async fn verify_two_factor(
        &self,
        pre_auth_token: &str,
        code: &str,
        remember: bool,
    ) -> Result<Session, ApiError> {
        let request = ApiRequest::post(self.config.login_2fa_path.as_str())
            .credential()
            .json(&TwoFactorBody {
                pre_auth_token,
                code: code.trim(),
            })?;
        let response = self.client.execute(&request).await?;
        self.establish(&response, remember)
    }

    /// Create an account. Registration does not log in; the server's reply
    /// (usually a message) is returned as-is.
    pub async fn register<B: Serialize>(&self, body: &B) -> Result<Option<Value>, ApiError> {
        let request = ApiRequest::post(self.config.register_path.as_str())
            .credential()
            .json(body)?;
        let response = self.client.execute(&request).await?;
        info!("Registration submitted");
        response.value()
    }

    fn establish(&self, response: &ApiResponse, remember: bool) -> Result<Session, ApiError> {
        let token: TokenResponse = response.json()?;
        if token.access_token.is_empty() {
            return Err(ApiError::InvalidResponse(
                "Login response carried an empty access token".to_string(),
            ));
        }

        for notice in &token.warnings {
            warn!(code = %notice.code, "{}", notice.message);
        }

        let session = Session {
            identity: UserIdentity {
                id: token.id,
                username: token.username,
                email: token.email,
                display_name: None,
            },
            access_token: token.access_token,
            absolute_expiry: Utc::now() + self.config.session_max_age(),
        };
        self.store.save(&session, remember);
        self.store.record_activity();

        if let Some(monitor) = &self.monitor {
            monitor.arm(self.config.inactivity);
        }
        info!(user = %session.identity.username, remember, "Logged in");
        Ok(session)
    }

    /// End the session. The server is told when there is a session to end,
    /// but local state is cleared whatever it answers. Safe to call repeatedly.
    pub async fn logout(&self) {
        if self.store.load().is_some() {
            let mut request = ApiRequest::post(self.config.logout_path.as_str());
            // A rejected token at logout is not worth a refresh
            request.kind = RequestKind::Credential;
            if let Err(e) = self.client.execute(&request).await {
                debug!(error = %e, "Server logout failed, clearing local session anyway");
            }
            info!("Logged out");
        }
        end_session(&self.store, self.monitor.as_deref());
    }

    /// Pick up a session left by an earlier run. A session whose recorded
    /// activity is older than `inactivity_timeout`, or that has no activity
    /// record at all, is discarded.
    pub fn restore(&self, inactivity_timeout: Duration) -> Option<Session> {
        let Some(session) = self.store.load() else {
            self.store.clear_activity();
            return None;
        };

        if self.store.is_session_timed_out(inactivity_timeout) {
            info!(user = %session.identity.username, "Stored session timed out while away");
            end_session(&self.store, self.monitor.as_deref());
            return None;
        }

        if let Some(monitor) = &self.monitor {
            monitor.arm(self.config.inactivity);
        }
        debug!(user = %session.identity.username, "Session restored");
        Some(session)
    }

    /// Start reacting to the auth failure broadcast: each signal clears the
    /// stored session and activity. Calling this again while the listener is
    /// running does nothing.
    pub fn listen(&self) {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut signals = self.broadcaster.subscribe();
        let store = Arc::clone(&self.store);
        let monitor = self.monitor.clone();
        *listener = Some(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let has_session = store.load().is_some();
                        if !has_session && store.last_activity().is_none() {
                            debug!("Auth failure signal while logged out, ignoring");
                            continue;
                        }
                        warn!("Authentication lost, ending session");
                        // A failed refresh has already removed the session itself
                        if has_session {
                            store.clear();
                        }
                        store.clear_activity();
                        if let Some(monitor) = &monitor {
                            // Leave an expired monitor showing its final state
                            if monitor.state() != MonitorState::Expired {
                                monitor.disarm();
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

fn end_session(store: &SessionStore, monitor: Option<&InactivityMonitor>) {
    store.clear();
    store.clear_activity();
    if let Some(monitor) = monitor {
        monitor.disarm();
    }
}

impl<T> Drop for SessionController<T> {
    fn drop(&mut self) {
        if let Some(task) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Registration body for the common username/password case.
pub fn registration(username: &str, password: &str) -> Value {
    json!({ "username": username, "password": password })
}
