//! Sessionward core - client-side session management for token-authenticated APIs.
//!
//! The crate covers the whole life of a login session:
//! - `api`: a request dispatcher that attaches the bearer token, enforces
//!   deadlines, retries transient failures and shares one token refresh
//!   between every request that needs it
//! - `auth`: the persisted session, login/logout, and the broadcast that
//!   tells the application authentication was lost
//! - `activity`: inactivity detection with a warning countdown
//! - `config`: file and environment configuration

pub mod activity;
pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod test_support;

pub use activity::{ActivitySignal, InactivityConfig, InactivityMonitor, MonitorCallbacks, MonitorState};
pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, ReqwestTransport, Transport};
pub use auth::{
    AuthFailureBroadcaster, AuthLost, LoginOutcome, Session, SessionController, SessionStore,
    UserIdentity,
};
pub use config::ClientConfig;
