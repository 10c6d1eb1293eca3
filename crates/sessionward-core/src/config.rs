//! Client configuration management.
//!
//! Configuration is stored at `~/.config/sessionward/config.json`. Every
//! field has a default, so a missing file (or a file naming only some fields)
//! is fine. A few environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::activity::{InactivityConfig, MAX_TIMEOUT_SECS};
use crate::api::RetryPolicy;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Absolute session lifetime stamped at login (30 days)
const SESSION_MAX_AGE_HOURS: i64 = 30 * 24;

/// Longest absolute session lifetime honored (one year)
pub const MAX_SESSION_MAX_AGE_HOURS: i64 = 365 * 24;

pub const ENV_BASE_URL: &str = "SESSIONWARD_BASE_URL";
pub const ENV_INACTIVITY_SECS: &str = "SESSIONWARD_INACTIVITY_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub login_path: String,
    pub login_2fa_path: String,
    pub register_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub inactivity: InactivityConfig,
    pub session_max_age_hours: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/v1".to_string(),
            login_path: "/auth/login".to_string(),
            login_2fa_path: "/auth/login/2fa".to_string(),
            register_path: "/auth/register".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
            inactivity: InactivityConfig::default(),
            session_max_age_hours: SESSION_MAX_AGE_HOURS,
        }
    }
}

impl ClientConfig {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let mut config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.clamp_limits();
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(raw) = lookup(ENV_INACTIVITY_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.inactivity.timeout_secs = secs,
                _ => warn!(value = %raw, "Ignoring invalid {}", ENV_INACTIVITY_SECS),
            }
        }
        self.clamp_limits();
    }

    /// Pull durations into the range the timers and clock arithmetic accept.
    fn clamp_limits(&mut self) {
        if self.inactivity.timeout_secs > MAX_TIMEOUT_SECS {
            warn!(
                timeout_secs = self.inactivity.timeout_secs,
                max = MAX_TIMEOUT_SECS,
                "Inactivity timeout too large, clamping"
            );
            self.inactivity.timeout_secs = MAX_TIMEOUT_SECS;
        }
        let hours = self.session_max_age_hours;
        if !(1..=MAX_SESSION_MAX_AGE_HOURS).contains(&hours) {
            warn!(
                session_max_age_hours = hours,
                max = MAX_SESSION_MAX_AGE_HOURS,
                "Session max age out of range, clamping"
            );
            self.session_max_age_hours = hours.clamp(1, MAX_SESSION_MAX_AGE_HOURS);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Absolute URL for an endpoint path.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_max_age_hours.clamp(1, MAX_SESSION_MAX_AGE_HOURS))
    }
}
