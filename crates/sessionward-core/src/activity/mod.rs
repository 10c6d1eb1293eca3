//! User inactivity tracking.
//!
//! The `InactivityMonitor` watches interaction signals and ends the session
//! after a configured quiet period, warning shortly beforehand. It is
//! independent of request dispatch: the only things it shares with the rest
//! of the crate are the session store (activity timestamp) and the auth
//! failure broadcaster.

pub mod monitor;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use monitor::{InactivityMonitor, MonitorCallbacks, MonitorState};

/// Inactivity timeout in seconds (15 minutes)
const INACTIVITY_TIMEOUT_SECS: u64 = 900;

/// Warning shown this many seconds before the timeout
const WARNING_LEAD_SECS: u64 = 30;

/// At most one accepted signal per this many milliseconds
const THROTTLE_MS: u64 = 1000;

/// Longest timeout honored; larger settings are treated as this (30 days)
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InactivityConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub warning_lead_secs: u64,
    pub throttle_ms: u64,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: INACTIVITY_TIMEOUT_SECS,
            warning_lead_secs: WARNING_LEAD_SECS,
            throttle_ms: THROTTLE_MS,
        }
    }
}

impl InactivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.min(MAX_TIMEOUT_SECS))
    }

    /// Warning lead, never longer than the timeout itself
    pub fn warning_lead(&self) -> Duration {
        Duration::from_secs(self.warning_lead_secs).min(self.timeout())
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

/// Interaction kinds that count as the user being present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySignal {
    KeyPress,
    PointerDown,
    PointerMove,
    Scroll,
    Touch,
    Focus,
}

impl ActivitySignal {
    pub const ALL: [ActivitySignal; 6] = [
        ActivitySignal::KeyPress,
        ActivitySignal::PointerDown,
        ActivitySignal::PointerMove,
        ActivitySignal::Scroll,
        ActivitySignal::Touch,
        ActivitySignal::Focus,
    ];
}
