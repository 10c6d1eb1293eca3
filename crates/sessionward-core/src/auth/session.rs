use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::storage::{KvStore, StorageError};

/// Key holding the versioned session record
const SESSION_KEY: &str = "session";

/// Key holding the last-activity timestamp (milliseconds since epoch)
const ACTIVITY_KEY: &str = "last_activity";

/// Current layout of the persisted session record
const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserIdentity {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl UserIdentity {
    /// Name to show the user: display name, falling back to username
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Session {
    pub identity: UserIdentity,
    pub access_token: String,
    pub absolute_expiry: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.absolute_expiry
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.absolute_expiry - Utc::now()
    }

    /// `Authorization` header value for this session
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    fn is_well_formed(&self) -> bool {
        !self.access_token.is_empty() && !self.identity.username.is_empty()
    }
}

/// Which namespace holds the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Survives restarts ("remember me")
    Persistent,
    /// Lives as long as the process
    Ephemeral,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    session: Session,
}

/// Durable home of the credential bundle and the activity timestamp.
///
/// Backing-store failures never escape: they are logged and the operation
/// degrades to a no-op, which at worst means "logged out on restart".
pub struct SessionStore {
    persistent: Box<dyn KvStore>,
    ephemeral: Box<dyn KvStore>,
}

impl SessionStore {
    pub fn new(persistent: impl KvStore + 'static, ephemeral: impl KvStore + 'static) -> Self {
        Self {
            persistent: Box::new(persistent),
            ephemeral: Box::new(ephemeral),
        }
    }

    fn backend(&self, retention: Retention) -> &dyn KvStore {
        match retention {
            Retention::Persistent => self.persistent.as_ref(),
            Retention::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    fn other(retention: Retention) -> Retention {
        match retention {
            Retention::Persistent => Retention::Ephemeral,
            Retention::Ephemeral => Retention::Persistent,
        }
    }

    fn quietly<T: Default>(op: &str, result: Result<T, StorageError>) -> T {
        result.unwrap_or_else(|e| {
            warn!(op = op, error = %e, "Session storage failed");
            T::default()
        })
    }

    /// Write `session` to exactly one namespace and drop any copy in the other.
    pub fn save(&self, session: &Session, persistent: bool) {
        let retention = if persistent {
            Retention::Persistent
        } else {
            Retention::Ephemeral
        };
        self.save_with_retention(session, retention);
    }

    fn save_with_retention(&self, session: &Session, retention: Retention) {
        let record = SessionRecord {
            version: RECORD_VERSION,
            session: session.clone(),
        };
        let contents = match serde_json::to_string(&record) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "Failed to serialize session");
                return;
            }
        };
        Self::quietly("save", self.backend(retention).set(SESSION_KEY, &contents));
        Self::quietly(
            "save",
            self.backend(Self::other(retention)).remove(SESSION_KEY),
        );
        debug!(user = %session.identity.username, ?retention, "Session saved");
    }

    /// Current session, or `None`. Expired or unreadable records are removed.
    pub fn load(&self) -> Option<Session> {
        self.load_with_retention().map(|(session, _)| session)
    }

    pub fn load_with_retention(&self) -> Option<(Session, Retention)> {
        for retention in [Retention::Persistent, Retention::Ephemeral] {
            let backend = self.backend(retention);
            let Some(contents) = Self::quietly("load", backend.get(SESSION_KEY)) else {
                continue;
            };

            let session = match serde_json::from_str::<SessionRecord>(&contents) {
                Ok(record) if record.version == RECORD_VERSION && record.session.is_well_formed() => {
                    record.session
                }
                Ok(record) => {
                    warn!(version = record.version, ?retention, "Discarding unsupported session record");
                    Self::quietly("load", backend.remove(SESSION_KEY));
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, ?retention, "Discarding unreadable session record");
                    Self::quietly("load", backend.remove(SESSION_KEY));
                    continue;
                }
            };

            if session.is_expired() {
                debug!(expired_at = %session.absolute_expiry, "Session past absolute expiry, clearing");
                self.clear();
                return None;
            }
            return Some((session, retention));
        }
        None
    }

    pub fn retention(&self) -> Option<Retention> {
        self.load_with_retention().map(|(_, retention)| retention)
    }

    /// Swap in a new access token, keeping identity, expiry and retention.
    /// Returns `false` when there is no session to update.
    pub fn update_token(&self, access_token: &str) -> bool {
        match self.load_with_retention() {
            Some((mut session, retention)) => {
                session.access_token = access_token.to_string();
                self.save_with_retention(&session, retention);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        for retention in [Retention::Persistent, Retention::Ephemeral] {
            Self::quietly("clear", self.backend(retention).remove(SESSION_KEY));
        }
        debug!("Session cleared");
    }

    /// Stamp "now" as the last user activity, in both namespaces.
    pub fn record_activity(&self) {
        self.record_activity_at(Utc::now());
    }

    pub fn record_activity_at(&self, at: DateTime<Utc>) {
        let millis = at.timestamp_millis().to_string();
        for retention in [Retention::Persistent, Retention::Ephemeral] {
            Self::quietly("record_activity", self.backend(retention).set(ACTIVITY_KEY, &millis));
        }
    }

    /// Most recent activity stamp found in either namespace.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        [Retention::Persistent, Retention::Ephemeral]
            .into_iter()
            .filter_map(|retention| {
                Self::quietly("last_activity", self.backend(retention).get(ACTIVITY_KEY))
            })
            .filter_map(|raw| raw.trim().parse::<i64>().ok())
            .filter_map(|millis| Utc.timestamp_millis_opt(millis).single())
            .max()
    }

    pub fn clear_activity(&self) {
        for retention in [Retention::Persistent, Retention::Ephemeral] {
            Self::quietly("clear_activity", self.backend(retention).remove(ACTIVITY_KEY));
        }
    }

    /// No recorded activity counts as timed out.
    pub fn is_session_timed_out(&self, timeout: std::time::Duration) -> bool {
        let Some(last) = self.last_activity() else {
            return true;
        };
        let timeout = Duration::from_std(timeout).unwrap_or(Duration::MAX);
        Utc::now() - last > timeout
    }
}
