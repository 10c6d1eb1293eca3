//! Authentication state.
//!
//! This module provides:
//! - `SessionStore`: the persisted session record and activity timestamp
//! - `SessionController`: login, two-factor, logout and restore
//! - `AuthFailureBroadcaster`: one-to-many "authentication lost" signal
//! - `token`: reads the expiry claim out of an access token
//! - Key/value backends (memory, file, OS keychain, encrypted wrapper)

pub mod broadcast;
pub mod controller;
pub mod sealed;
pub mod session;
pub mod storage;
pub mod token;

pub use broadcast::{AuthFailureBroadcaster, AuthLost};
pub use controller::{registration, LoginOutcome, LoginWarning, SessionController};
pub use sealed::SealedStore;
pub use session::{Retention, Session, SessionStore, UserIdentity};
pub use storage::{FileStore, KeyringStore, KvStore, MemoryStore, StorageError};
