//! Process-wide "authentication lost" signal.

use tokio::sync::broadcast;
use tracing::debug;

/// Buffered signals per subscriber before the slowest one starts lagging
const CHANNEL_CAPACITY: usize = 16;

/// The signal itself carries nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthLost;

/// Fire-and-forget broadcaster. Clones share the same channel.
#[derive(Clone)]
pub struct AuthFailureBroadcaster {
    sender: broadcast::Sender<AuthLost>,
}

impl Default for AuthFailureBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthFailureBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Notify every current listener. Having no listeners is fine.
    pub fn signal(&self) {
        match self.sender.send(AuthLost) {
            Ok(listeners) => debug!(listeners, "Auth failure broadcast"),
            Err(_) => debug!("Auth failure broadcast with no listeners"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthLost> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_listener_receives_signal() {
        let broadcaster = AuthFailureBroadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.clone().subscribe();
        assert_eq!(broadcaster.listener_count(), 2);

        broadcaster.signal();
        assert_eq!(a.recv().await.unwrap(), AuthLost);
        assert_eq!(b.recv().await.unwrap(), AuthLost);
    }

    #[test]
    fn test_signal_without_listeners_is_harmless() {
        let broadcaster = AuthFailureBroadcaster::new();
        broadcaster.signal();
        broadcaster.signal();
    }

    #[tokio::test]
    async fn test_rapid_signals_are_all_delivered() {
        let broadcaster = AuthFailureBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.signal();
        broadcaster.signal();
        assert_eq!(rx.recv().await.unwrap(), AuthLost);
        assert_eq!(rx.recv().await.unwrap(), AuthLost);
        assert!(rx.try_recv().is_err());
    }
}
