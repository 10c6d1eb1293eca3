use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval};
use tracing::{debug, info, warn};

use super::{ActivitySignal, InactivityConfig};
use crate::auth::{AuthFailureBroadcaster, SessionStore};

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

const FAR_FUTURE_SECS: u64 = 86400 * 365 * 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Not armed: logged out, disabled, or disarmed
    Inactive,
    Active,
    /// Expiry is near; `remaining_secs` counts down once per second
    Warning { remaining_secs: u64 },
    Expired,
}

type WarningCallback = dyn Fn(u64) + Send + Sync;
type TimeoutCallback = dyn Fn() + Send + Sync;

/// Caller hooks. Both run on the monitor's task and should return quickly.
#[derive(Clone)]
pub struct MonitorCallbacks {
    on_warning: Arc<WarningCallback>,
    on_timeout: Arc<TimeoutCallback>,
}

impl Default for MonitorCallbacks {
    fn default() -> Self {
        Self {
            on_warning: Arc::new(|_| {}),
            on_timeout: Arc::new(|| {}),
        }
    }
}

impl MonitorCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per warning with the seconds left before expiry.
    pub fn on_warning<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_warning = Arc::new(f);
        self
    }

    pub fn on_timeout<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_timeout = Arc::new(f);
        self
    }
}

enum Command {
    Activity(DateTime<Utc>),
    Continue(DateTime<Utc>),
}

struct Shared {
    store: Arc<SessionStore>,
    broadcaster: AuthFailureBroadcaster,
    callbacks: MonitorCallbacks,
    state: watch::Sender<MonitorState>,
    /// Bumped on every arm/disarm; a timer task only acts while it owns the current value
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
    }

    /// Activity recorded by another process after `than`, if any
    fn newer_activity(&self, than: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.store.last_activity().filter(|stored| *stored > than)
    }
}

struct Armed {
    config: InactivityConfig,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    last_accepted: Option<Instant>,
}

pub struct InactivityMonitor {
    shared: Arc<Shared>,
    armed: Mutex<Option<Armed>>,
}

impl InactivityMonitor {
    pub fn new(
        store: Arc<SessionStore>,
        broadcaster: AuthFailureBroadcaster,
        callbacks: MonitorCallbacks,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Inactive);
        Self {
            shared: Arc::new(Shared {
                store,
                broadcaster,
                callbacks,
                state,
                generation: AtomicU64::new(0),
            }),
            armed: Mutex::new(None),
        }
    }

    fn lock_armed(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.borrow()
    }

    /// Watch state changes, including each countdown step.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.shared.state.subscribe()
    }

    pub fn is_armed(&self) -> bool {
        self.lock_armed()
            .as_ref()
            .is_some_and(|armed| !armed.task.is_finished())
    }

    /// Start watching for inactivity. Requires `config.enabled` and a
    /// session in the store; returns whether the monitor is now armed.
    /// Arming again with the same configuration changes nothing.
    pub fn arm(&self, config: InactivityConfig) -> bool {
        if !config.enabled {
            debug!("Inactivity monitor disabled");
            self.disarm();
            return false;
        }
        if self.shared.store.load().is_none() {
            debug!("No session, inactivity monitor stays inactive");
            self.disarm();
            return false;
        }

        let mut armed = self.lock_armed();
        if let Some(current) = armed.as_ref() {
            if current.config == config && !current.task.is_finished() {
                return true;
            }
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = armed.take() {
            previous.task.abort();
        }

        let started = Utc::now();
        self.shared.store.record_activity_at(started);
        self.shared.set_state(MonitorState::Active);

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            Arc::clone(&self.shared),
            config,
            generation,
            started,
            receiver,
        ));
        *armed = Some(Armed {
            config,
            commands,
            task,
            last_accepted: None,
        });

        info!(
            timeout_secs = config.timeout_secs,
            warning_lead_secs = config.warning_lead_secs,
            "Inactivity monitor armed"
        );
        true
    }

    /// Stop watching. No callback fires after this returns.
    pub fn disarm(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = self.lock_armed().take() {
            previous.task.abort();
            debug!("Inactivity monitor disarmed");
        }
        if self.state() != MonitorState::Inactive {
            self.shared.set_state(MonitorState::Inactive);
        }
    }

    /// Report user interaction. Returns `false` when throttled or not armed.
    pub fn record_signal(&self, signal: ActivitySignal) -> bool {
        let mut armed = self.lock_armed();
        let Some(current) = armed.as_mut() else {
            return false;
        };
        if current.task.is_finished() {
            return false;
        }

        let now = Instant::now();
        if let Some(last) = current.last_accepted {
            if now.duration_since(last) < current.config.throttle() {
                return false;
            }
        }
        current.last_accepted = Some(now);

        let at = Utc::now();
        self.shared.store.record_activity_at(at);
        if current.commands.send(Command::Activity(at)).is_err() {
            return false;
        }
        debug!(?signal, "Activity accepted");
        true
    }

    /// "I'm still here" while the warning is showing. Returns `false` outside
    /// the warning state.
    pub fn continue_session(&self) -> bool {
        if !matches!(self.state(), MonitorState::Warning { .. }) {
            return false;
        }
        let armed = self.lock_armed();
        let Some(current) = armed.as_ref() else {
            return false;
        };

        let at = Utc::now();
        self.shared.store.record_activity_at(at);
        if current.commands.send(Command::Continue(at)).is_err() {
            return false;
        }
        self.shared.set_state(MonitorState::Active);
        true
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(armed) = self.lock_armed().take() {
            armed.task.abort();
        }
    }
}

fn whole_secs_until(deadline: Instant) -> u64 {
    let left = deadline.saturating_duration_since(Instant::now());
    left.as_millis().div_ceil(1000) as u64
}

async fn tick(countdown: &mut Option<(Interval, u64)>) {
    match countdown {
        Some((ticker, _)) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

/// `from + after`, or roughly thirty years out when that overflows.
fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .unwrap_or_else(|| from + Duration::from_secs(FAR_FUTURE_SECS))
}

async fn run(
    shared: Arc<Shared>,
    config: InactivityConfig,
    generation: u64,
    started: DateTime<Utc>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let timeout = config.timeout();
    let warn_after = timeout - config.warning_lead();
    let mut last_activity = Instant::now();
    let mut last_activity_at = started;
    let mut countdown: Option<(Interval, u64)> = None;

    loop {
        let warning_deadline = deadline_after(last_activity, warn_after);
        let expiry_deadline = deadline_after(last_activity, timeout);

        tokio::select! {
            biased;

            command = commands.recv() => {
                let Some(command) = command else { return };
                if !shared.is_current(generation) {
                    return;
                }
                let (at, continued) = match command {
                    Command::Activity(at) => (at, false),
                    Command::Continue(at) => (at, true),
                };
                last_activity = Instant::now();
                last_activity_at = at;
                if countdown.take().is_some() {
                    info!(continued, "Inactivity warning dismissed");
                }
                shared.set_state(MonitorState::Active);
            }

            _ = sleep_until(expiry_deadline) => {
                if let Some(stored) = shared.newer_activity(last_activity_at) {
                    // Another process saw the user more recently; restart from there
                    let idle_for = (Utc::now() - stored).to_std().unwrap_or_default();
                    last_activity = Instant::now()
                        .checked_sub(idle_for)
                        .unwrap_or_else(Instant::now);
                    last_activity_at = stored;
                    countdown = None;
                    if shared.is_current(generation) {
                        shared.set_state(MonitorState::Active);
                    }
                    debug!(idle_ms = idle_for.as_millis() as u64, "Newer activity found in store, deadline moved");
                    continue;
                }
                if !shared.is_current(generation) {
                    return;
                }
                warn!(timeout_secs = config.timeout_secs, "Inactivity timeout reached");
                shared.set_state(MonitorState::Expired);
                (shared.callbacks.on_timeout)();
                shared.broadcaster.signal();
                return;
            }

            _ = sleep_until(warning_deadline), if countdown.is_none() => {
                if !shared.is_current(generation) {
                    return;
                }
                let remaining = whole_secs_until(expiry_deadline);
                let ticker = interval_at(Instant::now() + COUNTDOWN_STEP, COUNTDOWN_STEP);
                countdown = Some((ticker, remaining));
                shared.set_state(MonitorState::Warning { remaining_secs: remaining });
                info!(remaining_secs = remaining, "Inactivity warning");
                (shared.callbacks.on_warning)(remaining);
            }

            _ = tick(&mut countdown) => {
                if let Some((_, remaining)) = countdown.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if shared.is_current(generation) {
                        shared.set_state(MonitorState::Warning { remaining_secs: *remaining });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::time::sleep;

    use crate::test_support::{fresh_token, memory_session_store, session_with};

    struct Harness {
        monitor: InactivityMonitor,
        store: Arc<SessionStore>,
        broadcaster: AuthFailureBroadcaster,
        warnings: Arc<Mutex<Vec<u64>>>,
        timeouts: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let store = memory_session_store();
        store.save(&session_with(&fresh_token("user")), true);
        let broadcaster = AuthFailureBroadcaster::new();
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let timeouts = Arc::new(AtomicUsize::new(0));

        let callbacks = MonitorCallbacks::new()
            .on_warning({
                let warnings = Arc::clone(&warnings);
                move |remaining| warnings.lock().unwrap().push(remaining)
            })
            .on_timeout({
                let timeouts = Arc::clone(&timeouts);
                move || {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                }
            });
        let monitor = InactivityMonitor::new(Arc::clone(&store), broadcaster.clone(), callbacks);
        Harness {
            monitor,
            store,
            broadcaster,
            warnings,
            timeouts,
        }
    }

    fn config() -> InactivityConfig {
        InactivityConfig {
            enabled: true,
            timeout_secs: 900,
            warning_lead_secs: 30,
            throttle_ms: 1000,
        }
    }

    /// Slightly past a deadline so the monitor's timer has run first
    fn just_after(secs: u64) -> Duration {
        Duration::from_secs(secs) + Duration::from_millis(10)
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_then_timeout() {
        let h = harness();
        let mut signals = h.broadcaster.subscribe();
        assert!(h.monitor.arm(config()));
        assert_eq!(h.monitor.state(), MonitorState::Active);

        sleep(just_after(870)).await;
        assert_eq!(*h.warnings.lock().unwrap(), vec![30]);
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);
        assert!(matches!(h.monitor.state(), MonitorState::Warning { .. }));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(h.monitor.state(), MonitorState::Expired);
        assert!(signals.try_recv().is_ok());

        sleep(Duration::from_secs(3600)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(h.warnings.lock().unwrap().len(), 1);
        assert!(!h.monitor.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_decrements_each_second() {
        let h = harness();
        h.monitor.arm(config());

        sleep(just_after(870)).await;
        assert_eq!(h.monitor.state(), MonitorState::Warning { remaining_secs: 30 });
        sleep(Duration::from_millis(5500)).await;
        assert_eq!(h.monitor.state(), MonitorState::Warning { remaining_secs: 25 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_pushes_deadlines_back() {
        let h = harness();
        h.monitor.arm(config());

        sleep(Duration::from_secs(600)).await;
        assert!(h.monitor.record_signal(ActivitySignal::KeyPress));
        sleep(Duration::from_secs(600)).await;

        assert_eq!(h.monitor.state(), MonitorState::Active);
        assert!(h.warnings.lock().unwrap().is_empty());
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(301)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_are_throttled() {
        let h = harness();
        h.monitor.arm(config());

        assert!(h.monitor.record_signal(ActivitySignal::PointerMove));
        assert!(!h.monitor.record_signal(ActivitySignal::PointerMove));
        assert!(!h.monitor.record_signal(ActivitySignal::KeyPress));

        sleep(Duration::from_millis(1000)).await;
        assert!(h.monitor.record_signal(ActivitySignal::Scroll));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_session_from_warning() {
        let h = harness();
        h.monitor.arm(config());
        assert!(!h.monitor.continue_session());

        sleep(Duration::from_secs(875)).await;
        assert!(matches!(h.monitor.state(), MonitorState::Warning { .. }));
        assert!(h.monitor.continue_session());
        assert_eq!(h.monitor.state(), MonitorState::Active);

        sleep(Duration::from_secs(800)).await;
        assert_eq!(h.monitor.state(), MonitorState::Active);
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(101)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(h.warnings.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_everything() {
        let h = harness();
        let mut signals = h.broadcaster.subscribe();
        h.monitor.arm(config());
        sleep(Duration::from_secs(100)).await;

        h.monitor.disarm();
        assert_eq!(h.monitor.state(), MonitorState::Inactive);
        sleep(Duration::from_secs(2000)).await;

        assert!(h.warnings.lock().unwrap().is_empty());
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);
        assert!(signals.try_recv().is_err());
        assert!(!h.monitor.record_signal(ActivitySignal::KeyPress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_with_same_config_is_noop() {
        let h = harness();
        assert!(h.monitor.arm(config()));
        sleep(Duration::from_secs(500)).await;
        assert!(h.monitor.arm(config()));

        // Deadline still counts from the first arm
        sleep(Duration::from_secs(401)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_with_new_config_restarts() {
        let h = harness();
        h.monitor.arm(config());
        sleep(Duration::from_secs(500)).await;

        let shorter = InactivityConfig {
            timeout_secs: 60,
            warning_lead_secs: 10,
            ..config()
        };
        assert!(h.monitor.arm(shorter));
        sleep(just_after(50)).await;
        assert_eq!(*h.warnings.lock().unwrap(), vec![10]);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_requires_session_and_enabled() {
        let h = harness();
        let disabled = InactivityConfig {
            enabled: false,
            ..config()
        };
        assert!(!h.monitor.arm(disabled));
        assert_eq!(h.monitor.state(), MonitorState::Inactive);

        h.store.clear();
        assert!(!h.monitor.arm(config()));
        assert_eq!(h.monitor.state(), MonitorState::Inactive);
        assert!(!h.monitor.record_signal(ActivitySignal::Focus));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_initializes_activity_timestamp() {
        let h = harness();
        assert_eq!(h.store.last_activity(), None);
        h.monitor.arm(config());
        assert!(h.store.last_activity().is_some());
        assert!(!h.store.is_session_timed_out(config().timeout()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_activity_from_other_process_defers_expiry() {
        let h = harness();
        h.monitor.arm(config());

        sleep(Duration::from_secs(899)).await;
        // Another process sharing the store saw the user
        h.store.record_activity_at(Utc::now() + chrono::Duration::seconds(1));
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(h.monitor.state(), MonitorState::Active);

        sleep(Duration::from_secs(900)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_transitions() {
        let h = harness();
        let mut states = h.monitor.subscribe();
        h.monitor.arm(config());
        assert_eq!(*states.borrow_and_update(), MonitorState::Active);

        sleep(just_after(870)).await;
        assert!(states.has_changed().unwrap());
        assert_eq!(
            *states.borrow_and_update(),
            MonitorState::Warning { remaining_secs: 30 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_is_capped() {
        let h = harness();
        let huge = InactivityConfig {
            timeout_secs: u64::MAX,
            ..config()
        };
        assert!(h.monitor.arm(huge));

        sleep(Duration::from_secs(86400)).await;
        assert!(h.monitor.is_armed());
        assert_eq!(h.monitor.state(), MonitorState::Active);

        sleep(just_after(crate::activity::MAX_TIMEOUT_SECS - 30 - 86400)).await;
        assert_eq!(h.monitor.state(), MonitorState::Warning { remaining_secs: 30 });
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(86400 * 365));
        assert_eq!(deadline_after(now, COUNTDOWN_STEP), now + COUNTDOWN_STEP);
    }
}
