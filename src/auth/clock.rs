// Session clock
//
// Owns the live session and the single scheduled action (silent refresh or
// forced logout) that fires `refresh_margin` seconds before the access token
// expires. The one-second countdown is display only and never drives a
// decision.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::codec;
use super::coordinator::{RefreshCoordinator, RefreshObserver};
use super::credentials::CredentialStore;
use super::types::{SessionPolicy, SessionSnapshot};
use crate::error::{Result, SessionError};
use crate::log_sink::LogSink;

/// Epoch seconds derived from a monotonic instant, so wall-clock jumps do not
/// move expiry arithmetic around.
#[derive(Debug, Clone, Copy)]
pub struct Timebase {
    anchor_epoch: i64,
    anchor: Instant,
}

impl Timebase {
    /// Anchored at the current wall-clock time
    pub fn system() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp())
    }

    /// Anchored at an arbitrary epoch second
    pub fn starting_at(epoch: i64) -> Self {
        Self {
            anchor_epoch: epoch,
            anchor: Instant::now(),
        }
    }

    /// Current time in epoch seconds
    pub fn now(&self) -> i64 {
        self.anchor_epoch + self.anchor.elapsed().as_secs() as i64
    }
}

/// What the pending timer will do when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Refresh,
    ForceLogout,
}

/// The one pending timer, as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledAction {
    pub kind: ActionKind,
    /// Fire time in epoch seconds
    pub fire_at: i64,
}

/// Authenticated identity and timing. `subject` is `None` exactly when no
/// valid access token is held.
#[derive(Debug, Clone, Default)]
struct Session {
    subject: Option<String>,
    seconds_remaining: u64,
}

struct PendingTimer {
    action: ScheduledAction,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ClockState {
    session: Session,
    timer: Option<PendingTimer>,
    /// Incremented on every cancel; a fired timer only acts if its
    /// generation is still current
    generation: u64,
}

impl ClockState {
    fn reset(&mut self) {
        self.cancel_timer();
        self.session = Session::default();
    }

    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            tracing::debug!(kind = ?timer.action.kind, "Cancelled scheduled action");
        }
    }
}

pub struct SessionClock {
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    policy: SessionPolicy,
    timebase: Timebase,
    sink: Arc<dyn LogSink>,
    state: Mutex<ClockState>,
    this: Weak<SessionClock>,
}

impl SessionClock {
    /// Create the clock and register it for renewal notifications
    pub fn new(
        store: Arc<dyn CredentialStore>,
        coordinator: RefreshCoordinator,
        policy: SessionPolicy,
        timebase: Timebase,
        sink: Arc<dyn LogSink>,
    ) -> Arc<Self> {
        let clock = Arc::new_cyclic(|this| SessionClock {
            store,
            coordinator: coordinator.clone(),
            policy,
            timebase,
            sink,
            state: Mutex::new(ClockState::default()),
            this: this.clone(),
        });

        let observer: Weak<dyn RefreshObserver> = Arc::downgrade(&clock) as Weak<dyn RefreshObserver>;
        coordinator.set_observer(observer);
        clock
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the stored tokens and rebuild the session from them.
    ///
    /// An undecodable access token clears the store, ends the session and is
    /// returned as `MalformedToken`. The clock lock is held from the store
    /// read to the reschedule, so a concurrent logout either sees the new
    /// session or leaves an empty store behind for this read.
    pub fn sync(&self) -> Result<()> {
        tracing::debug!("Syncing session from credential store");
        let mut state = self.state();

        let tokens = match self.store.get() {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read credential store");
                state.reset();
                return Err(e);
            }
        };

        let Some(access_token) = tokens.access_token else {
            state.reset();
            return Ok(());
        };

        let claims = match codec::decode(&access_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode access token");
                self.sink.error(&e, "Failed to decode access token");
                if let Err(clear_err) = self.store.clear() {
                    tracing::warn!(error = %clear_err, "Failed to clear credential store");
                }
                state.reset();
                return Err(e);
            }
        };

        // `exp` comes off the wire and may sit anywhere in i64
        let remaining = claims.exp.saturating_sub(self.timebase.now()).max(0) as u64;
        tracing::info!(subject = %claims.sub, seconds_remaining = remaining, "Session synced");
        self.sink
            .info(&format!("expiresIn after refresh: {}", remaining));

        state.session = Session {
            subject: Some(claims.sub),
            seconds_remaining: remaining,
        };
        self.reschedule_locked(&mut state, remaining);
        Ok(())
    }

    /// Replace the scheduled action based on `remaining` seconds of lifetime
    pub fn reschedule(&self, remaining: u64) {
        let mut state = self.state();
        self.reschedule_locked(&mut state, remaining);
    }

    fn reschedule_locked(&self, state: &mut ClockState, remaining: u64) {
        state.cancel_timer();

        let margin = self.policy.refresh_margin;
        if remaining <= margin {
            tracing::info!(
                seconds_remaining = remaining,
                refresh_margin = margin,
                "Not scheduling refresh/logout: too close to expiry"
            );
            self.sink.info(&format!(
                "Not scheduling silent refresh/logout: expiresIn <= {}",
                margin
            ));
            return;
        }

        let delay = remaining - margin;
        let kind = if self.policy.auto_renewal {
            tracing::info!(delay_secs = delay, "Scheduling silent refresh");
            self.sink
                .info(&format!("Scheduling silent refresh in {} seconds", delay));
            ActionKind::Refresh
        } else {
            tracing::info!(delay_secs = delay, "Scheduling logout (auto refresh off)");
            self.sink.info(&format!(
                "Scheduling logout in {} seconds (auto refresh OFF)",
                delay
            ));
            ActionKind::ForceLogout
        };

        let generation = state.generation;
        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if let Some(clock) = this.upgrade() {
                clock.fire(generation).await;
            }
        });

        state.timer = Some(PendingTimer {
            action: ScheduledAction {
                kind,
                fire_at: self
                    .timebase
                    .now()
                    .saturating_add(i64::try_from(delay).unwrap_or(i64::MAX)),
            },
            generation,
            handle,
        });
    }

    async fn fire(&self, generation: u64) {
        let kind = {
            let mut state = self.state();
            match state.timer.take() {
                Some(timer) if timer.generation == generation => timer.action.kind,
                other => {
                    // Superseded between wake-up and lock; leave the new one alone
                    state.timer = other;
                    tracing::debug!(generation, "Ignoring stale timer");
                    return;
                }
            }
        };

        match kind {
            ActionKind::Refresh => {
                tracing::info!("Silent refresh timer fired");
                // Both outcomes reach the session through the observer hook.
                // A renewal outlived by a logout settles without touching it.
                if let Err(e) = self.coordinator.refresh().await {
                    tracing::warn!(error = %e, "Silent refresh failed");
                }
            }
            ActionKind::ForceLogout => {
                tracing::info!("Session lifetime reached, forcing logout");
                self.logout();
            }
        }
    }

    /// End the session: cancel the timer, clear the store, forget the subject.
    /// Safe to call when already logged out.
    pub fn logout(&self) {
        self.coordinator.invalidate();
        let mut state = self.state();
        state.reset();
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "Failed to clear credential store");
        }
        tracing::info!("Logged out");
    }

    /// One-second display countdown; clamps at zero
    pub fn tick(&self) {
        let mut state = self.state();
        state.session.seconds_remaining = state.session.seconds_remaining.saturating_sub(1);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            subject: state.session.subject.clone(),
            seconds_remaining: state.session.seconds_remaining,
            is_authenticated: state.session.subject.is_some(),
        }
    }

    /// The pending action, if any
    pub fn scheduled(&self) -> Option<ScheduledAction> {
        self.state().timer.as_ref().map(|t| t.action)
    }

    /// Drive [`tick`](Self::tick) once per second until the handle is dropped
    pub fn start_countdown(&self) -> Countdown {
        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match this.upgrade() {
                    Some(clock) => clock.tick(),
                    None => break,
                }
            }
        });
        Countdown { handle }
    }
}

impl RefreshObserver for SessionClock {
    fn refreshed(&self) -> Result<()> {
        self.sync().map_err(|e| {
            tracing::warn!(error = %e, "Renewed token could not be synced");
            e
        })
    }

    fn refresh_failed(&self, error: &SessionError) {
        tracing::warn!(error = %error, "Renewal failed, forcing logout");
        self.logout();
    }
}

impl Drop for SessionClock {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
    }
}

/// Running display countdown; stops when dropped
pub struct Countdown {
    handle: JoinHandle<()>,
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Render seconds as `MM:SS`
pub fn format_remaining(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
