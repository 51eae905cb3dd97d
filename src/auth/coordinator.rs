// Single-flight token renewal
//
// However many callers ask for a refresh while one is running, exactly one
// renewal call reaches the backend. Everyone else waits on a result slot and
// receives the same outcome, in arrival order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;

use super::credentials::CredentialStore;
use super::refresh::AuthBackend;
use crate::error::{Result, SessionError};
use crate::log_sink::LogSink;

/// Told about every settled renewal (the session clock listens here)
pub trait RefreshObserver: Send + Sync {
    /// New tokens are in the store. An error means the session could not
    /// adopt them; waiters are then rejected instead of handed the token.
    fn refreshed(&self) -> Result<()>;

    /// Renewal failed; the store has already been cleared
    fn refresh_failed(&self, error: &SessionError);
}

type Waiter = oneshot::Sender<Result<String>>;

#[derive(Default)]
struct CoordinatorState {
    in_flight: bool,
    waiters: Vec<Waiter>,
    /// Bumped by `invalidate`; a renewal started under an older epoch must
    /// not write its tokens back
    epoch: u64,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    sink: Arc<dyn LogSink>,
    state: Mutex<CoordinatorState>,
    observer: Mutex<Option<Weak<dyn RefreshObserver>>>,
}

/// Cheap, cloneable handle to the process-wide refresh coordinator
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                sink,
                state: Mutex::new(CoordinatorState::default()),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Register the component to notify when a renewal settles
    pub fn set_observer(&self, observer: Weak<dyn RefreshObserver>) {
        *self
            .inner
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Obtain a new access token, joining the in-flight renewal if there is one
    pub async fn refresh(&self) -> Result<String> {
        self.join_or_start(None).await
    }

    /// Like [`refresh`](Self::refresh), for a caller whose request was rejected
    /// while carrying `seen`. If the store already holds a different access
    /// token (a renewal settled in the meantime), that token is returned and
    /// no renewal is started.
    pub async fn refresh_stale(&self, seen: Option<&str>) -> Result<String> {
        self.join_or_start(Some(seen)).await
    }

    /// Whether a renewal is currently running
    pub fn is_refreshing(&self) -> bool {
        self.state().in_flight
    }

    /// Discard the result of any renewal still in flight (called on logout)
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.epoch += 1;
    }

    /// Callers blocked on the running renewal
    pub fn pending_waiters(&self) -> usize {
        self.state().waiters.len()
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn join_or_start(&self, seen: Option<Option<&str>>) -> Result<String> {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state();
            if state.in_flight {
                tracing::debug!(
                    waiters = state.waiters.len() + 1,
                    "Renewal in progress, queueing caller"
                );
                state.waiters.push(tx);
            } else {
                // Nothing running: the store reflects every settled renewal
                if let Some(seen) = seen {
                    if let Some(current) = self.inner.store.get()?.access_token {
                        if Some(current.as_str()) != seen {
                            tracing::debug!("Token already renewed, skipping refresh");
                            return Ok(current);
                        }
                    }
                }
                state.in_flight = true;
                state.waiters.push(tx);
                self.spawn_renewal(state.epoch);
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(SessionError::RefreshFailed(
                "renewal task ended without a result".to_string(),
            ))
        })
    }

    /// Runs on its own task so a cancelled caller can not strand the
    /// in-flight flag
    fn spawn_renewal(&self, epoch: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.renew(epoch).await;
            this.settle(outcome, epoch);
        });
    }

    async fn renew(&self, epoch: u64) -> Result<String> {
        let refresh_token = self
            .inner
            .store
            .get()?
            .refresh_token
            .ok_or(SessionError::MissingRefreshToken)?;

        let pair = self.inner.backend.renew(&refresh_token).await?;

        {
            let state = self.state();
            if state.epoch != epoch {
                return Err(SessionError::RefreshFailed(
                    "session ended while renewal was in flight".to_string(),
                ));
            }
            self.inner
                .store
                .set(&pair.access_token, &pair.refresh_token)?;
        }

        tracing::info!("Access token renewed");
        Ok(pair.access_token)
    }

    fn settle(&self, outcome: Result<String>, epoch: u64) {
        let outcome = outcome.map_err(|e| match e {
            SessionError::MissingRefreshToken | SessionError::RefreshFailed(_) => e,
            other => SessionError::RefreshFailed(other.to_string()),
        });

        // After a logout the store and session belong to whoever comes next
        let superseded = self.state().epoch != epoch;
        if superseded {
            tracing::debug!("Renewal settled after logout, result discarded");
        }

        if let (Err(e), false) = (&outcome, superseded) {
            tracing::error!(error = %e, "Failed to refresh token, clearing credentials");
            if let Err(clear_err) = self.inner.store.clear() {
                tracing::warn!(error = %clear_err, "Failed to clear credential store");
            }
            self.inner.sink.error(e, "Failed to refresh token");
        }

        let waiters = {
            let mut state = self.state();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        // Observer first so the session is re-synced before anyone retries
        let outcome = match self.observer().filter(|_| !superseded) {
            Some(observer) => match outcome {
                Ok(token) => match observer.refreshed() {
                    Ok(()) => Ok(token),
                    Err(e) => Err(SessionError::RefreshFailed(format!(
                        "renewed token rejected: {}",
                        e
                    ))),
                },
                Err(e) => {
                    observer.refresh_failed(&e);
                    Err(e)
                }
            },
            None => outcome,
        };

        tracing::debug!(waiters = waiters.len(), "Releasing refresh waiters");
        for waiter in waiters {
            // A dropped receiver only means that caller gave up
            let _ = waiter.send(outcome.clone());
        }
    }

    fn observer(&self) -> Option<Arc<dyn RefreshObserver>> {
        self.inner
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}
