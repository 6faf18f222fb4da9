//! Bearer-token session with deduplicated refresh.
//!
//! `AuthSession` is the single source of truth for credentials. Any number
//! of spaces and transports share one session; every token read funnels
//! through [`AuthSession::token`], which refreshes at most once at a time
//! and lets concurrent callers resolve from the same refresh.
//!
//! Refresh failures split two ways. A transport failure keeps the stored
//! credentials (the cached token is still served until it hard-expires). An
//! explicit rejection of the refresh token is terminal: credentials are
//! cleared and a logged-out event is raised. Nothing else ever invalidates
//! the session.

use crate::config::AuthConfig;
use crate::error::{ClientError, ClientResult};
use crate::provider::CredentialProvider;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::now_millis;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Stored token material. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Bearer access token.
    pub access_token: String,
    /// Refresh token, when the provider issues one.
    pub refresh_token: Option<String>,
    /// Unix milliseconds at which the access token expires; 0 means the
    /// token never expires.
    pub expires_at: u64,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// True if the access token is within `buffer` of its expiry.
    #[must_use]
    pub fn expires_within(&self, buffer: Duration) -> bool {
        self.expires_at != 0 && now_millis() + buffer.as_millis() as u64 >= self.expires_at
    }

    /// True if the access token is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && now_millis() >= self.expires_at
    }
}

// Token material stays out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// Credentials were set or refreshed.
    Refreshed,
    /// The session was invalidated and credentials cleared.
    LoggedOut,
}

struct AuthState {
    creds: Option<Credentials>,
    refreshing: bool,
    /// Bumped each time a refresh completes; pairs with `last_refresh`.
    epoch: u64,
    last_refresh: Option<(u64, Result<String, ClientError>)>,
}

/// Wakes the proactive refresh timer when the schedule changes.
#[derive(Default)]
struct TimerSignal {
    generation: Mutex<u64>,
    wake: Condvar,
}

impl TimerSignal {
    fn rearm(&self) {
        *self.generation.lock() += 1;
        self.wake.notify_all();
    }
}

/// Single source of truth for bearer credentials.
pub struct AuthSession {
    provider: Arc<dyn CredentialProvider>,
    config: AuthConfig,
    state: Mutex<AuthState>,
    refresh_done: Condvar,
    listeners: Mutex<Vec<mpsc::Sender<AuthEvent>>>,
    timer: Arc<TimerSignal>,
}

impl AuthSession {
    /// Creates a session around a provider. When proactive refresh is
    /// enabled a background timer keeps the token fresh ahead of expiry.
    pub fn new(provider: Arc<dyn CredentialProvider>, config: AuthConfig) -> Arc<Self> {
        let proactive = config.proactive_refresh;
        let buffer = config.refresh_buffer;
        let session = Arc::new(Self {
            provider,
            config,
            state: Mutex::new(AuthState {
                creds: None,
                refreshing: false,
                epoch: 0,
                last_refresh: None,
            }),
            refresh_done: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            timer: Arc::new(TimerSignal::default()),
        });
        if proactive {
            let weak = Arc::downgrade(&session);
            let signal = session.timer.clone();
            std::thread::spawn(move || refresh_timer_loop(weak, signal, buffer));
        }
        session
    }

    /// The credential provider this session wraps.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn CredentialProvider> {
        &self.provider
    }

    /// Installs credentials, e.g. after an interactive login.
    pub fn set_credentials(&self, creds: Credentials) {
        {
            let mut state = self.state.lock();
            state.creds = Some(creds);
        }
        self.timer.rearm();
        self.emit(AuthEvent::Refreshed);
    }

    /// Logs in through the provider and installs the returned credentials.
    pub fn login(&self) -> ClientResult<()> {
        let creds = self.provider.login()?;
        self.set_credentials(creds);
        Ok(())
    }

    /// True if credentials are present.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.lock().creds.is_some()
    }

    /// A clone of the stored credentials.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.state.lock().creds.clone()
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> mpsc::Receiver<AuthEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Re-arms the proactive refresh timer. Platforms call this when the
    /// app returns to the foreground, since suspended timers may have
    /// slept through their deadline.
    pub fn notify_foreground(&self) {
        tracing::debug!("foreground notification, re-arming refresh timer");
        self.timer.rearm();
    }

    /// Returns a valid access token, refreshing first when the stored one
    /// is within the configured buffer of expiry.
    ///
    /// Concurrent calls during a refresh share that refresh's outcome; at
    /// most one refresh request is ever in flight.
    pub fn token(&self) -> ClientResult<String> {
        let mut state = self.state.lock();
        loop {
            let Some(creds) = state.creds.as_ref() else {
                return Err(ClientError::NotAuthenticated);
            };
            if !creds.expires_within(self.config.refresh_buffer) {
                return Ok(creds.access_token.clone());
            }

            if state.refreshing {
                let awaited = state.epoch;
                while state.refreshing && state.epoch == awaited {
                    self.refresh_done.wait(&mut state);
                }
                match &state.last_refresh {
                    Some((epoch, outcome)) if *epoch > awaited => return outcome.clone(),
                    _ => continue,
                }
            }

            // Leader: run the refresh without holding the lock.
            let refresh_token = creds.refresh_token.clone();
            state.refreshing = true;
            drop(state);

            tracing::debug!("refreshing access token");
            let outcome = match refresh_token {
                Some(rt) => self.provider.refresh(&rt),
                // Without a refresh token a stale session cannot recover.
                None => Err(ClientError::CredentialsRejected(
                    "no refresh token".into(),
                )),
            };

            state = self.state.lock();
            state.refreshing = false;
            state.epoch += 1;
            let mut event = None;
            let result: Result<String, ClientError> = match outcome {
                Ok(new_creds) => {
                    let token = new_creds.access_token.clone();
                    state.creds = Some(new_creds);
                    event = Some(AuthEvent::Refreshed);
                    Ok(token)
                }
                Err(e) if e.is_rejection() => {
                    state.creds = None;
                    event = Some(AuthEvent::LoggedOut);
                    tracing::warn!(error = %e, "refresh token rejected, logging out");
                    Err(e)
                }
                Err(e) => {
                    // Transient: keep serving the cached token until it
                    // hard-expires.
                    match state.creds.as_ref() {
                        Some(c) if !c.is_expired() => {
                            tracing::warn!(error = %e, "refresh failed, serving cached token");
                            Ok(c.access_token.clone())
                        }
                        _ => Err(e),
                    }
                }
            };
            state.last_refresh = Some((state.epoch, result.clone()));
            self.refresh_done.notify_all();
            drop(state);

            self.timer.rearm();
            if let Some(ev) = event {
                self.emit(ev);
            }
            return result;
        }
    }

    /// Clears credentials and notifies the provider (best effort).
    pub fn logout(&self) {
        let creds = { self.state.lock().creds.take() };
        if let Some(creds) = creds {
            if let Err(e) = self.provider.logout(&creds.access_token) {
                tracing::warn!(error = %e, "provider logout failed");
            }
        }
        self.timer.rearm();
        self.emit(AuthEvent::LoggedOut);
    }

    fn emit(&self, event: AuthEvent) {
        self.listeners.lock().retain(|tx| tx.send(event).is_ok());
    }

    /// Milliseconds until the proactive refresh is due. `None` when
    /// nothing is scheduled (no credentials, or a non-expiring token).
    fn next_refresh_delay(&self) -> Option<Duration> {
        let state = self.state.lock();
        let creds = state.creds.as_ref()?;
        if creds.expires_at == 0 {
            return None;
        }
        let due_at = creds
            .expires_at
            .saturating_sub(self.config.refresh_buffer.as_millis() as u64);
        Some(Duration::from_millis(due_at.saturating_sub(now_millis())))
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        // Wake the timer so it can observe the session is gone.
        self.timer.rearm();
    }
}

fn refresh_timer_loop(weak: Weak<AuthSession>, signal: Arc<TimerSignal>, buffer: Duration) {
    let mut seen = *signal.generation.lock();
    loop {
        let wait = {
            let Some(session) = weak.upgrade() else { return };
            session.next_refresh_delay()
        };
        match wait {
            Some(delay) if delay.is_zero() => {
                let Some(session) = weak.upgrade() else { return };
                if let Err(e) = session.token() {
                    tracing::debug!(error = %e, "proactive refresh failed");
                    drop(session);
                    // Leave a gap before the next attempt.
                    park(&signal, &mut seen, Some(buffer.max(Duration::from_secs(1))));
                }
            }
            Some(delay) => park(&signal, &mut seen, Some(delay)),
            None => park(&signal, &mut seen, None),
        }
    }
}

/// Blocks until the signal is re-armed or `timeout` elapses.
fn park(signal: &TimerSignal, seen: &mut u64, timeout: Option<Duration>) {
    let mut generation = signal.generation.lock();
    if *generation != *seen {
        *seen = *generation;
        return;
    }
    match timeout {
        Some(t) => {
            let _ = signal.wake.wait_for(&mut generation, t);
        }
        None => signal.wake.wait(&mut generation),
    }
    *seen = *generation;
}
