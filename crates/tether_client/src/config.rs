//! Configuration for the client SDK.

use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Identity attached to local writes.
    pub identity: ClientIdentity,
    /// Reconnect backoff for event streams.
    pub backoff: BackoffConfig,
    /// Auth session behavior.
    pub auth: AuthConfig,
}

impl ClientConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local identity.
    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the auth configuration.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

/// Who the local caller is, for audit stamps on optimistic writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// User id, when known.
    pub user_id: Option<String>,
    /// Display name, when known.
    pub user_name: Option<String>,
    /// Role granted to this caller on the spaces it opens, when known.
    pub role: Option<String>,
}

impl ClientIdentity {
    /// Creates an identity.
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            user_name: Some(user_name.into()),
            role: None,
        }
    }

    /// An anonymous identity.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Sets the caller's role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Reconnect backoff policy for event streams.
///
/// Deliberately jitter-free: the delay sequence (1000, 2000, 4000, ...,
/// capped) is part of the observable reconnect contract and is asserted
/// by tests.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Creates the standard policy: 1 s initial, doubling, capped at 30 s.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-indexed; attempt 0 is the
    /// initial try and has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Auth session behavior.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// How long before expiry a token counts as stale and is refreshed.
    pub refresh_buffer: Duration,
    /// Whether a background timer refreshes tokens ahead of expiry.
    pub proactive_refresh: bool,
}

impl AuthConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(60),
            proactive_refresh: true,
        }
    }

    /// Sets the refresh buffer.
    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Enables or disables the proactive refresh timer.
    pub fn with_proactive_refresh(mut self, enabled: bool) -> Self {
        self.proactive_refresh = enabled;
        self
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}
