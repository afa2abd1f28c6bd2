//! Login rate limiter facade used by the authentication layer.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use super::backend::{MetricsSnapshot, RateLimitStore};
use super::factory::{create_store, StoreBackend};
use super::identity::Identity;
use super::policy::{PolicyOverrides, RateLimitPolicy};
use crate::config::GatekeeperConfig;
use crate::error::Result;

/// What `is_blocked` answers when the store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFailurePolicy {
    /// Reject the attempt
    #[default]
    FailClosed,
    /// Let the attempt through unchecked
    FailOpen,
}

impl BackendFailurePolicy {
    fn treat_as_blocked(&self) -> bool {
        matches!(self, BackendFailurePolicy::FailClosed)
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The login rate limiter.
///
/// Construct one at service startup and share it (typically in an `Arc`)
/// with every request handler. The expected call sequence per login is
/// [`is_blocked`](Self::is_blocked), then credential verification, then
/// [`register_success`](Self::register_success) or
/// [`register_failure`](Self::register_failure).
pub struct RateLimiter<S: RateLimitStore = StoreBackend> {
    /// Installed policy, replaced only by `reset`
    policy: RwLock<Arc<RateLimitPolicy>>,
    /// Held shared by every store call and exclusively by `reset`
    generation: tokio::sync::RwLock<()>,
    store: S,
    on_backend_error: BackendFailurePolicy,
}

impl RateLimiter<StoreBackend> {
    /// Build a limiter from deployment configuration.
    ///
    /// The store is selected by [`create_store`], which falls back to memory
    /// when Redis is unusable.
    pub async fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        config.validate()?;
        let store = create_store(&config.store).await;
        info!(
            backend = store.name(),
            max_attempts = config.policy.max_attempts,
            window_seconds = config.policy.window_seconds,
            on_backend_error = ?config.store.on_backend_error,
            "Rate limiter initialized"
        );
        Ok(Self::new(config.policy.clone(), store)?
            .with_failure_policy(config.store.on_backend_error))
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }
}

impl<S: RateLimitStore> RateLimiter<S> {
    /// Create a new rate limiter over the given store.
    pub fn new(policy: RateLimitPolicy, store: S) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy: RwLock::new(Arc::new(policy)),
            generation: tokio::sync::RwLock::new(()),
            store,
            on_backend_error: BackendFailurePolicy::default(),
        })
    }

    /// Set the behavior of `is_blocked` on backend errors.
    pub fn with_failure_policy(mut self, on_backend_error: BackendFailurePolicy) -> Self {
        self.on_backend_error = on_backend_error;
        self
    }

    /// The policy currently in force.
    pub fn policy(&self) -> Arc<RateLimitPolicy> {
        self.policy.read().clone()
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether the attempt must be rejected before checking credentials.
    ///
    /// Rejects when either the IP or the username is blocked. Backend
    /// errors are logged and answered according to the configured
    /// [`BackendFailurePolicy`].
    pub async fn is_blocked(&self, ip: &str, username: Option<&str>, now: f64) -> bool {
        let identity = Identity::new(ip, username);
        let _generation = self.generation.read().await;
        let policy = self.policy();

        trace!(identity = %identity, "Checking login rate limit");

        match self.store.is_blocked(identity, &policy, now).await {
            Ok(blocked) => {
                if blocked {
                    debug!(identity = %identity, "Login attempt rejected by rate limit");
                }
                blocked
            }
            Err(e) => {
                error!(
                    error = %e,
                    identity = %identity,
                    on_backend_error = ?self.on_backend_error,
                    "Rate limit backend check failed"
                );
                self.on_backend_error.treat_as_blocked()
            }
        }
    }

    /// Record a failed login for the IP and, when present, the username.
    pub async fn register_failure(&self, ip: &str, username: Option<&str>, now: f64) -> Result<()> {
        let identity = Identity::new(ip, username);
        let _generation = self.generation.read().await;
        let policy = self.policy();
        self.store.register_failure(identity, &policy, now).await
    }

    /// Record a successful login, clearing failures and penalties.
    pub async fn register_success(&self, ip: &str, username: Option<&str>, now: f64) -> Result<()> {
        let identity = Identity::new(ip, username);
        let _generation = self.generation.read().await;
        let policy = self.policy();
        self.store.register_success(identity, &policy, now).await
    }

    /// Collect the observability counters.
    pub async fn metrics_snapshot(&self, now: f64) -> Result<MetricsSnapshot> {
        let _generation = self.generation.read().await;
        let policy = self.policy();
        self.store.metrics_snapshot(&policy, now).await
    }

    /// Clear all state and install a policy with `overrides` applied.
    ///
    /// The new policy is validated before anything is cleared. Calls that
    /// arrive while the store is being cleared wait and then run under the
    /// new policy.
    pub async fn reset(&self, overrides: PolicyOverrides) -> Result<()> {
        let _generation = self.generation.write().await;
        let policy = self.policy().with_overrides(&overrides);
        policy.validate()?;

        self.store.reset().await?;
        *self.policy.write() = Arc::new(policy);

        info!(overrides = ?overrides, "Rate limiter reset");
        Ok(())
    }
}
