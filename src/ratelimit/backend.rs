//! Store trait for abstracting in-memory and shared implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::identity::Identity;
use super::policy::RateLimitPolicy;
use crate::error::Result;

/// Trait for rate limit state stores.
///
/// This trait abstracts over the process-local [`InMemoryStore`] and the
/// shared [`RedisStore`] so the limiter can work with either. Every
/// operation receives the policy and the current time from the caller; a
/// store never reads the clock itself.
///
/// [`InMemoryStore`]: super::InMemoryStore
/// [`RedisStore`]: super::RedisStore
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Whether either namespace of `identity` is currently blocked.
    ///
    /// A positive answer counts once towards `blocked_requests_total`.
    async fn is_blocked(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<bool>;

    /// Record a failed login for every namespace of `identity`.
    async fn register_failure(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()>;

    /// Clear failures, penalty and block for every namespace of `identity`.
    async fn register_success(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()>;

    /// Collect the observability counters.
    async fn metrics_snapshot(&self, policy: &RateLimitPolicy, now: f64)
        -> Result<MetricsSnapshot>;

    /// Drop all state and counters.
    async fn reset(&self) -> Result<()>;
}

/// Point-in-time view of the limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub failed_attempts_total: u64,
    pub failed_attempts_ip_total: u64,
    pub failed_attempts_user_total: u64,
    pub blocked_requests_total: u64,
    pub rate_limit_triggered_total: u64,
    pub ip_states_size: usize,
    pub user_states_size: usize,
    pub metrics_ip_size: usize,
    pub metrics_user_size: usize,
    pub metrics_dropped_total: u64,
    /// Failures per IP for the entries still retained
    pub retained_failed_by_ip: BTreeMap<String, u64>,
    /// Failures per username for the entries still retained
    pub retained_failed_by_user: BTreeMap<String, u64>,
}
