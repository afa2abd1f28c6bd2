//! Shared store backed by Redis.
//!
//! Lets several service instances enforce the same blocks.
//!
//! # Layout
//!
//! - `{ns}:state:{kind}:{key}` → JSON [`AttemptState`], `SETEX state_ttl_seconds`
//! - `{ns}:states_seen:{kind}` (ZSET) → state key → last seen
//! - `{ns}:metrics:{kind}` (HASH) → key → retained failure count
//! - `{ns}:metrics_seen:{kind}` (ZSET) → key → last failure
//! - `{ns}:counters` (HASH) → global counters
//!
//! Record expiry is left to Redis; the sorted sets approximate recency for
//! cardinality bounding.
//!
//! # Consistency
//!
//! A state record is read, updated and written back without a distributed
//! lock. Two instances failing the same identity at the same moment can
//! both write, so the penalty level may lag by one step. Any block written
//! is honored by every instance that reads the record afterwards.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{try_join, try_join_all};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use tracing::{debug, info, trace, warn};

use super::backend::{MetricsSnapshot, RateLimitStore};
use super::identity::{Identity, KeyKind};
use super::policy::RateLimitPolicy;
use super::state::AttemptState;
use crate::error::{GatekeeperError, Result};

/// Default key prefix for all records written by the store.
pub const DEFAULT_NAMESPACE: &str = "gatekeeper:rate_limit";

/// Keys scanned per SCAN round trip.
const SCAN_BATCH: usize = 256;

/// Keys deleted per DEL round trip on reset.
const DELETE_BATCH: usize = 512;

/// Redis key naming for one store namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key space under the given prefix.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Record key for one identity.
    pub fn state(&self, kind: KeyKind, key: &str) -> String {
        format!("{}:state:{}:{}", self.namespace, kind, key)
    }

    /// Pattern matching every state record of a namespace.
    pub fn state_pattern(&self, kind: KeyKind) -> String {
        format!("{}:state:{}:*", self.namespace, kind)
    }

    /// Recency set for state records.
    pub fn states_seen(&self, kind: KeyKind) -> String {
        format!("{}:states_seen:{}", self.namespace, kind)
    }

    /// Hash of retained failure counts.
    pub fn metrics(&self, kind: KeyKind) -> String {
        format!("{}:metrics:{}", self.namespace, kind)
    }

    /// Recency set for metric entries.
    pub fn metrics_seen(&self, kind: KeyKind) -> String {
        format!("{}:metrics_seen:{}", self.namespace, kind)
    }

    /// Hash of global counters.
    pub fn counters(&self) -> String {
        format!("{}:counters", self.namespace)
    }

    /// Pattern matching everything this store owns.
    pub fn all(&self) -> String {
        format!("{}:*", self.namespace)
    }
}

/// Redis-backed rate limit store.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use gatekeeper::ratelimit::{RedisStore, DEFAULT_NAMESPACE};
///
/// # async fn example() -> gatekeeper::error::Result<()> {
/// let store = RedisStore::connect(
///     "redis://127.0.0.1:6379",
///     DEFAULT_NAMESPACE,
///     Duration::from_secs(2),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    keys: KeySpace,
    /// Upper bound for every round trip.
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`GatekeeperError::BackendUnavailable`] if the URL is invalid
    /// or the connection cannot be established within `timeout`.
    pub async fn connect(redis_url: &str, namespace: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            GatekeeperError::BackendUnavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                GatekeeperError::BackendUnavailable(format!(
                    "Timed out connecting to Redis after {timeout:?}"
                ))
            })?
            .map_err(|e| {
                GatekeeperError::BackendUnavailable(format!(
                    "Failed to create Redis connection manager: {e}"
                ))
            })?;

        info!(namespace = %namespace, "Connected Redis rate limit store");

        Ok(Self {
            conn_manager,
            keys: KeySpace::new(namespace),
            timeout,
        })
    }

    /// The key naming used by this store.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Run one round trip under the store timeout.
    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GatekeeperError::BackendUnavailable(format!(
                "Redis {op} failed: {e}"
            ))),
            Err(_) => Err(GatekeeperError::BackendUnavailable(format!(
                "Redis {op} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Load a state record with its window purged. `None` if absent or expired.
    async fn load_state(
        &self,
        kind: KeyKind,
        key: &str,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<Option<AttemptState>> {
        let mut conn = self.conn_manager.clone();
        let state_key = self.keys.state(kind, key);
        let payload: Option<String> = self.guarded("GET", conn.get(&state_key)).await?;

        let Some(raw) = payload else {
            return Ok(None);
        };
        let mut state: AttemptState = serde_json::from_str(&raw)?;
        state.purge(now, policy.window_seconds);
        Ok(Some(state))
    }

    /// Write a state record and refresh its recency entry.
    ///
    /// The record outlives an active block even when the block is longer
    /// than `state_ttl_seconds`. Returns the size of the recency set after
    /// expired entries are dropped.
    async fn save_state(
        &self,
        kind: KeyKind,
        key: &str,
        state: &AttemptState,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<usize> {
        let mut conn = self.conn_manager.clone();
        let state_key = self.keys.state(kind, key);
        let seen_key = self.keys.states_seen(kind);
        let payload = serde_json::to_string(state)?;
        let remaining_block = (state.blocked_until - now).ceil().max(0.0) as u64;
        let ttl = policy.state_ttl_seconds.max(remaining_block).max(1);
        let cutoff = now - policy.state_ttl_seconds as f64;

        let (seen,): (usize,) = self
            .guarded(
                "SETEX",
                redis::pipe()
                    .set_ex(&state_key, payload, ttl)
                    .ignore()
                    .zadd(&seen_key, key, state.last_seen)
                    .ignore()
                    .zrembyscore(&seen_key, "-inf", cutoff)
                    .ignore()
                    .zcard(&seen_key)
                    .query_async(&mut conn),
            )
            .await?;

        Ok(seen)
    }

    /// Evict least recently seen, unblocked records until the namespace fits
    /// `max_states`. Blocked records are skipped.
    async fn trim_states(
        &self,
        kind: KeyKind,
        seen: usize,
        max_states: usize,
        now: f64,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let seen_key = self.keys.states_seen(kind);
        let overflow = seen.saturating_sub(max_states);
        let batch = overflow.max(16);

        let mut evicted: Vec<String> = Vec::new();
        let mut start = 0usize;
        while evicted.len() < overflow {
            let stop = start + batch - 1;
            let members: Vec<String> = self
                .guarded(
                    "ZRANGE",
                    conn.zrange(&seen_key, start as isize, stop as isize),
                )
                .await?;
            if members.is_empty() {
                break;
            }

            let state_keys: Vec<String> = members.iter().map(|m| self.keys.state(kind, m)).collect();
            let records: Vec<Option<String>> =
                self.guarded("MGET", conn.mget(&state_keys)).await?;

            for (member, record) in members.iter().zip(records) {
                let blocked = match record {
                    Some(raw) => serde_json::from_str::<AttemptState>(&raw)?.is_blocked_at(now),
                    None => false,
                };
                if !blocked {
                    evicted.push(member.clone());
                    if evicted.len() >= overflow {
                        break;
                    }
                }
            }
            start += members.len();
        }

        if evicted.is_empty() {
            return Ok(());
        }

        let state_keys: Vec<String> = evicted.iter().map(|m| self.keys.state(kind, m)).collect();
        let _: () = self
            .guarded(
                "DEL",
                redis::pipe()
                    .del(&state_keys)
                    .ignore()
                    .zrem(&seen_key, &evicted)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;

        debug!(kind = %kind, evicted = evicted.len(), "Evicted least recently seen identities");
        Ok(())
    }

    /// Count one failure in the metrics hash and keep it within TTL and cap.
    async fn update_metric(
        &self,
        kind: KeyKind,
        key: &str,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let hash_key = self.keys.metrics(kind);
        let seen_key = self.keys.metrics_seen(kind);
        let cutoff = now - policy.metrics_ttl() as f64;

        let (stale, size): (Vec<String>, usize) = self
            .guarded(
                "HINCRBY",
                redis::pipe()
                    .hincr(&hash_key, key, 1)
                    .ignore()
                    .zadd(&seen_key, key, now)
                    .ignore()
                    .zrangebyscore(&seen_key, "-inf", format!("({cutoff}"))
                    .zcard(&seen_key)
                    .query_async(&mut conn),
            )
            .await?;

        if !stale.is_empty() {
            let _: () = self
                .guarded(
                    "ZREM",
                    redis::pipe()
                        .zrem(&seen_key, &stale)
                        .ignore()
                        .hdel(&hash_key, &stale)
                        .ignore()
                        .query_async(&mut conn),
                )
                .await?;
        }

        let retained = size.saturating_sub(stale.len());
        if retained <= policy.max_metrics_keys {
            return Ok(());
        }

        let overflow = retained - policy.max_metrics_keys;
        let oldest: Vec<String> = self
            .guarded("ZRANGE", conn.zrange(&seen_key, 0, overflow as isize - 1))
            .await?;
        if oldest.is_empty() {
            return Ok(());
        }

        let _: () = self
            .guarded(
                "ZREM",
                redis::pipe()
                    .zrem(&seen_key, &oldest)
                    .ignore()
                    .hdel(&hash_key, &oldest)
                    .ignore()
                    .hincr(self.keys.counters(), "metrics_dropped_total", oldest.len())
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;

        Ok(())
    }

    async fn incr_counters(&self, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn_manager.clone();
        let counters = self.keys.counters();
        let mut pipe = redis::pipe();
        for field in fields {
            pipe.hincr(&counters, *field, 1).ignore();
        }
        let _: () = self.guarded("HINCRBY", pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    /// Collect every key matching `pattern`.
    async fn scan_keys(&self, pattern: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn_manager.clone();
        let mut found = HashSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .guarded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            found.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }
}

/// Counter writes never decide an answer; a failed one is only logged.
fn log_metrics_error(metric: &'static str, result: Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, metric = metric, "Rate limit metrics update failed");
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn is_blocked(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<bool> {
        let keys: Vec<String> = identity
            .keys()
            .map(|(kind, key)| self.keys.state(kind, key))
            .collect();
        if keys.is_empty() {
            return Ok(false);
        }

        let mut conn = self.conn_manager.clone();
        let records: Vec<Option<String>> = self.guarded("MGET", conn.mget(&keys)).await?;

        let mut blocked = false;
        for raw in records.into_iter().flatten() {
            let mut state: AttemptState = serde_json::from_str(&raw)?;
            state.purge(now, policy.window_seconds);
            if state.is_blocked_at(now) {
                blocked = true;
                break;
            }
        }

        trace!(identity = %identity, blocked = blocked, "Checked shared rate limit state");

        if blocked {
            log_metrics_error(
                "blocked_requests_total",
                self.incr_counters(&["blocked_requests_total"]).await,
            );
        }
        Ok(blocked)
    }

    async fn register_failure(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        let mut triggered = false;
        for (kind, key) in identity.keys() {
            let mut state = self
                .load_state(kind, key, policy, now)
                .await?
                .unwrap_or_else(|| AttemptState::new(now));
            if state.record_failure(now, policy) {
                debug!(
                    kind = %kind,
                    key = %key,
                    penalty_level = state.penalty_level,
                    blocked_until = state.blocked_until,
                    "Rate limit triggered"
                );
                triggered = true;
            }

            let seen = self.save_state(kind, key, &state, policy, now).await?;
            if let Some(max_states) = policy.max_states {
                if seen > max_states {
                    self.trim_states(kind, seen, max_states, now).await?;
                }
            }
        }

        let mut fields = vec!["failed_attempts_total"];
        for (kind, _) in identity.keys() {
            fields.push(match kind {
                KeyKind::Ip => "failed_attempts_ip_total",
                KeyKind::User => "failed_attempts_user_total",
            });
        }
        if triggered {
            fields.push("rate_limit_triggered_total");
        }
        log_metrics_error("failure counters", self.incr_counters(&fields).await);

        for (kind, key) in identity.keys() {
            log_metrics_error("retained failures", self.update_metric(kind, key, policy, now).await);
        }
        Ok(())
    }

    async fn register_success(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        let updates = identity.keys().map(|(kind, key)| async move {
            if let Some(mut state) = self.load_state(kind, key, policy, now).await? {
                state.record_success(now);
                self.save_state(kind, key, &state, policy, now).await?;
                trace!(kind = %kind, key = %key, "Cleared shared failure state");
            }
            Ok::<_, GatekeeperError>(())
        });
        try_join_all(updates).await?;
        Ok(())
    }

    async fn metrics_snapshot(
        &self,
        _policy: &RateLimitPolicy,
        _now: f64,
    ) -> Result<MetricsSnapshot> {
        let mut conn = self.conn_manager.clone();
        let (counters, metrics_ip, metrics_user): (
            HashMap<String, u64>,
            HashMap<String, u64>,
            HashMap<String, u64>,
        ) = self
            .guarded(
                "HGETALL",
                redis::pipe()
                    .hgetall(self.keys.counters())
                    .hgetall(self.keys.metrics(KeyKind::Ip))
                    .hgetall(self.keys.metrics(KeyKind::User))
                    .query_async(&mut conn),
            )
            .await?;

        let ip_pattern = self.keys.state_pattern(KeyKind::Ip);
        let user_pattern = self.keys.state_pattern(KeyKind::User);
        let (ip_states, user_states) =
            try_join(self.scan_keys(&ip_pattern), self.scan_keys(&user_pattern)).await?;

        let counter = |name: &str| counters.get(name).copied().unwrap_or(0);
        Ok(MetricsSnapshot {
            failed_attempts_total: counter("failed_attempts_total"),
            failed_attempts_ip_total: counter("failed_attempts_ip_total"),
            failed_attempts_user_total: counter("failed_attempts_user_total"),
            blocked_requests_total: counter("blocked_requests_total"),
            rate_limit_triggered_total: counter("rate_limit_triggered_total"),
            ip_states_size: ip_states.len(),
            user_states_size: user_states.len(),
            metrics_ip_size: metrics_ip.len(),
            metrics_user_size: metrics_user.len(),
            metrics_dropped_total: counter("metrics_dropped_total"),
            retained_failed_by_ip: metrics_ip.into_iter().collect(),
            retained_failed_by_user: metrics_user.into_iter().collect(),
        })
    }

    async fn reset(&self) -> Result<()> {
        let keys: Vec<String> = self.scan_keys(&self.keys.all()).await?.into_iter().collect();
        let mut conn = self.conn_manager.clone();
        for chunk in keys.chunks(DELETE_BATCH) {
            let _: () = self.guarded("DEL", conn.del(chunk)).await?;
        }

        info!(namespace = %self.keys.namespace, removed = keys.len(), "Reset shared rate limit state");
        Ok(())
    }
}
