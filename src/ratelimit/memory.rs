//! Process-local store.
//!
//! All state sits behind one coarse lock. A login attempt touches at most
//! two keys and the lock is never held across an `.await`, so contention
//! stays low without sharding.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{MetricsSnapshot, RateLimitStore};
use super::identity::{Identity, KeyKind};
use super::policy::RateLimitPolicy;
use super::state::{AttemptState, MetricState};
use crate::error::Result;

/// In-memory rate limit store with amortized pruning and bounded cardinality.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    ip: Namespace,
    user: Namespace,
    counters: Counters,
    /// Operations since creation or the last reset
    ops: u64,
}

#[derive(Debug, Default)]
struct Counters {
    failed_attempts_total: u64,
    failed_attempts_ip_total: u64,
    failed_attempts_user_total: u64,
    blocked_requests_total: u64,
    rate_limit_triggered_total: u64,
    metrics_dropped_total: u64,
}

#[derive(Default)]
struct Namespace {
    states: HashMap<String, AttemptState>,
    metrics: MetricLedger,
}

/// Recency-ordered metric entries.
///
/// Every touch moves the key to the back of `order`; eviction pops from
/// the front.
#[derive(Default)]
struct MetricLedger {
    entries: HashMap<String, (MetricState, u64)>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl MetricLedger {
    /// Count one failure for `key` and enforce the cap. Returns the number
    /// of entries dropped to make room.
    fn record_failure(&mut self, key: &str, now: f64, cap: usize) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert((MetricState::default(), seq));
        if entry.1 != seq {
            self.order.remove(&entry.1);
            entry.1 = seq;
        }
        entry.0.failures += 1;
        entry.0.last_seen = now;
        self.order.insert(seq, key.to_string());

        self.enforce_cap(cap)
    }

    fn enforce_cap(&mut self, cap: usize) -> u64 {
        let mut dropped = 0;
        while self.entries.len() > cap {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            dropped += 1;
        }
        dropped
    }

    /// Drop expired entries, then enforce the cap. Only cap evictions are
    /// reported as dropped.
    fn prune(&mut self, now: f64, ttl_seconds: u64, cap: usize) -> u64 {
        let cutoff = now - ttl_seconds as f64;
        let order = &mut self.order;
        self.entries.retain(|_, (state, seq)| {
            let keep = state.last_seen >= cutoff;
            if !keep {
                order.remove(&*seq);
            }
            keep
        });
        self.enforce_cap(cap)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|(key, (state, _))| (key.clone(), state.failures))
            .collect()
    }
}

impl Namespace {
    /// Remove stale states, then evict least recently seen unblocked states
    /// while the map exceeds `max_states`. Returns the number removed.
    fn prune_states(&mut self, now: f64, policy: &RateLimitPolicy) -> usize {
        let before = self.states.len();
        let ttl = policy.state_ttl_seconds;
        let window = policy.window_seconds;
        self.states.retain(|_, state| {
            state.purge(now, window);
            !state.is_stale(now, ttl)
        });

        if let Some(max_states) = policy.max_states {
            if self.states.len() > max_states {
                self.evict_lru(now, max_states);
            }
        }

        before - self.states.len()
    }

    fn evict_lru(&mut self, now: f64, max_states: usize) {
        let mut candidates: Vec<(f64, String)> = self
            .states
            .iter()
            .filter(|(_, state)| !state.is_blocked_at(now))
            .map(|(key, state)| (state.last_seen, key.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let overflow = self.states.len() - max_states;
        for (_, key) in candidates.into_iter().take(overflow) {
            self.states.remove(&key);
        }

        if self.states.len() > max_states {
            debug!(
                size = self.states.len(),
                max_states = max_states,
                "Cardinality bound exceeded by blocked identities"
            );
        }
    }
}

impl Inner {
    fn namespace(&mut self, kind: KeyKind) -> &mut Namespace {
        match kind {
            KeyKind::Ip => &mut self.ip,
            KeyKind::User => &mut self.user,
        }
    }

    /// Count one operation and run a full prune on every Nth.
    fn tick(&mut self, now: f64, policy: &RateLimitPolicy) {
        self.ops += 1;
        if self.ops % policy.prune_interval() == 0 {
            self.prune(now, policy);
        }
    }

    fn prune(&mut self, now: f64, policy: &RateLimitPolicy) {
        let removed_ip = self.ip.prune_states(now, policy);
        let removed_user = self.user.prune_states(now, policy);

        let ttl = policy.metrics_ttl();
        let cap = policy.max_metrics_keys;
        let dropped = self.ip.metrics.prune(now, ttl, cap) + self.user.metrics.prune(now, ttl, cap);
        self.counters.metrics_dropped_total += dropped;

        trace!(
            ops = self.ops,
            removed_ip = removed_ip,
            removed_user = removed_user,
            metrics_dropped = dropped,
            "Pruned rate limit state"
        );
    }
}

impl InMemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the attempt state tracked for a key.
    ///
    /// Returns `None` if the key is not tracked.
    pub fn attempt_state(&self, kind: KeyKind, key: &str) -> Option<AttemptState> {
        let mut inner = self.inner.lock();
        inner.namespace(kind).states.get(key).cloned()
    }

    /// Get the number of tracked identities in a namespace.
    pub fn state_count(&self, kind: KeyKind) -> usize {
        let mut inner = self.inner.lock();
        inner.namespace(kind).states.len()
    }

    fn check_blocked(&self, identity: Identity<'_>, policy: &RateLimitPolicy, now: f64) -> bool {
        let mut inner = self.inner.lock();
        inner.tick(now, policy);

        let mut blocked = false;
        for (kind, key) in identity.keys() {
            if let Some(state) = inner.namespace(kind).states.get_mut(key) {
                if state.check(now, policy) {
                    trace!(kind = %kind, key = %key, blocked_until = state.blocked_until, "Identity is blocked");
                    blocked = true;
                }
            }
        }

        if blocked {
            inner.counters.blocked_requests_total += 1;
        }
        blocked
    }

    fn record_failure(&self, identity: Identity<'_>, policy: &RateLimitPolicy, now: f64) {
        let mut inner = self.inner.lock();
        inner.tick(now, policy);
        inner.counters.failed_attempts_total += 1;

        let mut triggered = false;
        for (kind, key) in identity.keys() {
            match kind {
                KeyKind::Ip => inner.counters.failed_attempts_ip_total += 1,
                KeyKind::User => inner.counters.failed_attempts_user_total += 1,
            }

            let namespace = inner.namespace(kind);
            let dropped = namespace
                .metrics
                .record_failure(key, now, policy.max_metrics_keys);

            let state = namespace
                .states
                .entry(key.to_string())
                .or_insert_with(|| AttemptState::new(now));
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

            let over_bound = policy
                .max_states
                .is_some_and(|max_states| namespace.states.len() > max_states);
            if over_bound {
                namespace.prune_states(now, policy);
            }

            inner.counters.metrics_dropped_total += dropped;
        }

        if triggered {
            inner.counters.rate_limit_triggered_total += 1;
        }
    }

    fn record_success(&self, identity: Identity<'_>, policy: &RateLimitPolicy, now: f64) {
        let mut inner = self.inner.lock();
        inner.tick(now, policy);

        for (kind, key) in identity.keys() {
            if let Some(state) = inner.namespace(kind).states.get_mut(key) {
                state.record_success(now);
                trace!(kind = %kind, key = %key, "Cleared failure state");
            }
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let counters = &inner.counters;
        MetricsSnapshot {
            failed_attempts_total: counters.failed_attempts_total,
            failed_attempts_ip_total: counters.failed_attempts_ip_total,
            failed_attempts_user_total: counters.failed_attempts_user_total,
            blocked_requests_total: counters.blocked_requests_total,
            rate_limit_triggered_total: counters.rate_limit_triggered_total,
            ip_states_size: inner.ip.states.len(),
            user_states_size: inner.user.states.len(),
            metrics_ip_size: inner.ip.metrics.len(),
            metrics_user_size: inner.user.metrics.len(),
            metrics_dropped_total: counters.metrics_dropped_total,
            retained_failed_by_ip: inner.ip.metrics.snapshot(),
            retained_failed_by_user: inner.user.metrics.snapshot(),
        }
    }

    /// Clear all state and counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn is_blocked(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<bool> {
        Ok(self.check_blocked(identity, policy, now))
    }

    async fn register_failure(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        self.record_failure(identity, policy, now);
        Ok(())
    }

    async fn register_success(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        self.record_success(identity, policy, now);
        Ok(())
    }

    async fn metrics_snapshot(
        &self,
        _policy: &RateLimitPolicy,
        _now: f64,
    ) -> Result<MetricsSnapshot> {
        Ok(self.snapshot())
    }

    async fn reset(&self) -> Result<()> {
        self.clear();
        Ok(())
    }
}
