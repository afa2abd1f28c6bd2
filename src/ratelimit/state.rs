//! Per-identity attempt and metric state.
//!
//! Both stores drive the same [`AttemptState`] transitions, which is what
//! keeps the in-memory and Redis backends behaviorally identical.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::policy::RateLimitPolicy;

/// Failure history and block status for one identity in one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptState {
    /// Failure timestamps still inside the sliding window, oldest first
    #[serde(default)]
    pub failures: VecDeque<f64>,
    /// Rejected until this timestamp (0 means never blocked)
    #[serde(default)]
    pub blocked_until: f64,
    /// Number of blocks triggered since the last success
    #[serde(default)]
    pub penalty_level: u32,
    /// Timestamp of the most recent touch
    #[serde(default)]
    pub last_seen: f64,
}

impl AttemptState {
    /// Create an empty state first seen at `now`.
    pub fn new(now: f64) -> Self {
        Self {
            last_seen: now,
            ..Default::default()
        }
    }

    /// Drop failures older than the sliding window.
    ///
    /// Failures are appended in time order, so the scan stops at the first
    /// timestamp still inside the window.
    pub fn purge(&mut self, now: f64, window_seconds: u64) {
        let lower_bound = now - window_seconds as f64;
        while self.failures.front().is_some_and(|&ts| ts < lower_bound) {
            self.failures.pop_front();
        }
    }

    /// Whether a block is in force at `now`.
    pub fn is_blocked_at(&self, now: f64) -> bool {
        self.blocked_until > now
    }

    /// Purge the window, mark the state as seen and report whether it is blocked.
    pub fn check(&mut self, now: f64, policy: &RateLimitPolicy) -> bool {
        self.last_seen = now;
        self.purge(now, policy.window_seconds);
        self.is_blocked_at(now)
    }

    /// Record one failure at `now`.
    ///
    /// Returns `true` if this failure reached the threshold and triggered a
    /// (possibly extended) block. An existing block is never shortened.
    pub fn record_failure(&mut self, now: f64, policy: &RateLimitPolicy) -> bool {
        self.last_seen = now;
        self.purge(now, policy.window_seconds);
        self.failures.push_back(now);

        if self.failures.len() < policy.max_attempts as usize {
            return false;
        }

        self.penalty_level = self.penalty_level.saturating_add(1);
        let duration = policy.block_duration(self.penalty_level);
        self.blocked_until = self.blocked_until.max(now + duration as f64);
        self.failures.clear();
        true
    }

    /// Forget failures, penalty and any block after a successful login.
    pub fn record_success(&mut self, now: f64) {
        self.failures.clear();
        self.penalty_level = 0;
        self.blocked_until = 0.0;
        self.last_seen = now;
    }

    /// Whether TTL pruning may discard this state.
    ///
    /// The window must already be purged for `now`.
    pub fn is_stale(&self, now: f64, ttl_seconds: u64) -> bool {
        !self.is_blocked_at(now)
            && self.failures.is_empty()
            && self.last_seen < now - ttl_seconds as f64
    }
}

/// Observability counter for one identity in one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricState {
    /// Failures recorded since this entry was created
    pub failures: u64,
    /// Timestamp of the most recent failure
    pub last_seen: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, window: u64, base: u64, max: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            max_attempts,
            window_seconds: window,
            base_block_seconds: base,
            max_block_seconds: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_purge_drops_only_old_failures() {
        let mut state = AttemptState::new(0.0);
        state.failures.extend([1.0, 2.0, 5.0, 9.0]);

        state.purge(10.0, 5);

        // 5.0 sits exactly on the lower bound and is kept
        assert_eq!(state.failures, VecDeque::from(vec![5.0, 9.0]));
    }

    #[test]
    fn test_threshold_triggers_block() {
        let policy = policy(3, 5, 1, 10);
        let mut state = AttemptState::new(1.0);

        assert!(!state.record_failure(1.0, &policy));
        assert!(!state.record_failure(2.0, &policy));
        assert!(state.record_failure(3.0, &policy));

        assert_eq!(state.blocked_until, 4.0);
        assert_eq!(state.penalty_level, 1);
        assert!(state.failures.is_empty());
        assert!(state.is_blocked_at(3.5));
        assert!(!state.is_blocked_at(4.0));
    }

    #[test]
    fn test_penalty_escalates_after_expiry() {
        let policy = policy(3, 5, 1, 10);
        let mut state = AttemptState::new(1.0);

        for t in [1.0, 2.0, 3.0] {
            state.record_failure(t, &policy);
        }
        assert!(!state.check(8.0, &policy));

        for t in [8.0, 9.0] {
            assert!(!state.record_failure(t, &policy));
        }
        assert!(state.record_failure(10.0, &policy));

        assert_eq!(state.penalty_level, 2);
        assert_eq!(state.blocked_until, 12.0);
    }

    #[test]
    fn test_block_is_never_shortened() {
        let policy = policy(1, 60, 100, 100);
        let mut state = AttemptState::new(0.0);
        state.blocked_until = 500.0;

        assert!(state.record_failure(10.0, &policy));
        assert_eq!(state.blocked_until, 500.0);
        assert_eq!(state.penalty_level, 1);
    }

    #[test]
    fn test_success_resets_everything() {
        let policy = policy(2, 60, 10, 100);
        let mut state = AttemptState::new(0.0);
        state.record_failure(1.0, &policy);
        state.record_failure(2.0, &policy);
        state.record_failure(3.0, &policy);

        state.record_success(4.0);

        assert_eq!(state.penalty_level, 0);
        assert_eq!(state.blocked_until, 0.0);
        assert!(state.failures.is_empty());
        assert_eq!(state.last_seen, 4.0);

        state.record_failure(5.0, &policy);
        state.record_failure(6.0, &policy);
        assert_eq!(state.penalty_level, 1);
        assert_eq!(state.blocked_until, 16.0);
    }

    #[test]
    fn test_staleness() {
        let mut state = AttemptState::new(0.0);
        assert!(state.is_stale(11.0, 10));
        assert!(!state.is_stale(10.0, 10));

        state.blocked_until = 50.0;
        assert!(!state.is_stale(20.0, 10));

        state.blocked_until = 0.0;
        state.failures.push_back(19.0);
        assert!(!state.is_stale(20.0, 10));
    }

    #[test]
    fn test_record_decodes_with_missing_fields() {
        let state: AttemptState = serde_json::from_str(r#"{"blocked_until": 12.5}"#).unwrap();
        assert_eq!(state.blocked_until, 12.5);
        assert_eq!(state.penalty_level, 0);
        assert!(state.failures.is_empty());
    }
}
