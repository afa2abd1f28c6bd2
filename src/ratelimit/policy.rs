//! Rate limit policy: the tunables shared by every call on a limiter.

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

/// Thresholds, windows and cardinality caps for login rate limiting.
///
/// A policy is immutable once installed in a limiter. Changing it goes
/// through [`RateLimiter::reset`](super::RateLimiter::reset), which also
/// clears all tracked state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Failures inside the window that trigger a block
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Length of the sliding failure window
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Block duration at penalty level 1
    #[serde(default = "default_base_block_seconds")]
    pub base_block_seconds: u64,

    /// Upper bound for any single block
    #[serde(default = "default_max_block_seconds")]
    pub max_block_seconds: u64,

    /// Idle time after which an unblocked, empty state is discarded
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: u64,

    /// Idle time after which a metric entry is discarded.
    /// Follows `state_ttl_seconds` when unset.
    #[serde(default)]
    pub metrics_ttl_seconds: Option<u64>,

    /// Maximum tracked identities per namespace (unbounded when unset)
    #[serde(default)]
    pub max_states: Option<usize>,

    /// Maximum metric entries per namespace
    #[serde(default = "default_max_metrics_keys")]
    pub max_metrics_keys: usize,

    /// Full pruning runs once every this many operations
    #[serde(default = "default_prune_every_ops")]
    pub prune_every_ops: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_seconds: default_window_seconds(),
            base_block_seconds: default_base_block_seconds(),
            max_block_seconds: default_max_block_seconds(),
            state_ttl_seconds: default_state_ttl_seconds(),
            metrics_ttl_seconds: None,
            max_states: None,
            max_metrics_keys: default_max_metrics_keys(),
            prune_every_ops: default_prune_every_ops(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_window_seconds() -> u64 {
    60
}

fn default_base_block_seconds() -> u64 {
    30
}

fn default_max_block_seconds() -> u64 {
    900
}

fn default_state_ttl_seconds() -> u64 {
    1800
}

fn default_max_metrics_keys() -> usize {
    1024
}

fn default_prune_every_ops() -> u64 {
    64
}

impl RateLimitPolicy {
    /// Check that the policy can drive a limiter.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GatekeeperError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(GatekeeperError::Config(
                "window_seconds must be at least 1".to_string(),
            ));
        }
        if self.max_metrics_keys == 0 {
            return Err(GatekeeperError::Config(
                "max_metrics_keys must be at least 1".to_string(),
            ));
        }
        if self.max_states == Some(0) {
            return Err(GatekeeperError::Config(
                "max_states must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective metrics TTL in seconds.
    pub fn metrics_ttl(&self) -> u64 {
        self.metrics_ttl_seconds.unwrap_or(self.state_ttl_seconds)
    }

    /// Pruning cadence, never below one.
    pub fn prune_interval(&self) -> u64 {
        self.prune_every_ops.max(1)
    }

    /// Block duration for a given penalty level.
    ///
    /// `base * 2^(level - 1)`, capped at `max_block_seconds`. Saturates
    /// instead of overflowing for large levels.
    pub fn block_duration(&self, penalty_level: u32) -> u64 {
        let exponent = penalty_level.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_block_seconds
            .saturating_mul(factor)
            .min(self.max_block_seconds)
    }

    /// Return a copy of this policy with the given overrides applied.
    pub fn with_overrides(&self, overrides: &PolicyOverrides) -> Self {
        let mut policy = self.clone();
        if let Some(v) = overrides.max_attempts {
            policy.max_attempts = v;
        }
        if let Some(v) = overrides.window_seconds {
            policy.window_seconds = v;
        }
        if let Some(v) = overrides.base_block_seconds {
            policy.base_block_seconds = v;
        }
        if let Some(v) = overrides.max_block_seconds {
            policy.max_block_seconds = v;
        }
        if let Some(v) = overrides.state_ttl_seconds {
            policy.state_ttl_seconds = v;
        }
        if let Some(v) = overrides.metrics_ttl_seconds {
            policy.metrics_ttl_seconds = v;
        }
        if let Some(v) = overrides.max_states {
            policy.max_states = v;
        }
        if let Some(v) = overrides.max_metrics_keys {
            policy.max_metrics_keys = v;
        }
        if let Some(v) = overrides.prune_every_ops {
            policy.prune_every_ops = v;
        }
        policy
    }
}

/// Optional replacements for individual policy fields, applied on reset.
///
/// `max_states` and `metrics_ttl_seconds` are doubly optional: `None` keeps
/// the current value, `Some(None)` unsets it and `Some(Some(n))` installs a
/// new one. An unset metrics TTL follows `state_ttl_seconds` again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    pub max_attempts: Option<u32>,
    pub window_seconds: Option<u64>,
    pub base_block_seconds: Option<u64>,
    pub max_block_seconds: Option<u64>,
    pub state_ttl_seconds: Option<u64>,
    pub metrics_ttl_seconds: Option<Option<u64>>,
    pub max_states: Option<Option<usize>>,
    pub max_metrics_keys: Option<usize>,
    pub prune_every_ops: Option<u64>,
}
