//! Store selection from deployment configuration.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::backend::{MetricsSnapshot, RateLimitStore};
use super::identity::Identity;
use super::memory::InMemoryStore;
use super::policy::RateLimitPolicy;
use super::remote::RedisStore;
use crate::config::StoreConfig;
use crate::error::Result;

/// Backend requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
}

impl BackendKind {
    /// Parse a backend selector. `remote` is accepted as an alias for `redis`.
    pub fn parse(selector: &str) -> Option<Self> {
        match selector.trim().to_ascii_lowercase().as_str() {
            "" | "memory" => Some(BackendKind::Memory),
            "redis" | "remote" => Some(BackendKind::Redis),
            _ => None,
        }
    }
}

/// The store a limiter runs on.
pub enum StoreBackend {
    /// Process-local state
    Memory(InMemoryStore),
    /// State shared through Redis
    Redis(RedisStore),
}

impl StoreBackend {
    /// Short name for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Redis(_) => "redis",
        }
    }
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Memory(InMemoryStore::new())
    }
}

/// Build the store described by `config`.
///
/// Never fails: a Redis backend that is misconfigured or unreachable is
/// replaced by an in-memory store and a warning is logged.
pub async fn create_store(config: &StoreConfig) -> StoreBackend {
    let kind = match BackendKind::parse(&config.backend) {
        Some(kind) => kind,
        None => {
            warn!(
                backend = %config.backend,
                "Unknown rate limit backend; using in-memory store"
            );
            BackendKind::Memory
        }
    };

    if kind == BackendKind::Memory {
        info!("Using in-memory rate limit store");
        return StoreBackend::default();
    }

    let Some(redis_url) = config.redis_url.as_deref().filter(|url| !url.is_empty()) else {
        warn!("Redis rate limit backend selected without a redis_url; using in-memory store");
        return StoreBackend::default();
    };

    let timeout = Duration::from_millis(config.timeout_ms);
    match RedisStore::connect(redis_url, &config.namespace, timeout).await {
        Ok(store) => StoreBackend::Redis(store),
        Err(e) => {
            warn!(error = %e, "Could not initialize Redis rate limit backend; using in-memory store");
            StoreBackend::default()
        }
    }
}

#[async_trait]
impl RateLimitStore for StoreBackend {
    async fn is_blocked(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<bool> {
        match self {
            StoreBackend::Memory(store) => store.is_blocked(identity, policy, now).await,
            StoreBackend::Redis(store) => store.is_blocked(identity, policy, now).await,
        }
    }

    async fn register_failure(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        match self {
            StoreBackend::Memory(store) => store.register_failure(identity, policy, now).await,
            StoreBackend::Redis(store) => store.register_failure(identity, policy, now).await,
        }
    }

    async fn register_success(
        &self,
        identity: Identity<'_>,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<()> {
        match self {
            StoreBackend::Memory(store) => store.register_success(identity, policy, now).await,
            StoreBackend::Redis(store) => store.register_success(identity, policy, now).await,
        }
    }

    async fn metrics_snapshot(
        &self,
        policy: &RateLimitPolicy,
        now: f64,
    ) -> Result<MetricsSnapshot> {
        match self {
            StoreBackend::Memory(store) => store.metrics_snapshot(policy, now).await,
            StoreBackend::Redis(store) => store.metrics_snapshot(policy, now).await,
        }
    }

    async fn reset(&self) -> Result<()> {
        match self {
            StoreBackend::Memory(store) => store.reset().await,
            StoreBackend::Redis(store) => store.reset().await,
        }
    }
}
