//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{BackendFailurePolicy, RateLimitPolicy, DEFAULT_NAMESPACE};

/// Environment variable prefix, e.g. `GATEKEEPER_POLICY__MAX_ATTEMPTS=3`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for a Gatekeeper deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Rate limit thresholds and caps
    #[serde(default)]
    pub policy: RateLimitPolicy,

    /// Store selection
    #[serde(default)]
    pub store: StoreConfig,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selector: `memory` or `redis` (alias `remote`)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Redis connection URL, required by the `redis` backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Per round trip timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Answer given by `is_blocked` when the backend fails
    #[serde(default)]
    pub on_backend_error: BackendFailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: None,
            namespace: default_namespace(),
            timeout_ms: default_timeout_ms(),
            on_backend_error: BackendFailurePolicy::default(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from an optional file, overlaid with the process
    /// environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_from(path, None)
    }

    fn load_from(path: Option<&str>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.store.timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "store.timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.store.redis_url, None);
        assert_eq!(config.store.namespace, "gatekeeper:rate_limit");
        assert_eq!(config.store.timeout_ms, 2000);
        assert_eq!(config.store.on_backend_error, BackendFailurePolicy::FailClosed);
        assert_eq!(config.policy, RateLimitPolicy::default());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
policy:
  max_attempts: 3
  window_seconds: 30
  max_states: 10000
store:
  backend: redis
  redis_url: redis://cache:6379/0
  on_backend_error: fail_open
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policy.max_attempts, 3);
        assert_eq!(config.policy.window_seconds, 30);
        assert_eq!(config.policy.max_states, Some(10000));
        assert_eq!(config.policy.base_block_seconds, 30);
        assert_eq!(config.store.backend, "redis");
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379/0"));
        assert_eq!(config.store.on_backend_error, BackendFailurePolicy::FailOpen);
        assert_eq!(config.store.timeout_ms, 2000);
    }

    #[test]
    fn test_from_yaml_rejects_invalid_policy() {
        let result = GatekeeperConfig::from_yaml("policy:\n  max_attempts: 0\n");
        assert!(matches!(result, Err(GatekeeperError::Config(_))));
    }

    #[test]
    fn test_from_env_overrides() {
        let config = GatekeeperConfig::load_from(
            None,
            env(&[
                ("GATEKEEPER_POLICY__MAX_ATTEMPTS", "7"),
                ("GATEKEEPER_POLICY__METRICS_TTL_SECONDS", "600"),
                ("GATEKEEPER_STORE__BACKEND", "redis"),
                ("GATEKEEPER_STORE__REDIS_URL", "redis://127.0.0.1:6379"),
                ("UNRELATED", "ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(config.policy.max_attempts, 7);
        assert_eq!(config.policy.metrics_ttl(), 600);
        assert_eq!(config.policy.window_seconds, 60);
        assert_eq!(config.store.backend, "redis");
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
    }

    #[test]
    fn test_empty_env_yields_defaults() {
        let config = GatekeeperConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config, GatekeeperConfig::default());
    }
}
