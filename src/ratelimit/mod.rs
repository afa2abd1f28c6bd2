//! Login rate limiting: failure tracking, progressive blocking and stores.

mod backend;
mod factory;
mod identity;
mod limiter;
mod memory;
mod policy;
mod remote;
mod state;

pub use backend::{MetricsSnapshot, RateLimitStore};
pub use factory::{create_store, BackendKind, StoreBackend};
pub use identity::{Identity, KeyKind};
pub use limiter::{unix_now, BackendFailurePolicy, RateLimiter};
pub use memory::InMemoryStore;
pub use policy::{PolicyOverrides, RateLimitPolicy};
pub use remote::{KeySpace, RedisStore, DEFAULT_NAMESPACE};
pub use state::{AttemptState, MetricState};
