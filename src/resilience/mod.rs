//! Resilience layer: everything between the core and an unreliable world.
//!
//! - **`retry`**: exponential backoff + jitter under an outer deadline
//! - **`breaker`**: per-target circuit breakers and their registry
//! - **`dlq`**: durable dead-letter queue with idempotent add and replay
//! - **`degradation`**: fallback strategy table with a feature-flag gate
//! - **`checks`**: per-target health probes with restart hooks
//! - **`provider`**: the provider capability trait and resilient façade

pub mod breaker;
pub mod checks;
pub mod degradation;
pub mod dlq;
pub mod provider;
pub mod retry;
