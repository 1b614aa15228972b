//! Global configuration types for Parley.
//!
//! `GlobalConfig` represents the top-level `config.toml` that tunes the
//! aggregation window, dispatch queue, worker pool, and API server.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Parley pipeline.
///
/// Loaded from `~/.parley/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Seconds after which an open batch closes on the next arrival.
    #[serde(default = "default_aggregation_timeout_secs")]
    pub aggregation_timeout_secs: u64,

    /// Label prefixed to each section of a multi-message batch; `{n}` is the
    /// 1-based position.
    #[serde(default = "default_ordinal_label")]
    pub ordinal_label: String,

    /// Capacity of the bounded dispatch queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum number of work items processed concurrently.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Seconds between stale-batch sweeps. `0` disables the sweeper.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Lease length of a retry claim, in seconds.
    #[serde(default = "default_retry_claim_ttl_secs")]
    pub retry_claim_ttl_secs: u64,

    /// Capacity of the batch event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Address the REST API binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_aggregation_timeout_secs() -> u64 {
    30
}

fn default_ordinal_label() -> String {
    "消息{n}：".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_retry_claim_ttl_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    256
}

fn default_bind_address() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            aggregation_timeout_secs: default_aggregation_timeout_secs(),
            ordinal_label: default_ordinal_label(),
            queue_capacity: default_queue_capacity(),
            worker_concurrency: default_worker_concurrency(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retry_claim_ttl_secs: default_retry_claim_ttl_secs(),
            event_capacity: default_event_capacity(),
            bind_address: default_bind_address(),
        }
    }
}
