//! Global configuration types for Sagaflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls retry
//! defaults, backoff, checkpointing, and the scheduler tick.

use serde::{Deserialize, Serialize};

/// Top-level configuration for a Sagaflow process.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Workflow engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry budget applied to steps that don't set their own.
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,

    /// Base backoff delay; attempt `n` waits `base * 2^(n-1)`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Per-attempt timeout for steps without their own. `None` = unbounded.
    #[serde(default)]
    pub default_step_timeout_secs: Option<u64>,

    /// Persist a snapshot after every successful step, not only on
    /// status transitions.
    #[serde(default = "default_checkpoint_each_step")]
    pub checkpoint_each_step: bool,
}

fn default_retry_count() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_checkpoint_each_step() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry_count: default_retry_count(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            default_step_timeout_secs: None,
            checkpoint_each_step: default_checkpoint_each_step(),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Control loop tick.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}
