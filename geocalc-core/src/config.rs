//! Engine Configuration
//!
//! All tunables of an [`EngineContext`](crate::engine::EngineContext) live in
//! [`EngineConfig`]. A config can be built in code or deserialized from JSON;
//! missing fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Number of 200 ms join polls after which a waiting thread forces a
/// suspension checkpoint (about ten seconds).
pub const DEFAULT_WAKE_CYCLES: u32 = 34;

/// Poll interval used while joining a scheduler.
pub const DEFAULT_JOIN_POLL_MS: u64 = 200;

/// Number of worker routines draining the RunTask queue.
pub const DEFAULT_RUN_TASK_WORKERS: usize = 2;

/// Get the number of available CPU cores.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run scheduled work on the worker pool. When false every computation
    /// runs inline on the requesting thread.
    pub multi_threading: bool,

    /// Upper bound on concurrently running schedulers.
    pub max_threads: usize,

    /// Worker routines that prepare pending nodes in the background.
    pub run_task_workers: usize,

    /// Join polls before a forced wake-up.
    pub wake_cycles: u32,

    /// Join poll interval in milliseconds.
    pub join_poll_ms: u64,

    /// Name given to worker threads.
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multi_threading: true,
            max_threads: num_cpus(),
            run_task_workers: DEFAULT_RUN_TASK_WORKERS,
            wake_cycles: DEFAULT_WAKE_CYCLES,
            join_poll_ms: DEFAULT_JOIN_POLL_MS,
            thread_name: "geocalc-worker".to_string(),
        }
    }
}

impl EngineConfig {
    /// A configuration that never leaves the calling thread.
    pub fn single_threaded() -> Self {
        Self {
            multi_threading: false,
            max_threads: 1,
            run_task_workers: 0,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(EngineError::Config("max_threads must be at least 1".into()));
        }
        if self.join_poll_ms == 0 {
            return Err(EngineError::Config("join_poll_ms must be positive".into()));
        }
        if self.wake_cycles == 0 {
            return Err(EngineError::Config("wake_cycles must be positive".into()));
        }
        Ok(())
    }

    pub fn join_poll(&self) -> Duration {
        Duration::from_millis(self.join_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.multi_threading);
        assert_eq!(config.wake_cycles, 34);
        assert_eq!(config.join_poll(), Duration::from_millis(200));
    }

    #[test]
    fn json_fills_in_missing_fields() {
        let config = EngineConfig::from_json(r#"{ "multi_threading": false, "max_threads": 3 }"#)
            .unwrap();
        assert!(!config.multi_threading);
        assert_eq!(config.max_threads, 3);
        assert_eq!(config.run_task_workers, DEFAULT_RUN_TASK_WORKERS);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = EngineConfig::from_json(r#"{ "max_threads": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            EngineConfig::from_json("{ nope"),
            Err(EngineError::Config(_))
        ));
    }
}
