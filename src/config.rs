//! Engine configuration.
//!
//! All fields have defaults so a partial YAML file (or none at all) yields a
//! working configuration. Durations are stored as plain seconds to keep the
//! file format obvious.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Rolling rate window for token accounting.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Token budget per credential owner within one rate window.
    #[serde(default = "default_token_budget")]
    pub token_budget_per_window: u64,

    /// When remaining budget drops below this, the reasoning client sleeps
    /// out the window instead of failing the call.
    #[serde(default = "default_budget_low_watermark")]
    pub budget_low_watermark: u64,

    /// Concurrent workflow cap per credential owner.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_owner: usize,

    /// Retry ceiling for failed workflow executions.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base for exponential backoff on transient failures.
    #[serde(default = "default_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,

    /// Fixed re-enqueue delay after a rate-limit failure. Must sit
    /// comfortably above `rate_window_secs` so the window has drained.
    #[serde(default = "default_rate_limit_retry_delay_secs")]
    pub rate_limit_retry_delay_secs: u64,

    /// Average workflow duration used for queue wait estimates.
    #[serde(default = "default_average_workflow_secs")]
    pub average_workflow_secs: u64,

    /// A-priori token cost attached to each queued request. Actual usage is
    /// recorded from backend usage counters after every call.
    #[serde(default = "default_token_estimate")]
    pub default_token_estimate: u64,

    /// Interval of the queue's background re-evaluation tick.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Iteration cap for exploration-heavy tool-use calls.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Message count past which conversation history is pruned.
    #[serde(default = "default_history_prune_threshold")]
    pub history_prune_threshold: usize,

    /// Recent messages kept (besides the first) when pruning.
    #[serde(default = "default_history_keep_recent")]
    pub history_keep_recent: usize,

    /// Every Nth tool round is marked cacheable, building a growing cached
    /// prefix on the backend.
    #[serde(default = "default_cacheable_round_interval")]
    pub cacheable_round_interval: u32,

    /// Whether plans pause for human approval before implementation.
    #[serde(default)]
    pub require_plan_approval: bool,

    /// Elapsed-time thresholds (seconds) at which "still working"
    /// notifications fire during long phases.
    #[serde(default = "default_still_working_thresholds")]
    pub still_working_thresholds_secs: Vec<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_window_secs: default_rate_window_secs(),
            token_budget_per_window: default_token_budget(),
            budget_low_watermark: default_budget_low_watermark(),
            max_concurrent_per_owner: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_backoff_base_secs: default_backoff_base_secs(),
            rate_limit_retry_delay_secs: default_rate_limit_retry_delay_secs(),
            average_workflow_secs: default_average_workflow_secs(),
            default_token_estimate: default_token_estimate(),
            tick_interval_secs: default_tick_interval_secs(),
            max_tool_iterations: default_max_tool_iterations(),
            history_prune_threshold: default_history_prune_threshold(),
            history_keep_recent: default_history_keep_recent(),
            cacheable_round_interval: default_cacheable_round_interval(),
            require_plan_approval: false,
            still_working_thresholds_secs: default_still_working_thresholds(),
        }
    }
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_token_budget() -> u64 {
    100_000
}

fn default_budget_low_watermark() -> u64 {
    4_000
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_rate_limit_retry_delay_secs() -> u64 {
    90
}

fn default_average_workflow_secs() -> u64 {
    180
}

fn default_token_estimate() -> u64 {
    8_000
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_max_tool_iterations() -> u32 {
    12
}

fn default_history_prune_threshold() -> usize {
    24
}

fn default_history_keep_recent() -> usize {
    10
}

fn default_cacheable_round_interval() -> u32 {
    3
}

fn default_still_working_thresholds() -> Vec<u64> {
    vec![300, 600]
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails
    /// cross-field validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).context("Failed to parse config file as YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_retry_delay_secs <= self.rate_window_secs {
            anyhow::bail!(
                "rate_limit_retry_delay_secs ({}) must exceed rate_window_secs ({})",
                self.rate_limit_retry_delay_secs,
                self.rate_window_secs
            );
        }
        if self.max_concurrent_per_owner == 0 {
            anyhow::bail!("max_concurrent_per_owner must be at least 1");
        }
        if self.history_keep_recent + 1 > self.history_prune_threshold {
            anyhow::bail!(
                "history_keep_recent ({}) must leave room under history_prune_threshold ({})",
                self.history_keep_recent,
                self.history_prune_threshold
            );
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_base_secs)
    }

    pub fn rate_limit_retry_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_retry_delay_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rate_window_secs, 60);
        assert_eq!(config.max_concurrent_per_owner, 2);
        assert!(config.rate_limit_retry_delay_secs > config.rate_window_secs);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "token_budget_per_window: 50000\nrequire_plan_approval: true\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.token_budget_per_window, 50_000);
        assert!(config.require_plan_approval);
        assert_eq!(config.max_tool_iterations, 12);
        assert_eq!(config.still_working_thresholds_secs, vec![300, 600]);
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_per_owner: 4").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent_per_owner, 4);
    }

    #[test]
    fn rejects_retry_delay_inside_window() {
        let config = EngineConfig {
            rate_limit_retry_delay_secs: 30,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = EngineConfig {
            max_concurrent_per_owner: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
