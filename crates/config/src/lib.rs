//! Configuration loading, validation, and management for TaskPilot.
//!
//! Loads configuration from `~/.taskpilot/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.taskpilot/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Pacing, queueing and batching in front of the reasoning service
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Repetition detection for tool invocations
    #[serde(default)]
    pub guard: GuardConfig,

    /// Tool execution limits
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Per-item retry and escalation policy
    #[serde(default)]
    pub items: ItemConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Submissions beyond this many waiting requests fail with `QueueFull`
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Requests executing at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Starting spacing between admissions
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the distance to the floor removed after each success
    #[serde(default = "default_decay_fraction")]
    pub decay_fraction: f64,

    /// Delay multiplier applied after each failure
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Maximum callers sharing one batched execution
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Queue-wait deadline for submissions that don't set one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Upper bound on a single dispatched execution
    #[serde(default = "default_work_timeout_ms")]
    pub work_timeout_ms: u64,

    /// Re-queues allowed for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_queue_size() -> usize {
    50
}
fn default_max_concurrent() -> usize {
    1
}
fn default_base_delay_ms() -> u64 {
    800
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_decay_fraction() -> f64 {
    0.1
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_batch_size() -> usize {
    3
}
fn default_batch_window_ms() -> u64 {
    150
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_work_timeout_ms() -> u64 {
    120_000
}
fn default_max_retries() -> u32 {
    2
}

impl AdmissionConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn work_timeout(&self) -> Duration {
        Duration::from_millis(self.work_timeout_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrent: default_max_concurrent(),
            base_delay_ms: default_base_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            decay_fraction: default_decay_fraction(),
            backoff_factor: default_backoff_factor(),
            batch_size: default_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            default_timeout_ms: default_timeout_ms(),
            work_timeout_ms: default_work_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Identical calls in a row allowed before denial
    #[serde(default = "default_consecutive_threshold")]
    pub consecutive_threshold: u32,

    /// Calls to one (back end, operation) pair before approval is required
    #[serde(default = "default_cumulative_ceiling")]
    pub cumulative_ceiling: u32,

    /// Findings retained in the in-memory log
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_true() -> bool {
    true
}
fn default_consecutive_threshold() -> u32 {
    3
}
fn default_cumulative_ceiling() -> u32 {
    10
}
fn default_max_log_entries() -> usize {
    5_000
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consecutive_threshold: default_consecutive_threshold(),
            cumulative_ceiling: default_cumulative_ceiling(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent invocations within one item's list
    #[serde(default = "default_per_item_parallelism")]
    pub per_item_parallelism: usize,

    /// Concurrent invocations across all items
    #[serde(default = "default_global_parallelism")]
    pub global_parallelism: usize,

    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,

    /// Extra attempts for side-effect-free operations on transient failures
    #[serde(default = "default_side_effect_free_retries")]
    pub side_effect_free_retries: u32,

    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

fn default_per_item_parallelism() -> usize {
    3
}
fn default_global_parallelism() -> usize {
    8
}
fn default_invocation_timeout_ms() -> u64 {
    60_000
}
fn default_side_effect_free_retries() -> u32 {
    1
}
fn default_approval_timeout_ms() -> u64 {
    30_000
}

impl ExecutorConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            per_item_parallelism: default_per_item_parallelism(),
            global_parallelism: default_global_parallelism(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            side_effect_free_retries: default_side_effect_free_retries(),
            approval_timeout_ms: default_approval_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    /// Failed verifications per plan before escalating to a replan
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Larger tool plans are treated as a split request
    #[serde(default = "default_max_invocations")]
    pub max_invocations: usize,

    #[serde(default = "default_max_parallel_items")]
    pub max_parallel_items: usize,

    /// Resubmissions after `QueueFull` or `Timeout` from admission
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,

    #[serde(default = "default_call_backoff_ms")]
    pub call_backoff_ms: u64,

    #[serde(default)]
    pub priorities: StagePriorities,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_max_replans() -> u32 {
    2
}
fn default_max_invocations() -> usize {
    5
}
fn default_max_parallel_items() -> usize {
    4
}
fn default_call_retries() -> u32 {
    3
}
fn default_call_backoff_ms() -> u64 {
    500
}

impl ItemConfig {
    pub fn call_backoff(&self) -> Duration {
        Duration::from_millis(self.call_backoff_ms)
    }
}

impl Default for ItemConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_replans: default_max_replans(),
            max_invocations: default_max_invocations(),
            max_parallel_items: default_max_parallel_items(),
            call_retries: default_call_retries(),
            call_backoff_ms: default_call_backoff_ms(),
            priorities: StagePriorities::default(),
        }
    }
}

/// Admission priority per reasoning call. Higher is serviced first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePriorities {
    #[serde(default)]
    pub planning: i32,

    #[serde(default)]
    pub tool_planning: i32,

    #[serde(default = "default_adjustment_priority")]
    pub adjustment: i32,

    #[serde(default = "default_urgent_priority")]
    pub verification: i32,

    #[serde(default = "default_urgent_priority")]
    pub replanning: i32,
}

fn default_adjustment_priority() -> i32 {
    5
}
fn default_urgent_priority() -> i32 {
    10
}

impl Default for StagePriorities {
    fn default() -> Self {
        Self {
            planning: 0,
            tool_planning: 0,
            adjustment: default_adjustment_priority(),
            verification: default_urgent_priority(),
            replanning: default_urgent_priority(),
        }
    }
}

impl FlowConfig {
    /// Load configuration from the default location with env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `TASKPILOT_*` overrides from the given lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparseable config override");
                    None
                }
            }
        }

        if let Some(v) = parse("TASKPILOT_MAX_CONCURRENT", lookup("TASKPILOT_MAX_CONCURRENT")) {
            self.admission.max_concurrent = v;
        }
        if let Some(v) = parse("TASKPILOT_BASE_DELAY_MS", lookup("TASKPILOT_BASE_DELAY_MS")) {
            self.admission.base_delay_ms = v;
        }
        if let Some(v) = parse("TASKPILOT_MAX_QUEUE_SIZE", lookup("TASKPILOT_MAX_QUEUE_SIZE")) {
            self.admission.max_queue_size = v;
        }
        if let Some(v) = parse("TASKPILOT_MAX_ATTEMPTS", lookup("TASKPILOT_MAX_ATTEMPTS")) {
            self.items.max_attempts = v;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".taskpilot")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.admission;
        if a.max_queue_size == 0 || a.max_concurrent == 0 || a.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "admission.max_queue_size, max_concurrent and batch_size must be > 0".into(),
            ));
        }
        if a.min_delay_ms > a.base_delay_ms || a.base_delay_ms > a.max_delay_ms {
            return Err(ConfigError::ValidationError(
                "admission delays must satisfy min_delay_ms <= base_delay_ms <= max_delay_ms"
                    .into(),
            ));
        }
        if !(a.decay_fraction > 0.0 && a.decay_fraction < 1.0) {
            return Err(ConfigError::ValidationError(
                "admission.decay_fraction must be between 0.0 and 1.0 (exclusive)".into(),
            ));
        }
        if a.backoff_factor <= 1.0 {
            return Err(ConfigError::ValidationError(
                "admission.backoff_factor must be > 1.0".into(),
            ));
        }

        let g = &self.guard;
        if g.consecutive_threshold == 0 || g.cumulative_ceiling == 0 {
            return Err(ConfigError::ValidationError(
                "guard.consecutive_threshold and cumulative_ceiling must be > 0".into(),
            ));
        }

        let e = &self.executor;
        if e.per_item_parallelism == 0 || e.global_parallelism == 0 {
            return Err(ConfigError::ValidationError(
                "executor parallelism limits must be > 0".into(),
            ));
        }

        let i = &self.items;
        if i.max_attempts == 0 || i.max_invocations == 0 || i.max_parallel_items == 0 {
            return Err(ConfigError::ValidationError(
                "items.max_attempts, max_invocations and max_parallel_items must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
