//! Adaptive admission delay.
//!
//! Successes pull the delay toward the floor, failures push it toward the
//! ceiling. The value never leaves `[min, max]`.

use std::time::Duration;
use taskpilot_config::AdmissionConfig;

/// Queue depth beyond which successes decay faster.
const DEEP_QUEUE: usize = 10;
const VERY_DEEP_QUEUE: usize = 20;

#[derive(Debug, Clone)]
pub struct AdaptiveDelay {
    /// Whole milliseconds.
    current: u64,
    min: u64,
    max: u64,
    decay_fraction: f64,
    backoff_factor: f64,
}

impl AdaptiveDelay {
    pub fn new(config: &AdmissionConfig) -> Self {
        let min = config.min_delay_ms;
        let max = config.max_delay_ms.max(min);
        Self {
            current: config.base_delay_ms.clamp(min, max),
            min,
            max,
            decay_fraction: config.decay_fraction,
            backoff_factor: config.backoff_factor,
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current)
    }

    /// Retune after a successful request with `queue_depth` still waiting.
    pub fn on_success(&mut self, queue_depth: usize) -> Duration {
        let current = self.current as f64;
        let mut next = current - (current - self.min as f64) * self.decay_fraction;

        if queue_depth > VERY_DEEP_QUEUE {
            next *= 0.6;
        } else if queue_depth > DEEP_QUEUE {
            next *= 0.8;
        }

        self.set(next)
    }

    /// Retune after a failed request.
    pub fn on_failure(&mut self) -> Duration {
        self.set(self.current as f64 * self.backoff_factor)
    }

    fn set(&mut self, millis: f64) -> Duration {
        self.current = (millis.round().max(0.0) as u64).clamp(self.min, self.max);
        self.current()
    }
}
