//! Backoff strategies for the retry executor

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay schedule between retry attempts. Attempts are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every attempt
    Fixed { delay_ms: u64 },

    /// delay = base * attempt
    Linear,

    /// delay = base * 2^(attempt-1), optionally plus up to half again of random jitter
    Exponential {
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { jitter: true }
    }
}

impl BackoffStrategy {
    /// Delay in milliseconds after `attempt` failed.
    ///
    /// `Fixed` always waits its own `delay_ms`; the growing strategies are
    /// capped at `max_delay_ms`, jitter included.
    pub fn calculate_delay(&self, attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
        let mut rng = rand::thread_rng();
        self.calculate_delay_with_rng(attempt, base_delay_ms, max_delay_ms, &mut rng)
    }

    pub fn calculate_delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
        rng: &mut R,
    ) -> u64 {
        let attempt = attempt.max(1);
        let delay = match self {
            Self::Fixed { delay_ms } => return *delay_ms,
            Self::Linear => base_delay_ms.saturating_mul(u64::from(attempt)),
            Self::Exponential { .. } => {
                base_delay_ms.saturating_mul(2u64.saturating_pow(attempt - 1))
            }
        };
        let capped = delay.min(max_delay_ms);

        match self {
            Self::Exponential { jitter: true } if capped > 0 => {
                let spread = rng.gen_range(0..=capped / 2);
                capped.saturating_add(spread).min(max_delay_ms)
            }
            _ => capped,
        }
    }

    pub fn delay(&self, attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
        Duration::from_millis(self.calculate_delay(attempt, base_delay_ms, max_delay_ms))
    }
}
