use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread::sleep;
use std::time::Duration;

use crate::consts::DEFAULT_RETRIES;

/// Bounded retry with exponential backoff. `retries` counts the attempts made
/// after the first one, so an operation runs at most `retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub retries: u32,
    #[serde(rename = "initial_delay_ms", with = "crate::util::duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::util::duration_ms")]
    pub max_delay: Duration,
    /// Add up to 50% random jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately; used by tests.
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Runs `operation` until it succeeds or the attempts are used up.
    ///
    /// `on_retry(attempt, delay, err)` is called after every failed attempt
    /// that will be followed by another one. The last error is returned when
    /// every attempt failed.
    pub fn run<T, F, L>(&self, mut operation: F, mut on_retry: L) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        L: FnMut(u32, Duration, &anyhow::Error),
    {
        let mut attempt = 0;
        let mut backoff = self.initial_delay;
        loop {
            attempt += 1;
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt > self.retries {
                        return Err(err);
                    }
                    let delay = self.with_jitter(backoff);
                    on_retry(attempt, delay, &err);
                    if !delay.is_zero() {
                        sleep(delay);
                    }
                    backoff = next_backoff(backoff, self.max_delay);
                }
            }
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(extra)
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}
