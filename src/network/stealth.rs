//! Evasion throttle: randomized job order and per-probe jitter
//!
//! The throttle only ever changes *when* a probe is sent, never how the result is
//! classified. Each worker owns its delay decision; there is no shared clock.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(50);

/// Evasion settings shared (by copy) with every worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvasionThrottle {
    enabled: bool,
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for EvasionThrottle {
    fn default() -> Self {
        Self::disabled()
    }
}

impl EvasionThrottle {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn enabled(min_delay: Duration, max_delay: Duration) -> Self {
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };
        Self {
            enabled: true,
            min_delay,
            max_delay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }

    /// Pick the next jittered delay, zero when evasion is off
    pub fn next_delay(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Sleep for a randomized interval before a probe
    pub async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Randomize job order in place when evasion is on
    pub fn arrange<T>(&self, items: &mut [T]) {
        if self.enabled {
            items.shuffle(&mut rand::thread_rng());
        }
    }
}
