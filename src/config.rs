use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use crate::channel::backoff::BackoffPolicy;

const DEFAULT_BASE_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_PRESENCE_STALENESS_MS: u64 = 60_000;

/// Engine configuration. Only the reconnect knobs affect correctness-adjacent
/// behavior; presence staleness is advisory.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay before the first reconnect attempt; doubles on each failure.
    pub base_reconnect_delay: Duration,
    /// Cap applied to the doubled delay.
    pub max_reconnect_delay: Duration,
    /// Attempts after which a channel parks in the terminal failed state.
    pub max_reconnect_attempts: u32,
    /// Horizon after which a remote participant is considered gone.
    pub presence_staleness: Duration,
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_reconnect_delay: env_ms(
                "DRIFTLINE_BASE_RECONNECT_DELAY_MS",
                defaults.base_reconnect_delay,
            ),
            max_reconnect_delay: env_ms(
                "DRIFTLINE_MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay,
            ),
            max_reconnect_attempts: env::var("DRIFTLINE_MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
            presence_staleness: env_ms(
                "DRIFTLINE_PRESENCE_STALENESS_MS",
                defaults.presence_staleness,
            ),
        }
    }

    /// The backoff policy derived from the reconnect knobs.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.base_reconnect_delay,
            self.max_reconnect_delay,
            self.max_reconnect_attempts,
        )
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay: Duration::from_millis(DEFAULT_BASE_RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(DEFAULT_MAX_RECONNECT_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            presence_staleness: Duration::from_millis(DEFAULT_PRESENCE_STALENESS_MS),
        }
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
