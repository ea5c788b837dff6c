//! SSH readiness probing.
//!
//! A started guest is only considered booted once it accepts SSH. The probe
//! retries [`SshPool::connect`] with a linearly growing, capped delay.

use super::pool::SshPool;
use crate::error::{CoreError, Result};
use std::time::Duration;

/// Default number of attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default base delay between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// The delay multiplier stops growing after this many attempts.
const BACKOFF_CAP: u32 = 5;

/// Retry budget for [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// Delay after failed attempt `attempt` (1-based): `base * min(attempt, 5)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt.clamp(1, BACKOFF_CAP)
}

/// Wait until `host` accepts SSH.
///
/// Returns after the first successful connect, which also leaves a ready
/// connection in `pool`. No delay follows the last attempt.
///
/// # Errors
///
/// [`CoreError::SshProbeFailed`] once `max_retries` attempts have failed.
pub async fn probe(pool: &SshPool, host: &str, config: ProbeConfig) -> Result<()> {
    let attempts = config.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match pool.connect(host).await {
            Ok(_) => {
                tracing::info!(host, attempt, "Guest SSH ready");
                return Ok(());
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt == attempts {
                    break;
                }
                let delay = backoff_delay(config.base_delay, attempt);
                tracing::debug!(
                    host,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "SSH not ready, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    tracing::warn!(host, attempts, error = %last_error, "Guest never accepted SSH");
    Err(CoreError::SshProbeFailed {
        host: host.to_string(),
        attempts,
        last_error,
    })
}
