use crate::config::RetryConfig;
use crate::CoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff schedule: `retries` extra attempts after the first,
/// waiting `initial`, `initial * multiplier`, ... between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retries: config.attempts,
            initial: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier.max(1),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or the retries are
    /// spent. Exhausted retries become `PermanentProvisioning`, so transient
    /// errors never reach the caller.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts() {
                        return Err(CoreError::PermanentProvisioning {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!("{what} attempt {attempt} failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
