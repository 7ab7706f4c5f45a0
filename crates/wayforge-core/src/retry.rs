//! Retry policy selection and delay scheduling. A stateless
//! struct of associated functions -- there's nothing to own between calls.

use std::time::Duration;

use rand::Rng;
use wayforge_types::WorkflowError;
use wayforge_types::workflow::{Jitter, RetryConfig};

pub struct RetryHandler;

impl RetryHandler {
    /// Select the first retry config (in declaration order) whose
    /// `error_equals` matches the first error a step raised. Once selected,
    /// the same policy governs every later retry of that step invocation
    /// even if a later attempt raises a differently-kinded error.
    pub fn select_policy<'a>(
        configs: &'a [RetryConfig],
        first_error: &WorkflowError,
    ) -> Option<&'a RetryConfig> {
        configs.iter().find(|c| first_error.matches(&c.error_equals))
    }

    /// Whether attempt `n` (1-indexed, the first retry after the initial
    /// failure) should be retried under `config`: `n` must not exceed
    /// `max_retries`, and the error that just occurred must still match the
    /// selected policy.
    pub fn should_retry(config: &RetryConfig, attempt: u32, error: &WorkflowError) -> bool {
        attempt <= config.max_retries && error.matches(&config.error_equals)
    }

    /// `delay_n = min(max_delay, base_delay * backoff_rate^(n-1))`, then
    /// jitter applied per `config.jitter`. `FULL` jitter draws uniformly
    /// from `[0, delay_n]`; `NONE` uses the scheduled delay exactly.
    pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
        let scheduled = config.base_delay().as_secs_f64()
            * config.backoff_rate.powi(attempt.saturating_sub(1) as i32);
        let capped = scheduled.min(config.max_delay().as_secs_f64()).max(0.0);
        let delay = match config.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                if capped <= 0.0 {
                    0.0
                } else {
                    rand::thread_rng().gen_range(0.0..=capped)
                }
            }
        };
        Duration::from_secs_f64(delay)
    }
}
