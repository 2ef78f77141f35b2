//! Retry executor: re-attempts work that failed on transient lock contention.
//!
//! Callers own the idempotency obligation. Only hand the executor work that is
//! safe to replay: a read, an [`Operation`](crate::Operation) whose effect is
//! idempotent, or a whole transaction scope (which rolls back before the next
//! attempt).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryOptions;
use crate::error::CoordinatorError;
use crate::operation::RetryClassifier;

/// Compute the backoff before the next attempt.
///
/// `attempt` is the 1-based number of the attempt that just failed and
/// `jitter_sample` is drawn from `[-1.0, 1.0]`.
#[must_use]
pub fn backoff_delay(options: &RetryOptions, attempt: u32, jitter_sample: f64) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base_ms = options.base_delay.as_secs_f64() * 1000.0;
    let cap_ms = options.max_delay.as_secs_f64() * 1000.0;
    let scaled_ms = (base_ms * options.multiplier.powi(exponent)).min(cap_ms);
    let factor = 1.0 + options.jitter * jitter_sample.clamp(-1.0, 1.0);
    let delay_ms = (scaled_ms * factor).max(0.0);
    if delay_ms.is_finite() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos = (delay_ms * 1_000_000.0).round() as u64;
        Duration::from_nanos(nanos)
    } else {
        options.max_delay
    }
}

/// Ephemeral state of one retry loop.
#[derive(Debug)]
pub struct RetryState<'a> {
    options: &'a RetryOptions,
    label: &'static str,
    attempt: u32,
}

impl<'a> RetryState<'a> {
    #[must_use]
    pub fn new(options: &'a RetryOptions, label: &'static str) -> Self {
        Self {
            options,
            label,
            attempt: 1,
        }
    }

    /// 1-based number of the attempt currently in flight.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decide what to do with a failed attempt.
    ///
    /// Returns `Ok(())` after sleeping out the backoff when the loop should go
    /// again. Otherwise returns the error to propagate: fatal errors as soon as
    /// they occur, the last transient error once the attempt budget is spent.
    ///
    /// # Errors
    /// Returns the classified error, or `CoordinatorError::Cancelled` if the token fires
    /// during the backoff sleep.
    pub async fn handle_error(
        &mut self,
        err: CoordinatorError,
        classifier: RetryClassifier,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), CoordinatorError> {
        if !classifier(&err) {
            return Err(err);
        }
        if self.attempt >= self.options.max_attempts {
            warn!(
                label = self.label,
                attempts = self.attempt,
                error = %err,
                "giving up after transient failures"
            );
            return Err(err);
        }

        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = backoff_delay(self.options, self.attempt, sample);
        debug!(
            label = self.label,
            attempt = self.attempt,
            max_attempts = self.options.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "transient failure, backing off"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => return Err(CoordinatorError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        self.attempt += 1;
        Ok(())
    }
}

/// Drives operations through [`RetryState`] using a fixed policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    options: RetryOptions,
}

impl RetryExecutor {
    /// # Errors
    /// Returns `CoordinatorError::ConfigError` if the options fail validation.
    pub fn new(options: RetryOptions) -> Result<Self, CoordinatorError> {
        options.validate()?;
        Ok(Self { options })
    }

    #[must_use]
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    #[must_use]
    pub fn state(&self, label: &'static str) -> RetryState<'_> {
        RetryState::new(&self.options, label)
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    /// Returns the first fatal error, the last transient error after exhaustion,
    /// or `CoordinatorError::Cancelled`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &'static str,
        classifier: RetryClassifier,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CoordinatorError>>,
    {
        let mut state = self.state(label);
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(CoordinatorError::Cancelled);
            }
            match op(state.attempt()).await {
                Ok(value) => return Ok(value),
                Err(err) => state.handle_error(err, classifier, cancel).await?,
            }
        }
    }
}
