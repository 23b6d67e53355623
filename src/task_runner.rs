/// Task Runner with Circuit Breaker Pattern
///
/// Drives a periodic background task (an outbox worker cycle) until shutdown. Failed
/// iterations are retried with exponential backoff; too many consecutive failures stop
/// the loop with an error so the supervisor can see the task died.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Circuit breaker configuration for background tasks
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures after which the task gives up
    pub max_consecutive_failures: u32,
    /// Delay before the first retry
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task '{task}' exceeded maximum consecutive failures ({failures}). Last error: {last_error}")]
    CircuitOpen {
        task: String,
        failures: u32,
        last_error: String,
    },
}

#[derive(Debug)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl CircuitBreakerState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    /// Register a failure and return how long to wait before the retry.
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let wait = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        wait
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `task_fn` every `interval` until `shutdown` turns true or its sender is dropped.
///
/// # Errors
/// Returns `TaskError::CircuitOpen` after `max_consecutive_failures` failures in a row.
pub async fn run_with_circuit_breaker<F, Fut>(
    task_name: &str,
    config: CircuitBreakerConfig,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) -> Result<(), TaskError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut state = CircuitBreakerState::new(config.initial_retry_delay);

    loop {
        if *shutdown.borrow() {
            info!("Task '{}' stopping", task_name);
            return Ok(());
        }

        let wait = match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                interval
            }
            Err(e) => {
                let wait = state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed (attempt {}/{}): {}",
                    task_name, state.consecutive_failures, config.max_consecutive_failures, e
                );

                if state.consecutive_failures >= config.max_consecutive_failures {
                    error!("Task '{}' circuit open, giving up", task_name);
                    return Err(TaskError::CircuitOpen {
                        task: task_name.to_string(),
                        failures: state.consecutive_failures,
                        last_error: e,
                    });
                }

                warn!("Task '{}' will retry in {:?}", task_name, wait);
                wait
            }
        };

        tokio::select! {
            _ = sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Task '{}' stopping", task_name);
                    return Ok(());
                }
            }
        }
    }
}
