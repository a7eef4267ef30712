use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff, handed to each call site that needs it.
///
/// Both limits apply: an operation is attempted at most `max_attempts` times and
/// never past `ceiling` measured from the first attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub ceiling: Duration,
    /// Randomise each delay to somewhere in `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            ceiling: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Starts tracking one logical operation.
    pub fn begin(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempt: 1,
            next_delay: self.initial_backoff,
            deadline: Instant::now() + self.ceiling,
        }
    }

    /// Runs `op` until it succeeds, the policy is exhausted, `cancel` fires
    /// during a backoff or an error fails `retryable`. Each attempt is bounded by
    /// the overall deadline.
    pub async fn run<T, E, R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        retryable: R,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        R: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut state = self.begin();
        loop {
            let attempt = state.attempt();
            let last = match timeout_at(state.deadline(), op(attempt)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => return Err(RetryError::DeadlineExceeded { attempts: attempt }),
            };
            if !retryable(&last) {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    source: last,
                });
            }
            tracing::debug!(attempt, error = %last, "attempt failed");
            if !state.wait(cancel).await {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: last,
                });
            }
        }
    }
}

/// Progress of one retried operation. Dropped on success or final failure.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    next_delay: Duration,
    deadline: Instant,
}

impl RetryState {
    /// 1-based number of the attempt about to run (or just run).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Delay before the next attempt, or `None` once attempts or time are used up.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = if self.policy.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            self.next_delay.mul_f64(factor)
        } else {
            self.next_delay
        };
        if Instant::now() + delay >= self.deadline {
            return None;
        }
        self.attempt += 1;
        self.next_delay = self
            .next_delay
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_backoff);
        Some(delay)
    }

    /// Sleeps for the next backoff. Returns false when the operation should be
    /// abandoned, either because the policy is exhausted or `cancel` fired.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.next_backoff() else {
            return false;
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("retry deadline reached during attempt {attempts}")]
    DeadlineExceeded { attempts: u32 },

    #[error("permanent failure on attempt {attempts}: {source}")]
    Permanent {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts }
            | RetryError::Permanent { attempts, .. } => *attempts,
        }
    }
}
