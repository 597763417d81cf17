//! Bounded waiting for transport operations
//!
//! Spin-waits on flags and completion queues never block forever: every wait
//! draws from a [`PollBudget`] created by a [`RetryPolicy`]. When the budget
//! runs out the caller converts [`BudgetExhausted`] into
//! [`AppError::TransportTimeout`](super::AppError::TransportTimeout).
//!
//! Connection setup uses [`BackoffPolicy`] instead, with exponentially growing
//! delays between attempts.

use std::time::{Duration, Instant};

/// Default wall-clock deadline for a single wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Limits applied to a single spin-wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of unsuccessful polls, `None` for no limit
    pub max_polls: Option<u64>,
    /// Maximum wall-clock time for the wait, `None` for no limit
    pub deadline: Option<Duration>,
    /// Yield to the runtime after this many polls (at least 1)
    pub yield_every: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_polls: None,
            deadline: Some(DEFAULT_POLL_TIMEOUT),
            yield_every: 1,
        }
    }
}

impl RetryPolicy {
    /// Policy bounded by both a poll count and a deadline
    pub fn bounded(max_polls: Option<u64>, deadline: Duration) -> Self {
        Self {
            max_polls,
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    /// Policy that waits forever
    pub fn unbounded() -> Self {
        Self {
            max_polls: None,
            deadline: None,
            yield_every: 1,
        }
    }

    /// Policy from the `--poll-timeout-ms` / `--max-polls` settings, where zero polls means unlimited
    pub fn from_settings(poll_timeout_ms: u64, max_polls: u64) -> Self {
        Self::bounded(
            (max_polls > 0).then_some(max_polls),
            Duration::from_millis(poll_timeout_ms),
        )
    }

    /// Begin a new wait under this policy
    pub fn start(&self) -> PollBudget {
        PollBudget {
            policy: *self,
            started: Instant::now(),
            polls: 0,
        }
    }
}

/// A wait ran past its policy limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExhausted {
    /// Unsuccessful polls made before giving up
    pub polls: u64,
    /// Time spent waiting
    pub waited: Duration,
}

impl std::fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gave up after {} polls in {}ms", self.polls, self.waited.as_millis())
    }
}

impl std::error::Error for BudgetExhausted {}

/// Running state of one spin-wait
#[derive(Debug)]
pub struct PollBudget {
    policy: RetryPolicy,
    started: Instant,
    polls: u64,
}

impl PollBudget {
    /// Number of unsuccessful polls so far
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Time since the wait began
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record an unsuccessful poll, failing if the policy is exhausted
    pub fn charge(&mut self) -> Result<(), BudgetExhausted> {
        self.polls += 1;

        let over_polls = self.policy.max_polls.is_some_and(|max| self.polls >= max);
        let over_time = self.policy.deadline.is_some_and(|deadline| self.elapsed() >= deadline);

        if over_polls || over_time {
            return Err(BudgetExhausted {
                polls: self.polls,
                waited: self.elapsed(),
            });
        }
        Ok(())
    }

    /// Record an unsuccessful poll and give other tasks a chance to run
    pub async fn wait(&mut self) -> Result<(), BudgetExhausted> {
        self.charge()?;
        if self.polls % u64::from(self.policy.yield_every.max(1)) == 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Retry schedule for connection setup
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum number of attempts
    pub max_attempts: usize,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Run `operation` until it succeeds or attempts run out, returning the last error
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts => return Err(error),
                Err(_) => {
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
