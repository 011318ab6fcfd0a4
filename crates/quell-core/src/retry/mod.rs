//! Bounded retry with linear backoff.
//!
//! Retry control flow in this crate is explicit: every attempt reports an
//! [`Outcome`] and the [`RetryPolicy::run`] combinator decides whether to
//! back off and go again. Nothing drives a loop by catching an error type,
//! and the policy can be tested in isolation from any I/O by injecting the
//! sleep function.
//!
//! Contended outcomes (a lost conditional-write race) count against
//! `max_attempts`; transient store failures have their own smaller budget
//! and are promoted to fatal when it runs out. Backoff is linear in the
//! attempt count — `attempt * base_delay` — and is applied only to
//! retryable outcomes, never to fatal ones.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of one attempt inside a retry loop.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The attempt succeeded.
    Done(T),
    /// The attempt lost a conditional-write race; re-derive state and retry.
    Contended,
    /// The backing store was transiently unavailable.
    Transient,
    /// Unrecoverable failure; surfaced immediately without backoff.
    Fatal(E),
}

/// Terminal result of an exhausted or aborted retry loop.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt lost its race.
    #[error("contention not resolved after {attempts} attempts")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The transient-failure budget ran out.
    #[error("store unavailable after {attempts} transient failures")]
    TransientExhausted {
        /// Number of transient failures observed.
        attempts: u32,
    },

    /// An attempt failed fatally.
    #[error(transparent)]
    Fatal(E),
}

/// Declarative bounds for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of contended attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay; attempt `n` sleeps `n * base_delay`.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Maximum number of transient store failures before promotion to
    /// fatal, counted independently of contention.
    #[serde(default = "default_transient_max_attempts")]
    pub transient_max_attempts: u32,
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(25)
}

const fn default_transient_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            transient_max_attempts: default_transient_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Calculates the backoff delay before re-running attempt `attempt`
    /// (1-based): linear in the number of attempts already made.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Runs `op` until it reports [`Outcome::Done`] or a bound is hit,
    /// sleeping between retryable attempts.
    ///
    /// # Errors
    ///
    /// Returns `RetryError::Exhausted` when `max_attempts` contended
    /// attempts have been made, `RetryError::TransientExhausted` when the
    /// transient budget runs out, and `RetryError::Fatal` as soon as an
    /// attempt reports a fatal error.
    pub fn run<T, E>(&self, op: impl FnMut(u32) -> Outcome<T, E>) -> Result<T, RetryError<E>> {
        self.run_with_sleep(op, std::thread::sleep)
    }

    /// [`RetryPolicy::run`] with an injected sleep function, for tests.
    ///
    /// # Errors
    ///
    /// Same as [`RetryPolicy::run`].
    pub fn run_with_sleep<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Outcome<T, E>,
        sleep: impl Fn(Duration),
    ) -> Result<T, RetryError<E>> {
        let mut contended = 0u32;
        let mut transient = 0u32;

        loop {
            let attempt = contended + transient + 1;
            match op(attempt) {
                Outcome::Done(value) => return Ok(value),
                Outcome::Fatal(err) => return Err(RetryError::Fatal(err)),
                Outcome::Contended => {
                    contended += 1;
                    if contended >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: contended,
                        });
                    }
                    sleep(self.delay_for_attempt(contended));
                }
                Outcome::Transient => {
                    transient += 1;
                    if transient >= self.transient_max_attempts {
                        return Err(RetryError::TransientExhausted {
                            attempts: transient,
                        });
                    }
                    sleep(self.delay_for_attempt(transient));
                }
            }
        }
    }
}
