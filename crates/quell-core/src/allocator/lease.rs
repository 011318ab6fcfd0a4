//! Lease-counter workflow-id allocator with forced takeover.
//!
//! The counter row emulates a distributed lock: `generate_workflow_id`
//! atomically increments the counter and flips it to `Locked`, and the
//! holder releases with `confirm_acquiring_workflow_id` once the allocated
//! id has been durably recorded elsewhere. A holder that dies between the
//! two calls leaves the row locked forever; the recovery path watches the
//! blocking row across its own retries and, only if the row never changed,
//! steals the lease with one forced write fenced on the exact observed
//! snapshot. A blocking row that keeps changing means the lock is live and
//! heavily contended, which is surfaced as a fatal error rather than fought
//! over.

use tracing::{debug, error, warn};

use thiserror::Error;

use crate::record::{CounterState, LockStatus};
use crate::retry::{Outcome, RetryError, RetryPolicy};
use crate::store::{LedgerStore, StoreError};

/// Errors from the lease-counter allocator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseAllocError {
    /// No counter row exists for this (device, scope); counters are
    /// provisioned out of band.
    #[error("no workflow counter for device {device_key} scope {scope}")]
    CounterMissing {
        /// The device without a counter.
        device_key: String,
        /// The scope without a counter.
        scope: String,
    },

    /// The lock stayed held by a live, changing holder across the whole
    /// retry budget.
    #[error(
        "workflow counter for device {device_key} scope {scope} still contended \
         after {attempts} attempts"
    )]
    Contention {
        /// The contended device.
        device_key: String,
        /// The contended scope.
        scope: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The lease was stolen between allocation and confirmation. This must
    /// not happen in correct operation and indicates a liveness bug
    /// upstream.
    #[error(
        "lease for device {device_key} scope {scope} stolen before workflow id \
         {workflow_id} was confirmed"
    )]
    LeaseStolen {
        /// The device whose lease was stolen.
        device_key: String,
        /// The scope whose lease was stolen.
        scope: String,
        /// The unconfirmed workflow id.
        workflow_id: u64,
    },

    /// Storage failure outside the precondition protocol.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lease-counter workflow-id allocator.
pub struct LeaseAllocator<'a> {
    store: &'a dyn LedgerStore,
    policy: RetryPolicy,
}

impl<'a> LeaseAllocator<'a> {
    /// Creates an allocator over `store` with the given retry bounds.
    #[must_use]
    pub const fn new(store: &'a dyn LedgerStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Allocates the next workflow id for (device, scope): increments the
    /// counter by one and locks it, precondition *unlocked*. Returns the
    /// new counter value, which the caller must release via
    /// [`Self::confirm_acquiring_workflow_id`].
    ///
    /// If every retry finds the same unchanged blocking row, the holder is
    /// presumed dead and the lease is stolen with one forced, snapshot-
    /// fenced write.
    ///
    /// # Errors
    ///
    /// Returns `CounterMissing` if the counter row was never provisioned,
    /// `Contention` if the lock is live but never acquirable within the
    /// retry budget, or a promoted store error.
    pub fn generate_workflow_id(
        &self,
        device_key: &str,
        scope: &str,
    ) -> Result<u64, LeaseAllocError> {
        let mut first_blocking: Option<CounterState> = None;
        let mut blocking_changed = false;

        let result = self.policy.run(|attempt| {
            let row = match self.store.get_counter(device_key, scope) {
                Ok(Some(row)) => row,
                Ok(None) => {
                    return Outcome::Fatal(LeaseAllocError::CounterMissing {
                        device_key: device_key.to_string(),
                        scope: scope.to_string(),
                    });
                }
                Err(e) if e.is_transient() => return Outcome::Transient,
                Err(e) => return Outcome::Fatal(LeaseAllocError::Store(e)),
            };

            let state = row.state();
            if state.lock_status == LockStatus::Unlocked {
                let acquired = CounterState {
                    counter: state.counter + 1,
                    lock_status: LockStatus::Locked,
                };
                match self.store.put_counter(device_key, scope, acquired, state) {
                    Ok(()) => return Outcome::Done(acquired.counter),
                    Err(StoreError::PreconditionFailed { .. }) => {
                        // Lost the race; fall through and observe whoever
                        // holds the row now.
                    }
                    Err(e) if e.is_transient() => return Outcome::Transient,
                    Err(e) => return Outcome::Fatal(LeaseAllocError::Store(e)),
                }
            }

            let blocking = match self.store.get_counter(device_key, scope) {
                Ok(Some(row)) => row.state(),
                Ok(None) => {
                    return Outcome::Fatal(LeaseAllocError::CounterMissing {
                        device_key: device_key.to_string(),
                        scope: scope.to_string(),
                    });
                }
                Err(e) if e.is_transient() => return Outcome::Transient,
                Err(e) => return Outcome::Fatal(LeaseAllocError::Store(e)),
            };

            match first_blocking {
                None => first_blocking = Some(blocking),
                Some(first) if first != blocking => blocking_changed = true,
                Some(_) => {}
            }
            debug!(
                device_key,
                scope,
                attempt,
                counter = blocking.counter,
                "workflow counter locked, will retry"
            );
            Outcome::Contended
        });

        match result {
            Ok(id) => Ok(id),
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::TransientExhausted { attempts }) => {
                Err(LeaseAllocError::Store(StoreError::Unavailable {
                    reason: format!("counter reads failed {attempts} times"),
                }))
            }
            Err(RetryError::Exhausted { attempts }) => {
                self.recover_abandoned_lock(device_key, scope, first_blocking, blocking_changed, attempts)
            }
        }
    }

    /// Forced-takeover path after an exhausted retry budget.
    fn recover_abandoned_lock(
        &self,
        device_key: &str,
        scope: &str,
        first_blocking: Option<CounterState>,
        blocking_changed: bool,
        attempts: u32,
    ) -> Result<u64, LeaseAllocError> {
        let contention = || LeaseAllocError::Contention {
            device_key: device_key.to_string(),
            scope: scope.to_string(),
            attempts,
        };

        // A row that changed between failures has a live holder; heavy
        // legitimate contention is more likely than a dead one.
        let Some(snapshot) = first_blocking else {
            return Err(contention());
        };
        if blocking_changed {
            return Err(contention());
        }

        let stolen = CounterState {
            counter: snapshot.counter + 1,
            lock_status: LockStatus::Locked,
        };
        match self.store.put_counter(device_key, scope, stolen, snapshot) {
            Ok(()) => {
                warn!(
                    device_key,
                    scope,
                    counter = stolen.counter,
                    "forced takeover of abandoned workflow counter lock"
                );
                Ok(stolen.counter)
            }
            // The row moved at the last moment: the holder was alive after
            // all. Do not force again.
            Err(StoreError::PreconditionFailed { .. }) => Err(contention()),
            Err(e) => Err(LeaseAllocError::Store(e)),
        }
    }

    /// Releases the lease after the allocated id has been durably used:
    /// unlocks the counter, precondition *locked with counter ==
    /// `workflow_id`*.
    ///
    /// # Errors
    ///
    /// Returns `LeaseStolen` if the precondition fails — the lease was
    /// taken out from under the caller, which indicates a liveness bug
    /// upstream and is logged loudly — or a promoted store error.
    pub fn confirm_acquiring_workflow_id(
        &self,
        device_key: &str,
        scope: &str,
        workflow_id: u64,
    ) -> Result<(), LeaseAllocError> {
        let expected = CounterState {
            counter: workflow_id,
            lock_status: LockStatus::Locked,
        };
        let released = CounterState {
            counter: workflow_id,
            lock_status: LockStatus::Unlocked,
        };

        let result = self.policy.run(|_attempt| {
            match self.store.put_counter(device_key, scope, released, expected) {
                Ok(()) => Outcome::Done(()),
                Err(StoreError::PreconditionFailed { .. }) => {
                    Outcome::Fatal(LeaseAllocError::LeaseStolen {
                        device_key: device_key.to_string(),
                        scope: scope.to_string(),
                        workflow_id,
                    })
                }
                Err(e) if e.is_transient() => Outcome::Transient,
                Err(e) => Outcome::Fatal(LeaseAllocError::Store(e)),
            }
        });

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Fatal(err)) => {
                if matches!(err, LeaseAllocError::LeaseStolen { .. }) {
                    error!(
                        device_key,
                        scope, workflow_id, "lease stolen before confirmation"
                    );
                }
                Err(err)
            }
            Err(RetryError::TransientExhausted { attempts }) => {
                Err(LeaseAllocError::Store(StoreError::Unavailable {
                    reason: format!("counter release failed {attempts} times"),
                }))
            }
            // Unreachable: the closure never reports Contended.
            Err(RetryError::Exhausted { attempts }) => Err(LeaseAllocError::Contention {
                device_key: device_key.to_string(),
                scope: scope.to_string(),
                attempts,
            }),
        }
    }
}
