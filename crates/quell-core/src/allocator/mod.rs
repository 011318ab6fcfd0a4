//! Workflow-id allocation strategies.
//!
//! Two interchangeable strategies produce the next workflow id for a
//! (device, scope) pair under concurrent writers:
//!
//! - [`ScanAllocator`]: optimistic scan-then-increment. Probe the highest
//!   recorded id, propose the successor, and let the ledger's key-absent
//!   insert precondition arbitrate the race. Losers advance an incremental
//!   rescan floor ([`ScanCursor`]) so retries never re-read the full
//!   history. Used by the request handlers.
//! - [`LeaseAllocator`]: a pessimistic lease emulated over the counter
//!   table's compare-and-swap, with stale-lock recovery via a fenced forced
//!   takeover.
//!
//! Neither strategy guesses: a candidate outside the scope's configured id
//! range is a fatal [`AllocatorError::IdSpaceExhausted`], signalling id
//! exhaustion or misconfiguration rather than something to retry around.

mod lease;

#[cfg(test)]
mod tests;

use thiserror::Error;
use tracing::debug;

use crate::config::ScopeIdRange;
use crate::store::{LedgerStore, StoreError};

pub use lease::{LeaseAllocError, LeaseAllocator};

/// Errors from the scan-then-increment allocator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocatorError {
    /// The next candidate id left the scope's configured range.
    #[error(
        "workflow id {candidate} outside configured range \
         [{min_workflow_id}, {max_workflow_id}]"
    )]
    IdSpaceExhausted {
        /// The out-of-range candidate.
        candidate: u64,
        /// Lower bound of the scope's range.
        min_workflow_id: u64,
        /// Upper bound of the scope's range.
        max_workflow_id: u64,
    },

    /// Storage failure during the max-id probe.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Incremental rescan state carried across the attempts of one submission.
///
/// After a lost insert race the losing candidate id provably exists in the
/// table, so subsequent max-id probes only need to look at ids at or above
/// it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanCursor {
    floor: Option<u64>,
}

impl ScanCursor {
    /// Creates a cursor with no prior knowledge (full scan on first probe).
    #[must_use]
    pub const fn new() -> Self {
        Self { floor: None }
    }

    /// Records that `candidate` was taken by a concurrent writer.
    pub fn note_lost_race(&mut self, candidate: u64) {
        self.floor = Some(candidate);
    }
}

/// Scan-then-increment workflow-id allocator.
pub struct ScanAllocator<'a> {
    store: &'a dyn LedgerStore,
    range: ScopeIdRange,
}

impl<'a> ScanAllocator<'a> {
    /// Creates an allocator over `store` for one scope's id range.
    #[must_use]
    pub const fn new(store: &'a dyn LedgerStore, range: ScopeIdRange) -> Self {
        Self { store, range }
    }

    /// Proposes the next workflow id for (device, scope): one past the
    /// highest id currently recorded, or the scope's minimum for an empty
    /// history. The probe honors the cursor's incremental floor and
    /// advances it to the observed maximum.
    ///
    /// The caller must attempt the conditioned insert itself and feed a
    /// lost race back through [`ScanCursor::note_lost_race`].
    ///
    /// # Errors
    ///
    /// Returns `AllocatorError::IdSpaceExhausted` when the candidate falls
    /// outside the scope's configured range, or a store error from the
    /// probe.
    pub fn next_candidate(
        &self,
        device_key: &str,
        scope: &str,
        cursor: &mut ScanCursor,
    ) -> Result<u64, AllocatorError> {
        let observed = self
            .store
            .max_workflow_id(device_key, scope, cursor.floor)?;

        // A floor is only ever set to an id known to exist, so an empty
        // probe result above the floor still leaves the floor as the
        // highest known id.
        let max_known = match (observed, cursor.floor) {
            (Some(m), Some(f)) => Some(m.max(f)),
            (Some(m), None) => Some(m),
            (None, floor) => floor,
        };
        cursor.floor = max_known;

        let candidate = max_known.map_or(self.range.min_workflow_id, |m| {
            (m + 1).max(self.range.min_workflow_id)
        });

        if !self.range.contains(candidate) {
            return Err(AllocatorError::IdSpaceExhausted {
                candidate,
                min_workflow_id: self.range.min_workflow_id,
                max_workflow_id: self.range.max_workflow_id,
            });
        }

        debug!(device_key, scope, candidate, "proposed workflow id");
        Ok(candidate)
    }
}
