//! Duplicate and conflict detection over in-flight mitigations.
//!
//! Before a handler inserts a new request it scans the device's head
//! records — the not-yet-superseded rows whose workflows still hold a claim
//! on their name and definition — and rejects the request if another
//! mitigation already claims the same name, or if a template-specific
//! [`ConflictComparator`] judges two definitions to be semantically the
//! same mitigation.
//!
//! Comparators are registered per template in a [`ComparatorRegistry`]
//! built at startup and passed by reference; there is no process-wide
//! registry. Cross-template rows are never compared. For same-template
//! rows, an equal definition fingerprint is the fast pre-check: with a
//! comparator registered it is asked to confirm, without one the
//! fingerprint match itself is the duplicate. Differing fingerprints still
//! consult a registered comparator, since semantically conflicting
//! definitions need not hash equal.
//!
//! The scan pages through the head index until the store reports no
//! continuation, and it carries an incremental floor ([`ConflictCursor`])
//! so the owning handler's retries only re-scan workflow ids at or above
//! the maximum seen on the previous pass.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::record::{MitigationRequest, RequestRecord};
use crate::store::{LedgerStore, StoreError};

/// Errors raised by a conflict scan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConflictError {
    /// Another active mitigation already claims this name.
    #[error("mitigation name {mitigation_name} already in use by workflow {workflow_id}")]
    DuplicateName {
        /// The contested name.
        mitigation_name: String,
        /// The workflow holding the name.
        workflow_id: u64,
    },

    /// Another active mitigation carries a semantically equivalent
    /// definition.
    #[error(
        "definition of {mitigation_name} duplicates active mitigation \
         {existing_name} (workflow {workflow_id})"
    )]
    DuplicateDefinition {
        /// The candidate's name.
        mitigation_name: String,
        /// The conflicting mitigation's name.
        existing_name: String,
        /// The workflow holding the conflicting definition.
        workflow_id: u64,
    },

    /// Storage failure during the head scan.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Template-specific definition conflict judgement.
///
/// Implementations understand one template's definition payload and decide
/// whether two definitions would fight over the same traffic.
pub trait ConflictComparator: Send + Sync {
    /// Returns true if `candidate` semantically duplicates `existing`.
    fn is_conflicting(&self, existing: &RequestRecord, candidate: &MitigationRequest) -> bool;
}

/// Startup-built registry of comparators keyed by template name.
#[derive(Default)]
pub struct ComparatorRegistry {
    by_template: HashMap<String, Arc<dyn ConflictComparator>>,
}

impl ComparatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a comparator for a template, replacing any previous one.
    pub fn register(
        &mut self,
        template: impl Into<String>,
        comparator: Arc<dyn ConflictComparator>,
    ) {
        self.by_template.insert(template.into(), comparator);
    }

    /// Looks up the comparator for a template.
    #[must_use]
    pub fn comparator_for(&self, template: &str) -> Option<&Arc<dyn ConflictComparator>> {
        self.by_template.get(template)
    }
}

/// Incremental rescan state for one submission's conflict checks.
///
/// Rows below the floor were already cleared on an earlier attempt of the
/// same submission; only newer rows can introduce new conflicts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictCursor {
    min_workflow_id: u64,
}

impl ConflictCursor {
    /// Creates a cursor that scans the full head index.
    #[must_use]
    pub const fn new() -> Self {
        Self { min_workflow_id: 0 }
    }
}

/// Pages through a device's active heads and flags duplicates.
pub struct ConflictDetector<'a> {
    store: &'a dyn LedgerStore,
    registry: &'a ComparatorRegistry,
    page_size: usize,
}

impl<'a> ConflictDetector<'a> {
    /// Creates a detector over `store` using `registry` for definition
    /// comparisons.
    #[must_use]
    pub const fn new(
        store: &'a dyn LedgerStore,
        registry: &'a ComparatorRegistry,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            registry,
            page_size,
        }
    }

    /// Scans the device's head records for conflicts with `candidate`.
    ///
    /// `is_update` marks edit/delete/rollback submissions, for which the
    /// candidate's own chain (matched by name) is skipped instead of being
    /// reported as a duplicate.
    ///
    /// On success the cursor's floor advances past the maximum workflow id
    /// seen, bounding the rescan on the owning handler's next attempt.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::DuplicateName` or
    /// `ConflictError::DuplicateDefinition` for conflicts, both client
    /// errors, or a store error from the scan.
    pub fn check(
        &self,
        candidate: &MitigationRequest,
        is_update: bool,
        cursor: &mut ConflictCursor,
    ) -> Result<(), ConflictError> {
        let fingerprint = candidate.definition.fingerprint();
        let mut max_seen = cursor.min_workflow_id;
        let mut page_token = None;
        let mut scanned = 0usize;

        loop {
            let page = self.store.active_heads(
                &candidate.device_key,
                cursor.min_workflow_id,
                page_token,
                self.page_size,
            )?;

            for row in &page.rows {
                max_seen = max_seen.max(row.workflow_id);
                scanned += 1;

                if row.mitigation_name == candidate.mitigation_name {
                    if is_update {
                        continue;
                    }
                    return Err(ConflictError::DuplicateName {
                        mitigation_name: candidate.mitigation_name.clone(),
                        workflow_id: row.workflow_id,
                    });
                }

                if row.mitigation_template != candidate.mitigation_template {
                    continue;
                }

                // A registered comparator sees every same-template head,
                // not only fingerprint matches: semantic conflicts need
                // not hash equal. Without one, an equal fingerprint is
                // itself the duplicate.
                let fingerprints_match = row.definition_fingerprint == fingerprint;
                let conflicting = match self
                    .registry
                    .comparator_for(&candidate.mitigation_template)
                {
                    Some(comparator) => comparator.is_conflicting(row, candidate),
                    None => fingerprints_match,
                };
                if conflicting {
                    return Err(ConflictError::DuplicateDefinition {
                        mitigation_name: candidate.mitigation_name.clone(),
                        existing_name: row.mitigation_name.clone(),
                        workflow_id: row.workflow_id,
                    });
                }
            }

            match page.next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            device_key = %candidate.device_key,
            mitigation_name = %candidate.mitigation_name,
            scanned,
            "conflict scan clear"
        );
        // Rows at or below max_seen are cleared; only newer rows need a
        // look on the next attempt.
        cursor.min_workflow_id = max_seen;
        Ok(())
    }
}
