//! Completion-side mutations of existing ledger rows.
//!
//! Request handlers only ever insert rows. The two mutations of existing
//! rows — recording a workflow's terminal status and marking a superseded
//! head — belong to the downstream workflow-completion collaborator, and
//! this handle is its entire write surface.

use std::sync::Arc;

use tracing::debug;

use crate::record::WorkflowStatus;
use crate::store::{LedgerStore, StoreError};

/// Write handle for the workflow-completion collaborator.
#[derive(Clone)]
pub struct CompletionHandle {
    store: Arc<dyn LedgerStore>,
}

impl CompletionHandle {
    /// Creates a handle over the shared ledger store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Records a workflow's status on its ledger row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if the row does not exist,
    /// or another store error.
    pub fn record_outcome(
        &self,
        device_key: &str,
        workflow_id: u64,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        self.store
            .set_workflow_status(device_key, workflow_id, status)?;
        debug!(device_key = %device_key, workflow_id, status = %status, "workflow outcome recorded");
        Ok(())
    }

    /// Marks `previous_workflow_id` as superseded by `new_workflow_id`,
    /// retiring the old head of its chain.
    ///
    /// The write is conditioned on the row still being a head, so two
    /// completions racing to supersede the same record resolve to exactly
    /// one winner.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if the row does not exist
    /// or was already superseded, or another store error.
    pub fn supersede(
        &self,
        device_key: &str,
        previous_workflow_id: u64,
        new_workflow_id: u64,
    ) -> Result<(), StoreError> {
        self.store
            .mark_superseded(device_key, previous_workflow_id, new_workflow_id)?;
        debug!(
            device_key = %device_key,
            previous_workflow_id,
            new_workflow_id,
            "head superseded"
        );
        Ok(())
    }
}
