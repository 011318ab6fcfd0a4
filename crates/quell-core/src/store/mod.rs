//! Storage contract for the request ledger.
//!
//! [`LedgerStore`] is a thin, typed contract over a key-value table that
//! supports atomic conditional writes and indexed range queries. It is the
//! only primitive the coordination protocols rely on: there is no lock
//! manager and no multi-key transaction anywhere above this seam.
//!
//! Every conditional write reports a violated precondition as
//! [`StoreError::PreconditionFailed`], which is an *expected* outcome under
//! contention and drives the callers' retry loops. Transient backend
//! unavailability is reported separately as [`StoreError::Unavailable`];
//! callers must never conflate the two.
//!
//! The shipped backend is [`SqliteLedgerStore`]. Paginated queries return a
//! [`Page`]; consumers must loop until `next` is `None` — a single page is
//! never assumed to be complete.

mod sqlite;


use thiserror::Error;

use crate::record::{CounterRecord, CounterState, RequestRecord, WorkflowStatus};

pub use sqlite::SqliteLedgerStore;

/// Errors surfaced by ledger storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A conditional write found its precondition violated. Expected under
    /// write contention; drives retry loops and is never surfaced to
    /// request callers directly.
    #[error("precondition failed: {context}")]
    PreconditionFailed {
        /// What the write expected of the stored state.
        context: &'static str,
    },

    /// The backend is temporarily unavailable (lock contention, I/O
    /// pressure). Retryable a bounded number of times, then promoted to
    /// fatal by the retry policy.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Backend-reported reason.
        reason: String,
    },

    /// Non-transient database failure.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// A stored row failed to decode into its domain type.
    #[error("corrupt row for device {device_key} workflow {workflow_id}: {details}")]
    CorruptRow {
        /// Partition key of the corrupt row.
        device_key: String,
        /// Sort key of the corrupt row.
        workflow_id: u64,
        /// What failed to decode.
        details: String,
    },
}

impl StoreError {
    /// Returns true for the transient class of failures (retry with
    /// backoff); precondition failures are handled separately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Opaque continuation token for paginated queries.
///
/// Tokens are only meaningful to the store that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken(pub(crate) u64);

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Rows in this page, in ascending workflow-id order.
    pub rows: Vec<T>,
    /// Continuation token; `None` when the scan is complete.
    pub next: Option<PageToken>,
}

/// Typed contract over the conditional-write ledger table.
///
/// Implementations must guarantee that each write method is a single atomic
/// row insert or update; no partial state is ever observable.
pub trait LedgerStore: Send + Sync {
    /// Fetches a request record by primary key.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the lookup fails or the row is corrupt.
    fn get_request(
        &self,
        device_key: &str,
        workflow_id: u64,
    ) -> Result<Option<RequestRecord>, StoreError>;

    /// Inserts a request record with precondition *key must not exist*.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if a row with the same
    /// (device, workflow id) already exists — another writer won the race
    /// for this id.
    fn put_request(&self, record: &RequestRecord) -> Result<(), StoreError>;

    /// Returns the highest workflow id recorded for (device, scope), or
    /// `None` if no record exists. When `at_or_above` is set, only ids at
    /// or above that floor are considered — the incremental-rescan
    /// optimization used by retrying allocators.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the query fails.
    fn max_workflow_id(
        &self,
        device_key: &str,
        scope: &str,
        at_or_above: Option<u64>,
    ) -> Result<Option<u64>, StoreError>;

    /// Pages through the device's head records: `update_workflow_id = 0`,
    /// workflow status holding a claim, request type other than delete, not
    /// defunct, workflow id at or above `min_workflow_id`.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the query fails or a row is corrupt.
    fn active_heads(
        &self,
        device_key: &str,
        min_workflow_id: u64,
        page: Option<PageToken>,
        page_size: usize,
    ) -> Result<Page<RequestRecord>, StoreError>;

    /// Returns the newest non-defunct record for a mitigation name, or
    /// `None` if the chain has no records.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the query fails or a row is corrupt.
    fn latest_for_name(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
    ) -> Result<Option<RequestRecord>, StoreError>;

    /// Returns the record that established `mitigation_version` for a
    /// mitigation name, used by rollback handlers to recover a prior
    /// definition.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the query fails or a row is corrupt.
    fn record_for_version(
        &self,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
        mitigation_version: u32,
    ) -> Result<Option<RequestRecord>, StoreError>;

    /// Marks a superseded head: sets `update_workflow_id` to the successor's
    /// workflow id, precondition *update_workflow_id must still be 0*.
    ///
    /// Owned by the workflow-completion collaborator; request handlers never
    /// call this.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if the row does not exist or
    /// was already superseded.
    fn mark_superseded(
        &self,
        device_key: &str,
        workflow_id: u64,
        successor_workflow_id: u64,
    ) -> Result<(), StoreError>;

    /// Updates a record's workflow status, precondition *row exists*.
    ///
    /// Owned by the workflow-completion collaborator.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if the row does not exist.
    fn set_workflow_status(
        &self,
        device_key: &str,
        workflow_id: u64,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;

    /// Fetches a workflow counter row.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the lookup fails or the row is corrupt.
    fn get_counter(
        &self,
        device_key: &str,
        scope: &str,
    ) -> Result<Option<CounterRecord>, StoreError>;

    /// Creates a counter row with precondition *key must not exist*. This is
    /// the out-of-band bootstrap step of the lease protocol.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if the counter already
    /// exists.
    fn init_counter(&self, record: &CounterRecord) -> Result<(), StoreError>;

    /// Compare-and-swaps a counter row: writes `new` with precondition *the
    /// stored (counter, lock status) pair equals `expected` exactly*. The
    /// exact-value expectation is the fencing check of the lease protocol.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreconditionFailed` if the stored state differs
    /// from `expected` (including a missing row).
    fn put_counter(
        &self,
        device_key: &str,
        scope: &str,
        new: CounterState,
        expected: CounterState,
    ) -> Result<(), StoreError>;
}
