//! The request ledger: per-type submission over one shared store.
//!
//! [`RequestLedger`] is the write path for mitigation requests. Each
//! submission validates the request, then runs a bounded optimistic loop:
//! derive the chain's head state, evaluate the request type's chain rule
//! against it, scan for name and
//! definition conflicts, allocate a candidate workflow id, and insert the
//! row conditioned on the id being unclaimed. A lost insert race advances
//! the allocator's rescan floor and retries from a fresh head read;
//! nothing decided before a conflict is ever replayed.
//!
//! There is no in-process mutual exclusion: any number of ledgers in any
//! number of processes may submit against the same store, and correctness
//! rests entirely on the store's conditional writes.
//!
//! # Key concepts
//!
//! - A mitigation **chain** is the sequence of rows sharing one
//!   (device, scope, name), with monotonically increasing versions.
//! - The **head** is the newest row of a chain; rules gate each request
//!   type on the head's type, template, and version.
//! - [`CompletionHandle`] is the only surface that mutates existing rows;
//!   the ledger itself is insert-only.

mod completion;
mod error;
mod rules;


pub use completion::CompletionHandle;
pub use error::RequestError;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use crate::allocator::{AllocatorError, ScanAllocator, ScanCursor};
use crate::config::LedgerConfig;
use crate::conflict::{ComparatorRegistry, ConflictCursor, ConflictDetector, ConflictError};
use crate::record::{MitigationRequest, RequestRecord};
use crate::retry::{Outcome, RetryError};
use crate::store::{LedgerStore, StoreError};

use rules::{ChainRule, CreateRule, DeleteRule, EditRule, HeadState, RollbackRule};

/// Write path for mitigation requests over a shared ledger store.
pub struct RequestLedger {
    store: Arc<dyn LedgerStore>,
    registry: ComparatorRegistry,
    config: LedgerConfig,
}

impl RequestLedger {
    /// Creates a ledger over `store`, using `registry` for definition
    /// conflict judgement.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        registry: ComparatorRegistry,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// A completion handle sharing this ledger's store.
    #[must_use]
    pub fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle::new(Arc::clone(&self.store))
    }

    /// Submits a create request: claims an unclaimed name at version 1, or
    /// continues a fully deleted chain at its next version.
    ///
    /// # Errors
    ///
    /// Returns a client error ([`RequestError::is_client_error`]) for an
    /// invalid request, a name or definition already claimed, or an
    /// incomplete delete still holding the name; otherwise an internal
    /// error when retries or the id space are exhausted or the store
    /// fails.
    pub fn create(&self, request: &MitigationRequest) -> Result<RequestRecord, RequestError> {
        self.submit(&CreateRule, request)
    }

    /// Submits an edit: a new definition at exactly head version + 1.
    ///
    /// # Errors
    ///
    /// As [`RequestLedger::create`], plus `MissingMitigation`,
    /// `TemplateMismatch`, and `StaleRequest` when the chain's head does
    /// not match the request.
    pub fn edit(&self, request: &MitigationRequest) -> Result<RequestRecord, RequestError> {
        self.submit(&EditRule, request)
    }

    /// Submits a delete of the chain's current head version. The stored
    /// row records version head + 1; the name stays claimed until the
    /// delete workflow succeeds.
    ///
    /// # Errors
    ///
    /// As [`RequestLedger::edit`].
    pub fn delete(&self, request: &MitigationRequest) -> Result<RequestRecord, RequestError> {
        self.submit(&DeleteRule, request)
    }

    /// Submits a rollback: an edit whose definition is restored from the
    /// prior record named by `rollback_to_version`.
    ///
    /// # Errors
    ///
    /// As [`RequestLedger::edit`], plus `UnknownVersion` when the target
    /// version has no record.
    pub fn rollback(&self, request: &MitigationRequest) -> Result<RequestRecord, RequestError> {
        self.submit(&RollbackRule, request)
    }

    fn submit(
        &self,
        rule: &dyn ChainRule,
        request: &MitigationRequest,
    ) -> Result<RequestRecord, RequestError> {
        let request_type = rule.request_type();
        request.validate(request_type)?;

        let range = self.config.scope_range(&request.device_scope);
        let allocator = ScanAllocator::new(self.store.as_ref(), range);
        let detector = ConflictDetector::new(
            self.store.as_ref(),
            &self.registry,
            self.config.scan.page_size,
        );
        let mut scan_cursor = ScanCursor::new();
        let mut conflict_cursor = ConflictCursor::new();

        let result = self.config.retry.run(|attempt| {
            // Head state is re-derived on every attempt; a decision made
            // before a lost race is never replayed.
            let head = match HeadState::derive(
                self.store.as_ref(),
                &request.device_key,
                &request.device_scope,
                &request.mitigation_name,
            ) {
                Ok(head) => head,
                Err(err) if err.is_transient() => return Outcome::Transient,
                Err(err) => return Outcome::Fatal(RequestError::from(err)),
            };

            let plan = match rule.plan(&head, request, self.store.as_ref()) {
                Ok(plan) => plan,
                Err(err) => return Outcome::Fatal(err),
            };

            match detector.check(request, plan.is_update, &mut conflict_cursor) {
                Ok(()) => {}
                Err(ConflictError::Store(err)) if err.is_transient() => {
                    return Outcome::Transient;
                }
                Err(err) => return Outcome::Fatal(RequestError::from(err)),
            }

            let candidate = match allocator.next_candidate(
                &request.device_key,
                &request.device_scope,
                &mut scan_cursor,
            ) {
                Ok(candidate) => candidate,
                Err(AllocatorError::Store(err)) if err.is_transient() => {
                    return Outcome::Transient;
                }
                Err(err) => return Outcome::Fatal(RequestError::from(err)),
            };

            let record = RequestRecord::from_request(
                request,
                request_type,
                candidate,
                plan.version,
                &plan.definition,
                Utc::now(),
            );
            match self.store.put_request(&record) {
                Ok(()) => Outcome::Done(record),
                Err(StoreError::PreconditionFailed { .. }) => {
                    debug!(
                        device_key = %request.device_key,
                        workflow_id = candidate,
                        attempt,
                        "lost insert race for workflow id"
                    );
                    scan_cursor.note_lost_race(candidate);
                    Outcome::Contended
                }
                Err(err) if err.is_transient() => Outcome::Transient,
                Err(err) => Outcome::Fatal(RequestError::from(err)),
            }
        });

        result.map_err(|err| {
            let err = match err {
                RetryError::Exhausted { attempts } => RequestError::ContentionExhausted { attempts },
                RetryError::TransientExhausted { attempts } => {
                    RequestError::StoreUnavailable { attempts }
                }
                RetryError::Fatal(err) => err,
            };
            if !err.is_client_error() {
                error!(
                    device_key = %request.device_key,
                    mitigation_name = %request.mitigation_name,
                    request_type = %request_type,
                    %err,
                    "request submission failed"
                );
            }
            err
        })
    }
}
