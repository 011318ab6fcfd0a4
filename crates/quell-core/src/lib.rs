//! # quell-core
//!
//! Control-plane request ledger for network-mitigation orchestration.
//!
//! Operators and upstream services submit mitigation requests — create,
//! edit, delete, rollback — against target devices. This crate records
//! each request as an immutable row in a shared ledger table, assigns it
//! a workflow id unique per device, and enforces the per-chain state
//! machine that keeps concurrent submitters from clobbering each other.
//! Every writer races optimistically: correctness rests on the store's
//! atomic conditional writes, never on in-process locks, so any number
//! of service instances may share one table.
//!
//! ## Core Concepts
//!
//! - **Chain**: the sequence of ledger rows for one mitigation name on
//!   one device, with monotonically increasing versions
//! - **Head**: the newest row of a chain; each request type is gated on
//!   the head's type, template, and version
//! - **Workflow id**: per-device unique id assigned at insert, allocated
//!   by scanning past the highest existing id or by a lease counter
//! - **Claim**: an inserted row claims its name and definition until its
//!   workflow fails or the chain is deleted and the delete succeeds
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! use quell_core::config::LedgerConfig;
//! use quell_core::conflict::ComparatorRegistry;
//! use quell_core::ledger::RequestLedger;
//! use quell_core::record::{MitigationDefinition, MitigationRequest};
//! use quell_core::store::SqliteLedgerStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteLedgerStore::open("/var/lib/quell/ledger.db")?);
//! let ledger = RequestLedger::new(store, ComparatorRegistry::new(), LedgerConfig::default());
//!
//! let record = ledger.create(&MitigationRequest {
//!     device_key: "edge-router-7".into(),
//!     device_scope: "border".into(),
//!     mitigation_name: "dns-flood".into(),
//!     mitigation_template: "rate-limit".into(),
//!     service_name: "dns".into(),
//!     requested_version: None,
//!     rollback_to_version: None,
//!     definition: MitigationDefinition::new(b"limit udp/53".to_vec()),
//!     locations: BTreeSet::from(["iad-core-1".to_string()]),
//!     requested_by: "oncall".into(),
//! })?;
//! println!("workflow {} at version {}", record.workflow_id, record.mitigation_version);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`record`]: request and row types, validation, definition
//!   fingerprinting
//! - [`store`]: the [`store::LedgerStore`] conditional-write contract and
//!   its SQLite implementation
//! - [`allocator`]: workflow-id allocation — optimistic scan and the
//!   lease-counter protocol
//! - [`conflict`]: duplicate name/definition detection across a device's
//!   active heads
//! - [`ledger`]: the submission state machine and the completion-side
//!   write surface
//! - [`retry`]: declarative bounded-retry policy shared by the loops
//!   above
//! - [`config`]: TOML configuration for retry bounds, scan paging, and
//!   per-scope id ranges

pub mod allocator;
pub mod config;
pub mod conflict;
pub mod ledger;
pub mod record;
pub mod retry;
pub mod store;

pub use config::LedgerConfig;
pub use conflict::{ComparatorRegistry, ConflictComparator};
pub use ledger::{CompletionHandle, RequestError, RequestLedger};
pub use record::{MitigationDefinition, MitigationRequest, RequestRecord, RequestType, WorkflowStatus};
pub use store::{LedgerStore, SqliteLedgerStore, StoreError};
