//! Request record model and codec.
//!
//! This module defines the domain-facing [`MitigationRequest`] submitted by
//! clients, the flat [`RequestRecord`] row persisted in the ledger table, and
//! the mapping between the two. Records are append-only: a row is written
//! exactly once by a request handler and never mutated afterwards (the only
//! exception is the supersession update owned by the completion collaborator,
//! see [`crate::ledger::CompletionHandle`]).
//!
//! # Key Concepts
//!
//! - **Workflow id**: the per-device sort key, unique per (device, scope),
//!   assigned once by an allocator strategy
//! - **Head record**: the newest not-yet-superseded row of a mitigation
//!   chain (`update_workflow_id == 0`)
//! - **Definition fingerprint**: SHA-256 of the opaque definition payload,
//!   truncated to 64 bits, used as a fast duplicate pre-check before the
//!   template comparator runs

mod fingerprint;


use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fingerprint::definition_fingerprint;

/// Errors produced while validating or encoding a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// The request carried no target locations.
    #[error("mitigation {mitigation_name} has no locations")]
    EmptyLocations {
        /// The mitigation name on the offending request.
        mitigation_name: String,
    },

    /// A request type that requires an explicit version did not carry one.
    #[error("{request_type} request for {mitigation_name} is missing a requested version")]
    MissingVersion {
        /// The request type that requires a version.
        request_type: RequestType,
        /// The mitigation name on the offending request.
        mitigation_name: String,
    },

    /// A rollback request did not name the version to roll back to.
    #[error("rollback request for {mitigation_name} is missing rollback_to_version")]
    MissingRollbackTarget {
        /// The mitigation name on the offending request.
        mitigation_name: String,
    },

    /// Unrecognized enum value read back from the store.
    #[error("invalid {field} value: {value}")]
    InvalidEnumValue {
        /// The field being parsed.
        field: &'static str,
        /// The unrecognized value.
        value: String,
    },
}

/// The kind of ledger mutation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum RequestType {
    /// Start a new mitigation chain (version 1, or re-create after a
    /// completed delete).
    Create,
    /// Replace the head definition with a new version.
    Edit,
    /// Close the chain; the chain can be re-created afterwards.
    Delete,
    /// Edit back to a previously recorded definition.
    Rollback,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RequestType {
    /// Parses a request type from its stored string form.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidEnumValue` if the string is not a
    /// recognized request type.
    pub fn parse(s: &str) -> Result<Self, RecordError> {
        match s {
            "CREATE" => Ok(Self::Create),
            "EDIT" => Ok(Self::Edit),
            "DELETE" => Ok(Self::Delete),
            "ROLLBACK" => Ok(Self::Rollback),
            _ => Err(RecordError::InvalidEnumValue {
                field: "request_type",
                value: s.to_string(),
            }),
        }
    }

    /// Returns the stored string form of this request type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Edit => "EDIT",
            Self::Delete => "DELETE",
            Self::Rollback => "ROLLBACK",
        }
    }
}

/// Execution status of the downstream workflow consuming a request record.
///
/// The ledger inserts every record as [`WorkflowStatus::Created`]; the
/// downstream executor advances the status through the completion
/// collaborator. Records whose status is `Failed` or `Indeterminate` are
/// invisible to conflict scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum WorkflowStatus {
    /// Record inserted, workflow not yet started.
    Created,
    /// Workflow executing on devices.
    Running,
    /// Workflow completed on all locations.
    Succeeded,
    /// Workflow completed on a strict subset of locations.
    PartialSuccess,
    /// Workflow outcome unknown (executor lost track of it).
    Indeterminate,
    /// Workflow failed everywhere.
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl WorkflowStatus {
    /// Parses a workflow status from its stored string form.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidEnumValue` if the string is not a
    /// recognized status.
    pub fn parse(s: &str) -> Result<Self, RecordError> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "PARTIAL_SUCCESS" => Ok(Self::PartialSuccess),
            "INDETERMINATE" => Ok(Self::Indeterminate),
            "FAILED" => Ok(Self::Failed),
            _ => Err(RecordError::InvalidEnumValue {
                field: "workflow_status",
                value: s.to_string(),
            }),
        }
    }

    /// Returns the stored string form of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
            Self::Indeterminate => "INDETERMINATE",
            Self::Failed => "FAILED",
        }
    }

    /// Returns true if records with this status participate in conflict
    /// scans. Failed and indeterminate workflows hold no claim on their
    /// mitigation name or definition.
    #[must_use]
    pub const fn holds_claim(&self) -> bool {
        !matches!(self, Self::Failed | Self::Indeterminate)
    }
}

/// Lock state of a workflow counter row (lease allocator only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum LockStatus {
    /// An allocation holder currently owns the counter.
    Locked,
    /// The counter is free to acquire.
    Unlocked,
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl LockStatus {
    /// Parses a lock status from its stored string form.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidEnumValue` if the string is not a
    /// recognized lock status.
    pub fn parse(s: &str) -> Result<Self, RecordError> {
        match s {
            "LOCKED" => Ok(Self::Locked),
            "UNLOCKED" => Ok(Self::Unlocked),
            _ => Err(RecordError::InvalidEnumValue {
                field: "lock_status",
                value: s.to_string(),
            }),
        }
    }

    /// Returns the stored string form of this lock status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "LOCKED",
            Self::Unlocked => "UNLOCKED",
        }
    }
}

/// Opaque serialized mitigation definition.
///
/// The ledger never interprets the payload; template-specific semantics live
/// behind the [`crate::conflict::ConflictComparator`] seam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MitigationDefinition {
    /// Serialized definition bytes.
    pub payload: Vec<u8>,
}

impl MitigationDefinition {
    /// Wraps serialized definition bytes.
    #[must_use]
    pub const fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Computes the 64-bit duplicate-precheck fingerprint of this payload.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        definition_fingerprint(&self.payload)
    }
}

/// A client-submitted mitigation request, before a workflow id or version
/// has been assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MitigationRequest {
    /// Identity of the target device (partition key).
    pub device_key: String,

    /// Scope of the device used for workflow-id range selection.
    pub device_scope: String,

    /// Name of the mitigation chain this request belongs to.
    pub mitigation_name: String,

    /// Template the definition was authored against.
    pub mitigation_template: String,

    /// Service on whose behalf the mitigation runs.
    pub service_name: String,

    /// Version the caller believes it is producing. Required for
    /// edit/rollback (head version + 1) and delete (head version); ignored
    /// for create.
    pub requested_version: Option<u32>,

    /// For rollback requests: the previously recorded version whose
    /// definition should be restored.
    pub rollback_to_version: Option<u32>,

    /// The mitigation definition.
    pub definition: MitigationDefinition,

    /// Target locations; must be non-empty.
    pub locations: BTreeSet<String>,

    /// Actor that submitted the request.
    pub requested_by: String,
}

impl MitigationRequest {
    /// Validates the request shape for the given request type.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::EmptyLocations` if no location is targeted,
    /// `RecordError::MissingVersion` if an edit/delete/rollback carries no
    /// requested version, and `RecordError::MissingRollbackTarget` if a
    /// rollback does not name a target version.
    pub fn validate(&self, request_type: RequestType) -> Result<(), RecordError> {
        if self.locations.is_empty() {
            return Err(RecordError::EmptyLocations {
                mitigation_name: self.mitigation_name.clone(),
            });
        }
        if matches!(
            request_type,
            RequestType::Edit | RequestType::Delete | RequestType::Rollback
        ) && self.requested_version.is_none()
        {
            return Err(RecordError::MissingVersion {
                request_type,
                mitigation_name: self.mitigation_name.clone(),
            });
        }
        if request_type == RequestType::Rollback && self.rollback_to_version.is_none() {
            return Err(RecordError::MissingRollbackTarget {
                mitigation_name: self.mitigation_name.clone(),
            });
        }
        Ok(())
    }
}

/// One flat row of the request ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestRecord {
    /// Identity of the target device (partition key).
    pub device_key: String,

    /// Assigned workflow id (sort key, unique per device + scope).
    pub workflow_id: u64,

    /// Scope of the device used for workflow-id range selection.
    pub device_scope: String,

    /// Name of the mitigation chain.
    pub mitigation_name: String,

    /// Template the definition was authored against.
    pub mitigation_template: String,

    /// Service on whose behalf the mitigation runs.
    pub service_name: String,

    /// Version of the mitigation this record establishes.
    pub mitigation_version: u32,

    /// The kind of mutation this record performed.
    pub request_type: RequestType,

    /// Downstream execution status.
    pub workflow_status: WorkflowStatus,

    /// 0 while this record is the head of its chain; the successor's
    /// workflow id once superseded.
    pub update_workflow_id: u64,

    /// Opaque serialized definition.
    pub definition_payload: Vec<u8>,

    /// 64-bit fingerprint of `definition_payload`.
    pub definition_fingerprint: u64,

    /// Target locations (non-empty).
    pub locations: BTreeSet<String>,

    /// Submission time.
    pub request_date: DateTime<Utc>,

    /// Actor that submitted the request.
    pub requested_by: String,

    /// Marks a row that should be ignored by all scans.
    pub defunct: bool,
}

impl RequestRecord {
    /// Builds the row for a validated request once the handler has assigned
    /// a workflow id and resolved the version to record.
    ///
    /// The definition is taken from `definition` rather than the request so
    /// rollback handlers can substitute a prior payload.
    #[must_use]
    pub fn from_request(
        request: &MitigationRequest,
        request_type: RequestType,
        workflow_id: u64,
        mitigation_version: u32,
        definition: &MitigationDefinition,
        request_date: DateTime<Utc>,
    ) -> Self {
        Self {
            device_key: request.device_key.clone(),
            workflow_id,
            device_scope: request.device_scope.clone(),
            mitigation_name: request.mitigation_name.clone(),
            mitigation_template: request.mitigation_template.clone(),
            service_name: request.service_name.clone(),
            mitigation_version,
            request_type,
            workflow_status: WorkflowStatus::Created,
            update_workflow_id: 0,
            definition_payload: definition.payload.clone(),
            definition_fingerprint: definition.fingerprint(),
            locations: request.locations.clone(),
            request_date,
            requested_by: request.requested_by.clone(),
            defunct: false,
        }
    }

    /// Returns true if this row is the current head of its chain.
    #[must_use]
    pub const fn is_head(&self) -> bool {
        self.update_workflow_id == 0
    }
}

/// One workflow counter row, used only by the lease-based allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterRecord {
    /// Identity of the device the counter serves.
    pub device_key: String,

    /// Scope the counter serves.
    pub scope: String,

    /// Last allocated workflow id. Never decreases.
    pub counter: u64,

    /// Lease state of the counter.
    pub lock_status: LockStatus,
}

impl CounterRecord {
    /// Creates an unlocked counter seeded at `counter`.
    #[must_use]
    pub fn new(device_key: impl Into<String>, scope: impl Into<String>, counter: u64) -> Self {
        Self {
            device_key: device_key.into(),
            scope: scope.into(),
            counter,
            lock_status: LockStatus::Unlocked,
        }
    }

    /// Returns the (counter, lock status) pair used as a compare-and-swap
    /// expectation.
    #[must_use]
    pub const fn state(&self) -> CounterState {
        CounterState {
            counter: self.counter,
            lock_status: self.lock_status,
        }
    }
}

/// Snapshot of a counter row's mutable fields, used as the expected value in
/// conditional counter writes (the fencing check of the lease protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterState {
    /// Last allocated workflow id.
    pub counter: u64,

    /// Lease state.
    pub lock_status: LockStatus,
}
