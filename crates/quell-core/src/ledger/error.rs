//! Boundary error type returned by request submission.

use thiserror::Error;

use crate::allocator::AllocatorError;
use crate::conflict::ConflictError;
use crate::record::RecordError;
use crate::store::StoreError;

/// Errors surfaced to callers of [`RequestLedger`](super::RequestLedger).
///
/// Client errors describe a request that can never succeed as written
/// (the caller must change it); the rest are internal failures of the
/// ledger or its store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The request failed structural validation before any store access.
    #[error(transparent)]
    InvalidRequest(#[from] RecordError),

    /// The named mitigation chain has no record the operation could act
    /// on.
    #[error("no active mitigation named {mitigation_name}")]
    MissingMitigation {
        /// The name the request targeted.
        mitigation_name: String,
    },

    /// The requested version does not follow the chain's head version.
    #[error(
        "stale request for {mitigation_name}: requested version \
         {requested_version}, head is at version {head_version}"
    )]
    StaleRequest {
        /// The name the request targeted.
        mitigation_name: String,
        /// The version the caller asked for.
        requested_version: u32,
        /// The chain's current head version.
        head_version: u32,
    },

    /// The request's template does not match the chain it targets.
    #[error(
        "template mismatch for {mitigation_name}: requested \
         {requested_template}, chain uses {head_template}"
    )]
    TemplateMismatch {
        /// The name the request targeted.
        mitigation_name: String,
        /// The template carried by the request.
        requested_template: String,
        /// The template the chain was created with.
        head_template: String,
    },

    /// Another active mitigation already claims this name.
    #[error("mitigation name {mitigation_name} already in use by workflow {workflow_id}")]
    DuplicateMitigationName {
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

    /// The rollback target version has no record in the chain.
    #[error("mitigation {mitigation_name} has no record for version {version}")]
    UnknownVersion {
        /// The name the request targeted.
        mitigation_name: String,
        /// The version the rollback asked to restore.
        version: u32,
    },

    /// Every insert attempt lost the race for its candidate workflow id.
    #[error("submission abandoned after {attempts} contended attempts")]
    ContentionExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The store stayed unavailable across the transient retry budget.
    #[error("store unavailable after {attempts} attempts")]
    StoreUnavailable {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The next candidate workflow id falls outside the scope's range.
    #[error(
        "workflow id space exhausted: candidate {candidate} outside \
         [{min_workflow_id}, {max_workflow_id}]"
    )]
    IdSpaceExhausted {
        /// The id that would have been tried next.
        candidate: u64,
        /// Lower bound of the scope's range.
        min_workflow_id: u64,
        /// Upper bound of the scope's range.
        max_workflow_id: u64,
    },

    /// Non-retryable storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RequestError {
    /// Returns true if the request itself is at fault and resubmitting it
    /// unchanged can never succeed.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::MissingMitigation { .. }
                | Self::StaleRequest { .. }
                | Self::TemplateMismatch { .. }
                | Self::DuplicateMitigationName { .. }
                | Self::DuplicateDefinition { .. }
                | Self::UnknownVersion { .. }
        )
    }
}

impl From<ConflictError> for RequestError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::DuplicateName {
                mitigation_name,
                workflow_id,
            } => Self::DuplicateMitigationName {
                mitigation_name,
                workflow_id,
            },
            ConflictError::DuplicateDefinition {
                mitigation_name,
                existing_name,
                workflow_id,
            } => Self::DuplicateDefinition {
                mitigation_name,
                existing_name,
                workflow_id,
            },
            ConflictError::Store(err) => Self::Store(err),
        }
    }
}

impl From<AllocatorError> for RequestError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::IdSpaceExhausted {
                candidate,
                min_workflow_id,
                max_workflow_id,
            } => Self::IdSpaceExhausted {
                candidate,
                min_workflow_id,
                max_workflow_id,
            },
            AllocatorError::Store(err) => Self::Store(err),
        }
    }
}
