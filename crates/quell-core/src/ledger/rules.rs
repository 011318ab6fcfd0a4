//! Per-request-type chain rules.
//!
//! Each rule evaluates the head of one mitigation chain and produces the
//! plan for the row to insert: the version to record, the definition to
//! store, and whether the conflict scan should skip the candidate's own
//! chain. The submission loop in [`RequestLedger`](super::RequestLedger)
//! re-derives head state and re-runs the rule on every attempt, so rules
//! must be pure functions of the head and the request.

use crate::record::{
    MitigationDefinition, MitigationRequest, RecordError, RequestRecord, RequestType,
    WorkflowStatus,
};
use crate::store::{LedgerStore, StoreError};

use super::error::RequestError;

/// The state of one mitigation chain, derived from its newest record.
#[derive(Debug, Clone)]
pub(crate) enum HeadState {
    /// The chain has no records.
    NoRecord,

    /// The newest record establishes or mutates an active mitigation.
    Active(RequestRecord),

    /// The newest record is a delete; `completed` is true once its
    /// workflow reached `Succeeded` and the name is free again.
    Deleted {
        record: RequestRecord,
        completed: bool,
    },
}

impl HeadState {
    pub(crate) fn derive(
        store: &dyn LedgerStore,
        device_key: &str,
        scope: &str,
        mitigation_name: &str,
    ) -> Result<Self, StoreError> {
        match store.latest_for_name(device_key, scope, mitigation_name)? {
            None => Ok(Self::NoRecord),
            Some(record) if record.request_type == RequestType::Delete => {
                let completed = record.workflow_status == WorkflowStatus::Succeeded;
                Ok(Self::Deleted { record, completed })
            }
            Some(record) => Ok(Self::Active(record)),
        }
    }
}

/// The row a rule decided to insert.
pub(crate) struct ChainPlan {
    /// Version recorded on the new row.
    pub version: u32,

    /// Definition recorded on the new row; rollbacks substitute a prior
    /// payload here.
    pub definition: MitigationDefinition,

    /// True for mutations of an existing chain, letting the conflict scan
    /// skip rows with the candidate's own name.
    pub is_update: bool,
}

/// Head-precondition and version logic for one request type.
pub(crate) trait ChainRule {
    fn request_type(&self) -> RequestType;

    /// Evaluates the chain head against the request and plans the insert.
    fn plan(
        &self,
        head: &HeadState,
        request: &MitigationRequest,
        store: &dyn LedgerStore,
    ) -> Result<ChainPlan, RequestError>;
}

fn requested_version(
    request: &MitigationRequest,
    request_type: RequestType,
) -> Result<u32, RequestError> {
    request.requested_version.ok_or_else(|| {
        RecordError::MissingVersion {
            request_type,
            mitigation_name: request.mitigation_name.clone(),
        }
        .into()
    })
}

fn require_template_match(
    head: &RequestRecord,
    request: &MitigationRequest,
) -> Result<(), RequestError> {
    if head.mitigation_template == request.mitigation_template {
        Ok(())
    } else {
        Err(RequestError::TemplateMismatch {
            mitigation_name: request.mitigation_name.clone(),
            requested_template: request.mitigation_template.clone(),
            head_template: head.mitigation_template.clone(),
        })
    }
}

fn missing(request: &MitigationRequest) -> RequestError {
    RequestError::MissingMitigation {
        mitigation_name: request.mitigation_name.clone(),
    }
}

/// Create: the name must be unclaimed — no chain at all, or a chain whose
/// delete has completed. An incomplete delete still holds the name.
pub(crate) struct CreateRule;

impl ChainRule for CreateRule {
    fn request_type(&self) -> RequestType {
        RequestType::Create
    }

    fn plan(
        &self,
        head: &HeadState,
        request: &MitigationRequest,
        _store: &dyn LedgerStore,
    ) -> Result<ChainPlan, RequestError> {
        let version = match head {
            HeadState::NoRecord => 1,
            HeadState::Deleted {
                record,
                completed: true,
            } => record.mitigation_version + 1,
            HeadState::Deleted {
                record,
                completed: false,
            } => {
                return Err(RequestError::DuplicateMitigationName {
                    mitigation_name: request.mitigation_name.clone(),
                    workflow_id: record.workflow_id,
                });
            }
            HeadState::Active(record) => {
                return Err(RequestError::DuplicateMitigationName {
                    mitigation_name: request.mitigation_name.clone(),
                    workflow_id: record.workflow_id,
                });
            }
        };

        Ok(ChainPlan {
            version,
            definition: request.definition.clone(),
            is_update: false,
        })
    }
}

/// Edit: the chain must be active with the same template, and the
/// requested version must be exactly one past the head.
pub(crate) struct EditRule;

impl ChainRule for EditRule {
    fn request_type(&self) -> RequestType {
        RequestType::Edit
    }

    fn plan(
        &self,
        head: &HeadState,
        request: &MitigationRequest,
        _store: &dyn LedgerStore,
    ) -> Result<ChainPlan, RequestError> {
        let HeadState::Active(record) = head else {
            return Err(missing(request));
        };
        require_template_match(record, request)?;

        let requested = requested_version(request, RequestType::Edit)?;
        if requested != record.mitigation_version + 1 {
            return Err(RequestError::StaleRequest {
                mitigation_name: request.mitigation_name.clone(),
                requested_version: requested,
                head_version: record.mitigation_version,
            });
        }

        Ok(ChainPlan {
            version: requested,
            definition: request.definition.clone(),
            is_update: true,
        })
    }
}

/// Delete: the chain must be active with the same template, the version
/// to delete must be the head's, and the row is stored one version past
/// it so the chain stays monotone.
pub(crate) struct DeleteRule;

impl ChainRule for DeleteRule {
    fn request_type(&self) -> RequestType {
        RequestType::Delete
    }

    fn plan(
        &self,
        head: &HeadState,
        request: &MitigationRequest,
        _store: &dyn LedgerStore,
    ) -> Result<ChainPlan, RequestError> {
        let HeadState::Active(record) = head else {
            return Err(missing(request));
        };
        require_template_match(record, request)?;

        let requested = requested_version(request, RequestType::Delete)?;
        if requested != record.mitigation_version {
            return Err(RequestError::StaleRequest {
                mitigation_name: request.mitigation_name.clone(),
                requested_version: requested,
                head_version: record.mitigation_version,
            });
        }

        // The delete row carries the head's definition so the chain's
        // final state is readable from the row alone.
        Ok(ChainPlan {
            version: requested + 1,
            definition: MitigationDefinition::new(record.definition_payload.clone()),
            is_update: true,
        })
    }
}

/// Rollback: an edit whose definition is recovered from the prior record
/// named by `rollback_to_version`.
pub(crate) struct RollbackRule;

impl ChainRule for RollbackRule {
    fn request_type(&self) -> RequestType {
        RequestType::Rollback
    }

    fn plan(
        &self,
        head: &HeadState,
        request: &MitigationRequest,
        store: &dyn LedgerStore,
    ) -> Result<ChainPlan, RequestError> {
        let HeadState::Active(record) = head else {
            return Err(missing(request));
        };

        let requested = requested_version(request, RequestType::Rollback)?;
        if requested != record.mitigation_version + 1 {
            return Err(RequestError::StaleRequest {
                mitigation_name: request.mitigation_name.clone(),
                requested_version: requested,
                head_version: record.mitigation_version,
            });
        }

        let target = request.rollback_to_version.ok_or_else(|| {
            RequestError::from(RecordError::MissingRollbackTarget {
                mitigation_name: request.mitigation_name.clone(),
            })
        })?;
        let prior = store
            .record_for_version(
                &request.device_key,
                &request.device_scope,
                &request.mitigation_name,
                target,
            )?
            .ok_or_else(|| RequestError::UnknownVersion {
                mitigation_name: request.mitigation_name.clone(),
                version: target,
            })?;

        Ok(ChainPlan {
            version: requested,
            definition: MitigationDefinition::new(prior.definition_payload),
            is_update: true,
        })
    }
}
