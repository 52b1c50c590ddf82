//! Caller-facing operations over both record families.
//!
//! Every error leaving this module is the engine's error unchanged, tagged
//! with the kind of record the call was about.

use std::sync::Arc;

use crate::core::{AuditLogEntry, IdentityResolver, RecordKey, SubjectKind, WorkflowRecord};
use crate::error::{ServiceError, StorageError, WorkflowError};
use crate::storage::UnitOfWork;
use crate::workflow::{
    Dispatch, DispatchPayload, ProductRequest, RecordState, RequestPayload, Resolved,
    TransitionEngine,
};

/// Result of an approve or reject call.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    pub record: WorkflowRecord,
    pub log_id: u64,
}

impl Outcome {
    fn from_resolved(resolved: Resolved) -> Self {
        let message = format!("{} {}", resolved.record.key, resolved.record.state);
        Self {
            success: true,
            message,
            log_id: resolved.entry.log_id,
            record: resolved.record,
        }
    }
}

pub struct WorkflowService<S> {
    engine: TransitionEngine<S>,
}

impl<S: UnitOfWork> WorkflowService<S> {
    pub fn new(store: Arc<S>, identities: Arc<dyn IdentityResolver>) -> Self {
        Self {
            engine: TransitionEngine::new(store, identities),
        }
    }

    pub fn engine(&self) -> &TransitionEngine<S> {
        &self.engine
    }

    fn store(&self) -> &S {
        self.engine.store()
    }

    pub fn create_request(
        &self,
        maker_id: &str,
        payload: RequestPayload,
    ) -> Result<WorkflowRecord, ServiceError> {
        self.engine
            .create::<ProductRequest>(maker_id, payload)
            .map(|created| created.record)
            .map_err(|e| ServiceError::new(SubjectKind::ProductRequest, e))
    }

    pub fn create_dispatch(
        &self,
        maker_id: &str,
        payload: DispatchPayload,
    ) -> Result<WorkflowRecord, ServiceError> {
        self.engine
            .create::<Dispatch>(maker_id, payload)
            .map(|created| created.record)
            .map_err(|e| ServiceError::new(SubjectKind::Dispatch, e))
    }

    pub fn approve(&self, key: RecordKey, checker_id: &str) -> Result<Outcome, ServiceError> {
        self.engine
            .approve(key, checker_id)
            .map(Outcome::from_resolved)
            .map_err(|e| ServiceError::new(key.kind, e))
    }

    pub fn reject(
        &self,
        key: RecordKey,
        checker_id: &str,
        reason: &str,
    ) -> Result<Outcome, ServiceError> {
        self.engine
            .reject(key, checker_id, reason)
            .map(Outcome::from_resolved)
            .map_err(|e| ServiceError::new(key.kind, e))
    }

    /// `None` when there is no such record.
    pub fn get_by_id(&self, key: RecordKey) -> Result<Option<WorkflowRecord>, ServiceError> {
        self.store().get_record(key).map_err(storage(key.kind))
    }

    /// Oldest first. Unknown ids have an empty log.
    pub fn get_audit_log(&self, key: RecordKey) -> Result<Vec<AuditLogEntry>, ServiceError> {
        self.store().audit_for(key).map_err(storage(key.kind))
    }

    /// Newest first.
    pub fn list_all(&self, kind: SubjectKind) -> Result<Vec<WorkflowRecord>, ServiceError> {
        self.store().list_records(kind).map_err(storage(kind))
    }

    pub fn list_by_state(
        &self,
        kind: SubjectKind,
        state: RecordState,
    ) -> Result<Vec<WorkflowRecord>, ServiceError> {
        let mut records = self.list_all(kind)?;
        records.retain(|r| r.state == state);
        Ok(records)
    }

    /// Pending records this checker is allowed to resolve.
    pub fn pending_for_checker(
        &self,
        kind: SubjectKind,
        checker_id: &str,
    ) -> Result<Vec<WorkflowRecord>, ServiceError> {
        let mut records = self.list_by_state(kind, RecordState::Pending)?;
        records.retain(|r| r.maker_id != checker_id);
        Ok(records)
    }

    /// The whole trail across both kinds, newest first.
    pub fn audit_all(&self) -> Result<Vec<AuditLogEntry>, StorageError> {
        self.store().audit_all()
    }

    pub fn verify_audit(&self) -> Result<(), StorageError> {
        self.store().verify_audit()
    }
}

fn storage(kind: SubjectKind) -> impl Fn(StorageError) -> ServiceError {
    move |e| ServiceError::new(kind, WorkflowError::Storage(e))
}
