use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::{
    ActionType, AuditLogEntry, IdentityResolver, NewAuditEntry, NewRecord, RecordKey,
    WorkflowRecord, now_millis,
};
use crate::error::{ErrorKind, WorkflowError};
use crate::storage::UnitOfWork;

use super::kinds::RecordKind;
use super::transition::{Decision, Resolution};

/// A committed change and the audit entry written with it.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub record: WorkflowRecord,
    pub entry: AuditLogEntry,
}

/// Sole writer of workflow records. Every state change it makes is committed
/// in the same transaction as exactly one audit entry.
pub struct TransitionEngine<S> {
    store: Arc<S>,
    identities: Arc<dyn IdentityResolver>,
}

impl<S: UnitOfWork> TransitionEngine<S> {
    pub fn new(store: Arc<S>, identities: Arc<dyn IdentityResolver>) -> Self {
        Self { store, identities }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn create<K: RecordKind>(
        &self,
        maker_id: &str,
        payload: K::Payload,
    ) -> Result<Resolved, WorkflowError> {
        self.resolve_identity(maker_id, "Maker")?;

        let result = self.store.with_transaction(|tx| {
            let draft = K::prepare(payload, tx)?;

            let record = tx.insert_record(NewRecord {
                kind: K::SUBJECT,
                maker_id: maker_id.to_owned(),
                line_items: draft.line_items,
                source_request_id: draft.source_request_id,
                created_at: now_millis(),
            })?;

            let entry = tx.append_audit(NewAuditEntry {
                subject: record.key,
                action: ActionType::Created,
                actor_id: maker_id.to_owned(),
                old_value: None,
                new_value: Some(snapshot(&record, true).to_string()),
                notes: None,
            })?;

            Ok(Resolved { record, entry })
        });

        match &result {
            Ok(created) => info!(
                kind = %K::SUBJECT,
                record_id = created.record.id(),
                actor = %maker_id,
                log_id = created.entry.log_id,
                "record created"
            ),
            Err(e) => warn!(kind = %K::SUBJECT, actor = %maker_id, error = %e, "create refused"),
        }

        result
    }

    pub fn approve(&self, key: RecordKey, checker_id: &str) -> Result<Resolved, WorkflowError> {
        self.resolve(key, checker_id, Decision::Approve)
    }

    pub fn reject(
        &self,
        key: RecordKey,
        checker_id: &str,
        reason: &str,
    ) -> Result<Resolved, WorkflowError> {
        self.resolve(
            key,
            checker_id,
            Decision::Reject {
                reason: reason.to_owned(),
            },
        )
    }

    fn resolve(
        &self,
        key: RecordKey,
        checker_id: &str,
        decision: Decision,
    ) -> Result<Resolved, WorkflowError> {
        let transition = decision.transition();
        self.resolve_identity(checker_id, "Checker")?;

        // the state read, the guards and both writes share one transaction,
        // so a concurrent resolver always observes the winner's commit
        let result = self.store.with_transaction(|tx| {
            let current = tx
                .record(key)
                .cloned()
                .ok_or_else(|| WorkflowError::NotFound(format!("{} not found", key)))?;

            for guard in transition.guards {
                guard.check(&current, checker_id, &decision)?;
            }

            let resolution = Resolution {
                state: transition.to_state,
                checker_id: checker_id.to_owned(),
                resolved_at: now_millis(),
                reason: decision.reason().map(str::to_owned),
            };
            let updated = tx.resolve_if_pending(key, resolution)?;

            let entry = tx.append_audit(NewAuditEntry {
                subject: key,
                action: transition.action,
                actor_id: checker_id.to_owned(),
                old_value: Some(snapshot(&current, false).to_string()),
                new_value: Some(snapshot(&updated, false).to_string()),
                notes: updated.resolution_reason.clone(),
            })?;

            Ok(Resolved {
                record: updated,
                entry,
            })
        });

        match &result {
            Ok(resolved) => info!(
                kind = %key.kind,
                record_id = key.id,
                actor = %checker_id,
                action = transition.name,
                log_id = resolved.entry.log_id,
                "record resolved"
            ),
            Err(e) if e.kind() == ErrorKind::Storage => warn!(
                kind = %key.kind,
                record_id = key.id,
                action = transition.name,
                error = %e,
                "transition not committed"
            ),
            Err(e) => warn!(
                kind = %key.kind,
                record_id = key.id,
                actor = %checker_id,
                action = transition.name,
                reason = %e.kind(),
                "transition refused"
            ),
        }

        result
    }

    fn resolve_identity(&self, user_id: &str, role: &str) -> Result<(), WorkflowError> {
        if !self.identities.user_exists(user_id)? {
            return Err(WorkflowError::NotFound(format!(
                "{} '{}' not found",
                role, user_id
            )));
        }

        if !self.identities.user_is_active(user_id)? {
            return Err(WorkflowError::Validation(format!(
                "{} '{}' is not active",
                role, user_id
            )));
        }

        Ok(())
    }
}

/// Forensic snapshot stored in the audit entry's old/new values.
fn snapshot(record: &WorkflowRecord, with_items: bool) -> Value {
    if with_items {
        json!({
            "state": record.state,
            "maker_id": record.maker_id,
            "source_request_id": record.source_request_id,
            "line_items": record.line_items,
        })
    } else {
        json!({
            "state": record.state,
            "checker_id": record.checker_id,
            "resolved_at": record.resolved_at,
            "resolution_reason": record.resolution_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::core::{LineItemInput, SubjectKind, User, UserDirectory};
    use crate::storage::{Database, FaultPoint};
    use crate::workflow::{
        Dispatch, DispatchPayload, ProductRequest, RecordState, RequestPayload,
    };

    fn engine() -> TransitionEngine<Database> {
        let mut directory = UserDirectory::new();
        for id in ["U1", "U2", "U3"] {
            directory.register(User::new(id));
        }
        let mut retired = User::new("U9");
        retired.deactivate();
        directory.register(retired);

        TransitionEngine::new(Arc::new(Database::in_memory()), Arc::new(directory))
    }

    fn two_items() -> RequestPayload {
        RequestPayload {
            line_items: vec![LineItemInput::new("ABC", 5), LineItemInput::new("XYZ", 2)],
        }
    }

    fn audit_len(engine: &TransitionEngine<Database>, key: RecordKey) -> usize {
        engine.store().audit_for(key).unwrap().len()
    }

    #[test]
    fn test_create_writes_pending_record_and_created_entry() {
        let engine = engine();
        let created = engine.create::<ProductRequest>("U1", two_items()).unwrap();

        assert_eq!(created.record.key, RecordKey::request(1));
        assert_eq!(created.record.state, RecordState::Pending);
        assert_eq!(created.record.checker_id, None);
        assert_eq!(created.entry.action, ActionType::Created);
        assert_eq!(created.entry.actor_id, "U1");

        let snapshot: Value =
            serde_json::from_str(created.entry.new_value.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot["state"], "pending");
        assert_eq!(snapshot["line_items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_maker() {
        let engine = engine();
        let result = engine.create::<ProductRequest>("ghost", two_items());

        assert!(matches!(result, Err(WorkflowError::NotFound(_))));
        assert!(engine.store().audit_all().unwrap().is_empty());
    }

    #[test]
    fn test_inactive_maker() {
        let engine = engine();
        let result = engine.create::<ProductRequest>("U9", two_items());

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn test_invalid_payload_leaves_nothing_behind() {
        let engine = engine();
        let result = engine.create::<ProductRequest>(
            "U1",
            RequestPayload {
                line_items: vec![LineItemInput::new("ABC", 0)],
            },
        );

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
        assert!(engine.store().list_records(SubjectKind::ProductRequest).unwrap().is_empty());

        // the failed attempt must not burn an id
        let created = engine.create::<ProductRequest>("U1", two_items()).unwrap();
        assert_eq!(created.record.id(), 1);
    }

    #[test]
    fn test_approve_then_reject_is_invalid_state() {
        let engine = engine();
        let key = engine.create::<ProductRequest>("U1", two_items()).unwrap().record.key;

        let approved = engine.approve(key, "U2").unwrap();
        assert_eq!(approved.record.state, RecordState::Approved);
        assert_eq!(approved.record.checker_id.as_deref(), Some("U2"));
        assert!(approved.record.resolved_at.is_some());

        let second = engine.reject(key, "U3", "changed my mind");
        assert!(matches!(second, Err(WorkflowError::InvalidState(_))));
        assert_eq!(audit_len(&engine, key), 2);
    }

    #[test]
    fn test_self_approval_refused() {
        let engine = engine();
        let key = engine.create::<ProductRequest>("U1", two_items()).unwrap().record.key;

        assert!(matches!(
            engine.approve(key, "U1"),
            Err(WorkflowError::SelfApproval(_))
        ));
        assert!(matches!(
            engine.reject(key, "U1", "no"),
            Err(WorkflowError::SelfApproval(_))
        ));

        let record = engine.store().get_record(key).unwrap().unwrap();
        assert_eq!(record.state, RecordState::Pending);
        assert_eq!(audit_len(&engine, key), 1);
    }

    #[test]
    fn test_reject_stores_reason() {
        let engine = engine();
        let key = engine.create::<ProductRequest>("U1", two_items()).unwrap().record.key;

        let rejected = engine.reject(key, "U2", "  out of budget ").unwrap();
        assert_eq!(rejected.record.state, RecordState::Rejected);
        assert_eq!(rejected.record.resolution_reason.as_deref(), Some("out of budget"));
        assert_eq!(rejected.entry.notes.as_deref(), Some("out of budget"));
        assert_eq!(rejected.entry.action, ActionType::Rejected);
    }

    #[test]
    fn test_missing_record() {
        let engine = engine();
        assert!(matches!(
            engine.approve(RecordKey::request(42), "U2"),
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[test]
    fn test_dispatch_source_request_must_exist() {
        let engine = engine();

        let missing = engine.create::<Dispatch>(
            "U1",
            DispatchPayload {
                source_request_id: Some(7),
                line_items: vec![LineItemInput::new("ABC", 1)],
            },
        );
        assert!(matches!(missing, Err(WorkflowError::NotFound(_))));

        let request = engine.create::<ProductRequest>("U1", two_items()).unwrap();
        let dispatch = engine
            .create::<Dispatch>(
                "U2",
                DispatchPayload {
                    source_request_id: Some(request.record.id()),
                    line_items: vec![LineItemInput::new("ABC", 5)],
                },
            )
            .unwrap();

        assert_eq!(dispatch.record.key, RecordKey::dispatch(1));
        assert_eq!(dispatch.record.source_request_id, Some(1));
    }

    #[test]
    fn test_fault_after_state_write_rolls_back_both() {
        let engine = engine();
        let key = engine.create::<ProductRequest>("U1", two_items()).unwrap().record.key;

        engine.store().inject_fault(FaultPoint::AfterRecordWrite);
        let result = engine.approve(key, "U2");
        assert!(matches!(result, Err(WorkflowError::Storage(_))));

        let record = engine.store().get_record(key).unwrap().unwrap();
        assert_eq!(record.state, RecordState::Pending);
        assert_eq!(record.checker_id, None);
        assert_eq!(audit_len(&engine, key), 1);

        // the retry is a fresh transaction and goes through
        assert!(engine.approve(key, "U2").is_ok());
        assert_eq!(audit_len(&engine, key), 2);
    }
}
