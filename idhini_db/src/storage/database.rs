use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::debug;

use crate::core::{
    ActionType, AuditLogEntry, AuditTrail, IdentityResolver, NewAuditEntry, NewRecord, RecordKey,
    SubjectKind, User, UserDirectory, WorkflowRecord, now_millis,
};
use crate::error::{StorageError, WorkflowError};
use crate::storage::append::AppendLog;
use crate::storage::recovery::RecoveryManager;
use crate::workflow::Resolution;

/// One state change inside a transaction. A committed transaction is
/// persisted as the ordered list of its mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    InsertRecord(WorkflowRecord),
    ResolveRecord {
        key: RecordKey,
        resolution: Resolution,
    },
    AppendAudit(AuditLogEntry),
}

#[derive(Debug)]
pub(crate) enum Undo {
    RemoveRecord(RecordKey),
    RestoreRecord(WorkflowRecord),
    PopAudit,
}

/// Where a one-shot injected failure fires inside the next transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    AfterRecordWrite,
    AfterAuditWrite,
    BeforeDurableCommit,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultPoint::AfterRecordWrite => "after record write",
            FaultPoint::AfterAuditWrite => "after audit write",
            FaultPoint::BeforeDurableCommit => "before durable commit",
        };
        f.write_str(name)
    }
}

/// The complete in-memory state: records of both kinds, the audit trail
/// and the user directory.
#[derive(Debug)]
pub struct StoreState {
    pub(crate) records: BTreeMap<RecordKey, WorkflowRecord>,
    pub(crate) next_request_id: u64,
    pub(crate) next_dispatch_id: u64,
    pub(crate) audit: AuditTrail,
    pub(crate) users: UserDirectory,
}

impl Default for StoreState {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreState {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_request_id: 1,
            next_dispatch_id: 1,
            audit: AuditTrail::new(),
            users: UserDirectory::new(),
        }
    }

    pub fn next_id(&self, kind: SubjectKind) -> u64 {
        match kind {
            SubjectKind::ProductRequest => self.next_request_id,
            SubjectKind::Dispatch => self.next_dispatch_id,
        }
    }

    fn set_next_id(&mut self, kind: SubjectKind, next: u64) {
        match kind {
            SubjectKind::ProductRequest => self.next_request_id = next,
            SubjectKind::Dispatch => self.next_dispatch_id = next,
        }
    }

    pub fn record(&self, key: RecordKey) -> Option<&WorkflowRecord> {
        self.records.get(&key)
    }

    /// Records of one kind, newest first (highest id first).
    pub fn records_of(&self, kind: SubjectKind) -> Vec<WorkflowRecord> {
        self.records
            .range(RecordKey::new(kind, 0)..=RecordKey::new(kind, u64::MAX))
            .rev()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    /// Applies one mutation. Used both by live transactions and by WAL replay,
    /// so it enforces the same rules in both places.
    pub(crate) fn apply(&mut self, mutation: &Mutation) -> Result<Undo, StorageError> {
        match mutation {
            Mutation::InsertRecord(record) => {
                let key = record.key;
                if self.records.contains_key(&key) {
                    return Err(StorageError::ValidationFailed(format!(
                        "{} already exists",
                        key
                    )));
                }

                let next = self.next_id(key.kind);
                self.set_next_id(key.kind, next.max(key.id + 1));
                self.records.insert(key, record.clone());
                Ok(Undo::RemoveRecord(key))
            }
            Mutation::ResolveRecord { key, resolution } => {
                let record = self.records.get_mut(key).ok_or_else(|| {
                    StorageError::ValidationFailed(format!("{} does not exist", key))
                })?;

                let previous = record.clone();
                if !record.apply_resolution(resolution) {
                    return Err(StorageError::ValidationFailed(format!(
                        "{} is already {}",
                        key, previous.state
                    )));
                }
                Ok(Undo::RestoreRecord(previous))
            }
            Mutation::AppendAudit(entry) => {
                self.audit.append(entry.clone())?;
                Ok(Undo::PopAudit)
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::RemoveRecord(key) => {
                self.records.remove(&key);
                // ids are handed out in order, so the removed one is the next again
                self.set_next_id(key.kind, key.id);
            }
            Undo::RestoreRecord(record) => {
                self.records.insert(record.key, record);
            }
            Undo::PopAudit => {
                self.audit.rollback_last();
            }
        }
    }

    /// Checks the hash chain, then that every record's history matches its
    /// state: one creation entry first, and one resolution entry once resolved.
    pub fn verify(&self) -> Result<(), StorageError> {
        self.audit.verify_chain()?;

        for record in self.records.values() {
            let history = self.audit.query_by_subject(record.key);

            match history.first() {
                Some(first) if first.action == ActionType::Created => {}
                _ => {
                    return Err(StorageError::ChainValidation(format!(
                        "{} has no creation entry",
                        record.key
                    )));
                }
            }

            let resolutions = history.iter().filter(|e| e.action.is_resolution()).count();
            let expected = usize::from(!record.is_pending());
            if resolutions != expected {
                return Err(StorageError::ChainValidation(format!(
                    "{} is {} but has {} resolution entries",
                    record.key, record.state, resolutions
                )));
            }
        }

        Ok(())
    }
}

/// Exclusive access to the state for the duration of one unit of work.
/// Writes apply immediately and are undone in reverse if the work fails.
pub struct Transaction<'a> {
    state: &'a mut StoreState,
    journal: Vec<Mutation>,
    undo: Vec<Undo>,
    fault: Option<FaultPoint>,
}

impl<'a> Transaction<'a> {
    fn new(state: &'a mut StoreState, fault: Option<FaultPoint>) -> Self {
        Self {
            state,
            journal: Vec::new(),
            undo: Vec::new(),
            fault,
        }
    }

    pub fn record(&self, key: RecordKey) -> Option<&WorkflowRecord> {
        self.state.record(key)
    }

    pub fn insert_record(&mut self, new: NewRecord) -> Result<WorkflowRecord, WorkflowError> {
        let key = RecordKey::new(new.kind, self.state.next_id(new.kind));
        let record = WorkflowRecord::pending(key, new);

        self.apply(Mutation::InsertRecord(record.clone()))?;
        self.trip(FaultPoint::AfterRecordWrite)?;
        Ok(record)
    }

    /// The conditional update: succeeds only while the record is still Pending.
    pub fn resolve_if_pending(
        &mut self,
        key: RecordKey,
        resolution: Resolution,
    ) -> Result<WorkflowRecord, WorkflowError> {
        match self.state.record(key) {
            None => return Err(WorkflowError::NotFound(format!("{} not found", key))),
            Some(current) if !current.is_pending() => {
                return Err(WorkflowError::InvalidState(format!(
                    "{} is already {}",
                    key, current.state
                )));
            }
            Some(_) => {}
        }

        self.apply(Mutation::ResolveRecord { key, resolution })?;
        self.trip(FaultPoint::AfterRecordWrite)?;

        self.state
            .record(key)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("{} not found", key)))
    }

    pub fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditLogEntry, WorkflowError> {
        let sealed = self.state.audit.seal(entry, now_millis());

        self.apply(Mutation::AppendAudit(sealed.clone()))?;
        self.trip(FaultPoint::AfterAuditWrite)?;
        Ok(sealed)
    }

    fn apply(&mut self, mutation: Mutation) -> Result<(), StorageError> {
        let undo = self.state.apply(&mutation)?;
        self.undo.push(undo);
        self.journal.push(mutation);
        Ok(())
    }

    fn trip(&mut self, point: FaultPoint) -> Result<(), StorageError> {
        if self.fault == Some(point) {
            self.fault = None;
            return Err(StorageError::InjectedFault(point.to_string()));
        }
        Ok(())
    }

    fn rollback(self) {
        let Transaction { state, undo, .. } = self;
        for step in undo.into_iter().rev() {
            state.revert(step);
        }
    }
}

/// Transactional store the workflow runs against.
pub trait UnitOfWork: Send + Sync {
    /// Runs `work` with exclusive write access. Either every write it made is
    /// committed, or none is visible afterwards.
    fn with_transaction<T, F>(&self, work: F) -> Result<T, WorkflowError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, WorkflowError>;

    fn get_record(&self, key: RecordKey) -> Result<Option<WorkflowRecord>, StorageError>;

    /// Records of one kind, newest first.
    fn list_records(&self, kind: SubjectKind) -> Result<Vec<WorkflowRecord>, StorageError>;

    /// One record's history, oldest first.
    fn audit_for(&self, key: RecordKey) -> Result<Vec<AuditLogEntry>, StorageError>;

    /// The whole trail, newest first.
    fn audit_all(&self) -> Result<Vec<AuditLogEntry>, StorageError>;

    fn verify_audit(&self) -> Result<(), StorageError>;
}

struct Inner {
    state: StoreState,
    wal: Option<AppendLog>,
    frames_since_compact: usize,
}

pub struct Database {
    inner: RwLock<Inner>,
    fault: Mutex<Option<FaultPoint>>,
    path: Option<PathBuf>,
}

impl Database {
    /// A store with no backing file. Everything is lost on drop.
    pub fn in_memory() -> Self {
        Self::from_parts(StoreState::new(), None, 0, None)
    }

    /// Opens or creates the snapshot at `path` and replays its WAL.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let recovered = RecoveryManager::recover(&path)?;

        debug!(
            path = %path.display(),
            records = recovered.state.record_count(),
            audit_entries = recovered.state.audit().len(),
            replayed = recovered.replayed_frames,
            "database opened"
        );

        Ok(Self::from_parts(
            recovered.state,
            Some(recovered.wal),
            recovered.replayed_frames,
            Some(path),
        ))
    }

    fn from_parts(
        state: StoreState,
        wal: Option<AppendLog>,
        frames_since_compact: usize,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state,
                wal,
                frames_since_compact,
            }),
            fault: Mutex::new(None),
            path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Arms a failure for the next transaction only.
    pub fn inject_fault(&self, point: FaultPoint) {
        if let Ok(mut fault) = self.fault.lock() {
            *fault = Some(point);
        }
    }

    /// Adds or replaces a user. The WAL is written before memory changes.
    pub fn register_user(&self, user: User) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;

        if let Some(wal) = inner.wal.as_mut() {
            wal.append_user(&user)?;
            inner.frames_since_compact += 1;
        }

        debug!(user = %user.user_id, active = user.active, "user registered");
        inner.state.users.register(user);
        Ok(())
    }

    /// Returns false when there is no such user.
    pub fn deactivate_user(&self, user_id: &str) -> Result<bool, StorageError> {
        let Some(mut user) = self.user(user_id)? else {
            return Ok(false);
        };

        user.deactivate();
        self.register_user(user)?;
        Ok(true)
    }

    pub fn user(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.state.users.get(user_id).cloned())
    }

    pub fn users(&self) -> Result<Vec<User>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.state.users.all_users())
    }

    /// Frames appended or replayed since the last compaction.
    pub fn wal_frames(&self) -> Result<usize, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.frames_since_compact)
    }

    /// Folds the WAL into a fresh snapshot. A no-op for in-memory stores.
    pub fn compact(&self) -> Result<(), StorageError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;
        let Inner {
            state,
            wal,
            frames_since_compact,
        } = &mut *inner;

        if let Some(wal) = wal.as_mut() {
            RecoveryManager::compact(path, state, wal)?;
        }
        *frames_since_compact = 0;
        Ok(())
    }
}

impl UnitOfWork for Database {
    fn with_transaction<T, F>(&self, work: F) -> Result<T, WorkflowError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, WorkflowError>,
    {
        let fault = self
            .fault
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .take();

        let mut inner = self.inner.write().map_err(|_| StorageError::Poisoned)?;
        let Inner {
            state,
            wal,
            frames_since_compact,
        } = &mut *inner;

        let mut tx = Transaction::new(state, fault);
        let outcome = work(&mut tx).and_then(|value| {
            tx.trip(FaultPoint::BeforeDurableCommit)?;
            Ok(value)
        });

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                debug!(mutations = tx.journal.len(), error = %e, "transaction rolled back");
                tx.rollback();
                return Err(e);
            }
        };

        if tx.journal.is_empty() {
            return Ok(value);
        }

        if let Some(wal) = wal.as_mut() {
            if let Err(e) = wal.append_batch(&tx.journal) {
                debug!(mutations = tx.journal.len(), error = %e, "commit failed, rolled back");
                tx.rollback();
                return Err(e.into());
            }
            *frames_since_compact += 1;
        }

        debug!(mutations = tx.journal.len(), "transaction committed");
        Ok(value)
    }

    fn get_record(&self, key: RecordKey) -> Result<Option<WorkflowRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.state.record(key).cloned())
    }

    fn list_records(&self, kind: SubjectKind) -> Result<Vec<WorkflowRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.state.records_of(kind))
    }

    fn audit_for(&self, key: RecordKey) -> Result<Vec<AuditLogEntry>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.state.audit.query_by_subject(key))
    }

    fn audit_all(&self) -> Result<Vec<AuditLogEntry>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.state.audit.query_all())
    }

    fn verify_audit(&self) -> Result<(), StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        inner.state.verify()
    }
}

impl IdentityResolver for Database {
    fn user_exists(&self, user_id: &str) -> Result<bool, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        inner.state.users.user_exists(user_id)
    }

    fn user_is_active(&self, user_id: &str) -> Result<bool, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::Poisoned)?;
        inner.state.users.user_is_active(user_id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::core::{LineItem, LineItemInput};
    use crate::workflow::RecordState;
    use tempfile::TempDir;

    fn new_request(maker: &str, created_at: u64) -> NewRecord {
        NewRecord {
            kind: SubjectKind::ProductRequest,
            maker_id: maker.to_string(),
            line_items: LineItem::validate_all(vec![LineItemInput::new("ABC", 1)]).unwrap(),
            source_request_id: None,
            created_at,
        }
    }

    fn created_entry(key: RecordKey) -> NewAuditEntry {
        NewAuditEntry {
            subject: key,
            action: ActionType::Created,
            actor_id: "U1".to_string(),
            old_value: None,
            new_value: None,
            notes: None,
        }
    }

    fn create(db: &Database, created_at: u64) -> WorkflowRecord {
        db.with_transaction(|tx| {
            let record = tx.insert_record(new_request("U1", created_at))?;
            tx.append_audit(created_entry(record.key))?;
            Ok(record)
        })
        .unwrap()
    }

    fn approval(checker: &str) -> Resolution {
        Resolution {
            state: RecordState::Approved,
            checker_id: checker.to_string(),
            resolved_at: 10,
            reason: None,
        }
    }

    #[test]
    fn test_ids_are_per_kind() {
        let db = Database::in_memory();
        create(&db, 1);
        create(&db, 2);

        let dispatch = db
            .with_transaction(|tx| {
                let mut new = new_request("U1", 3);
                new.kind = SubjectKind::Dispatch;
                tx.insert_record(new)
            })
            .unwrap();

        assert_eq!(dispatch.key, RecordKey::dispatch(1));
        assert_eq!(db.list_records(SubjectKind::ProductRequest).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_work_rolls_back_every_write() {
        let db = Database::in_memory();
        create(&db, 1);

        let result: Result<(), WorkflowError> = db.with_transaction(|tx| {
            let record = tx.insert_record(new_request("U1", 2))?;
            tx.append_audit(created_entry(record.key))?;
            Err(WorkflowError::Validation("changed my mind".to_string()))
        });
        assert!(result.is_err());

        assert!(db.get_record(RecordKey::request(2)).unwrap().is_none());
        assert_eq!(db.audit_all().unwrap().len(), 1);
        assert_eq!(create(&db, 3).key, RecordKey::request(2));
        assert!(db.verify_audit().is_ok());
    }

    #[test]
    fn test_resolve_if_pending_is_conditional() {
        let db = Database::in_memory();
        let key = create(&db, 1).key;

        let first = db.with_transaction(|tx| tx.resolve_if_pending(key, approval("U2")));
        assert_eq!(first.unwrap().state, RecordState::Approved);

        let second = db.with_transaction(|tx| tx.resolve_if_pending(key, approval("U3")));
        assert!(matches!(second, Err(WorkflowError::InvalidState(_))));

        let record = db.get_record(key).unwrap().unwrap();
        assert_eq!(record.checker_id.as_deref(), Some("U2"));
    }

    #[test]
    fn test_fault_before_commit() {
        let db = Database::in_memory();
        let key = create(&db, 1).key;

        db.inject_fault(FaultPoint::BeforeDurableCommit);
        let result = db.with_transaction(|tx| {
            tx.resolve_if_pending(key, approval("U2"))?;
            tx.append_audit(created_entry(key))
        });

        assert!(matches!(
            result,
            Err(WorkflowError::Storage(StorageError::InjectedFault(_)))
        ));
        assert!(db.get_record(key).unwrap().unwrap().is_pending());
        assert_eq!(db.audit_for(key).unwrap().len(), 1);
    }

    #[test]
    fn test_list_is_newest_first() {
        let db = Database::in_memory();
        create(&db, 5);
        create(&db, 9);
        // the clock stepped back before the third create
        create(&db, 2);

        let ids: Vec<u64> = db
            .list_records(SubjectKind::ProductRequest)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_verify_detects_missing_history() {
        let db = Database::in_memory();
        db.with_transaction(|tx| tx.insert_record(new_request("U1", 1)))
            .unwrap();

        assert!(matches!(
            db.verify_audit(),
            Err(StorageError::ChainValidation(_))
        ));
    }

    #[test]
    fn test_users_and_identity() {
        let db = Database::in_memory();
        db.register_user(User::new("U1")).unwrap();

        assert!(db.user_exists("U1").unwrap());
        assert!(db.user_is_active("U1").unwrap());
        assert!(db.deactivate_user("U1").unwrap());
        assert!(!db.user_is_active("U1").unwrap());
        assert!(!db.deactivate_user("ghost").unwrap());
    }

    #[test]
    fn test_poisoned_identity_lookup_is_a_storage_error() {
        use crate::error::ErrorKind;
        use crate::service::WorkflowService;
        use crate::workflow::RequestPayload;
        use std::sync::Arc;

        let db = Arc::new(Database::in_memory());
        db.register_user(User::new("U1")).unwrap();

        let holder = db.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.inner.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(matches!(db.user_exists("U1"), Err(StorageError::Poisoned)));

        let service = WorkflowService::new(db.clone(), db);
        let err = service
            .create_request(
                "U1",
                RequestPayload {
                    line_items: vec![LineItemInput::new("ABC", 1)],
                },
            )
            .unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_commits_reach_the_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.idhini");

        let db = Database::open(&path).unwrap();
        db.register_user(User::new("U1")).unwrap();
        create(&db, 1);

        // failed work writes no frame
        let _ = db.with_transaction(|tx| -> Result<(), WorkflowError> {
            tx.insert_record(new_request("U1", 2))?;
            Err(WorkflowError::Validation("no".to_string()))
        });

        assert_eq!(db.wal_frames().unwrap(), 2);
        assert_eq!(db.path(), Some(path.as_path()));
    }
}
