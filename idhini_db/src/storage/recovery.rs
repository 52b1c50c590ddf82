use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::{AuditLogEntry, SubjectKind, User, WorkflowRecord};
use crate::error::StorageError;
use crate::storage::append::{AppendEntry, AppendLog, ENTRY_BATCH, ENTRY_USER};
use crate::storage::database::{Mutation, StoreState};
use crate::storage::persistence::{DatabaseBody, decode_batch, decode_user};
use crate::storage::reader::DatabaseReader;
use crate::storage::writer::DatabaseWriter;

/// State rebuilt from disk, plus the log new commits will go to.
pub struct Recovered {
    pub state: StoreState,
    pub wal: AppendLog,
    pub replayed_frames: usize,
}

pub struct RecoveryManager;

impl RecoveryManager {
    /// Loads the snapshot (if any) and replays the WAL on top of it.
    ///
    /// A torn final frame is cut off and logged; corruption anywhere else is
    /// an error, as is a snapshot that fails verification.
    pub fn recover<P: AsRef<Path>>(db_path: P) -> Result<Recovered, StorageError> {
        let db_path = db_path.as_ref();
        Self::remove_stale_tmp(db_path)?;

        let mut state = if db_path.exists() {
            let (_header, body) = DatabaseReader::new(db_path)?.read_and_verify()?;
            Self::reconstruct_from_body(body)?
        } else {
            StoreState::new()
        };

        let mut wal = AppendLog::new(db_path)?;
        let scan = wal.read_all_entries()?;

        if scan.torn_bytes > 0 {
            warn!(
                wal = %wal.path().display(),
                torn_bytes = scan.torn_bytes,
                kept_bytes = scan.valid_len,
                "truncating incomplete WAL frame"
            );
            wal.truncate_to(scan.valid_len)?;
        }

        let replayed_frames = scan.entries.len();
        Self::replay_wal(&mut state, scan.entries)?;
        state.verify()?;

        if replayed_frames > 0 {
            info!(
                path = %db_path.display(),
                frames = replayed_frames,
                "replayed WAL"
            );
        }

        Ok(Recovered {
            state,
            wal,
            replayed_frames,
        })
    }

    fn reconstruct_from_body(body: DatabaseBody) -> Result<StoreState, StorageError> {
        let mut state = StoreState::new();

        for ser_user in body.users {
            state.users.register(User::from(ser_user));
        }

        for ser_record in body.records {
            let record = WorkflowRecord::try_from(ser_record)?;
            state.records.insert(record.key, record);
        }

        let mut audit: Vec<AuditLogEntry> = body
            .audit
            .into_iter()
            .map(AuditLogEntry::try_from)
            .collect::<Result<_, _>>()?;
        audit.sort_by_key(|entry| entry.log_id);

        // append re-checks every link on the way in
        for entry in audit {
            state.audit.append(entry)?;
        }

        state.next_request_id = body
            .next_request_id
            .max(Self::first_free_id(&state, SubjectKind::ProductRequest));
        state.next_dispatch_id = body
            .next_dispatch_id
            .max(Self::first_free_id(&state, SubjectKind::Dispatch));

        Ok(state)
    }

    fn first_free_id(state: &StoreState, kind: SubjectKind) -> u64 {
        state
            .records
            .keys()
            .filter(|key| key.kind == kind)
            .map(|key| key.id + 1)
            .max()
            .unwrap_or(1)
    }

    fn replay_wal(
        state: &mut StoreState,
        entries: Vec<(AppendEntry, Vec<u8>)>,
    ) -> Result<(), StorageError> {
        for (entry, data) in entries {
            match entry.entry_type {
                ENTRY_BATCH => {
                    let batch = decode_batch(&data)?;

                    if Self::already_applied(state, &batch) {
                        debug!(mutations = batch.len(), "skipping batch already in snapshot");
                        continue;
                    }

                    for mutation in &batch {
                        state.apply(mutation)?;
                    }
                }
                ENTRY_USER => {
                    state.users.register(decode_user(&data)?);
                }
                _ => {
                    return Err(StorageError::Deserialization(format!(
                        "Unknown entry type: {}",
                        entry.entry_type
                    )));
                }
            }
        }

        Ok(())
    }

    /// A compaction that crashed after the snapshot rename but before the WAL
    /// truncate leaves frames whose effects the snapshot already holds.
    fn already_applied(state: &StoreState, batch: &[Mutation]) -> bool {
        let audit_len = state.audit.len() as u64;

        batch.iter().any(|mutation| match mutation {
            Mutation::AppendAudit(entry) => entry.log_id <= audit_len,
            Mutation::InsertRecord(record) => state.records.contains_key(&record.key),
            Mutation::ResolveRecord { .. } => false,
        })
    }

    fn tmp_path(db_path: &Path) -> PathBuf {
        PathBuf::from(format!("{}.tmp", db_path.display()))
    }

    fn remove_stale_tmp(db_path: &Path) -> Result<(), StorageError> {
        let tmp = Self::tmp_path(db_path);
        if tmp.exists() {
            debug!(path = %tmp.display(), "removing unfinished snapshot");
            fs::remove_file(&tmp)?;
        }
        Ok(())
    }

    /// Writes a fresh snapshot next to the old one, renames it into place and
    /// only then empties the WAL.
    pub fn compact<P: AsRef<Path>>(
        db_path: P,
        state: &StoreState,
        wal: &mut AppendLog,
    ) -> Result<(), StorageError> {
        let db_path = db_path.as_ref();
        let tmp = Self::tmp_path(db_path);

        let size = Self::create_snapshot(state, &tmp)?;
        fs::rename(&tmp, db_path)?;
        // the rename must be durable before the frames it replaces are dropped
        Self::sync_parent_dir(db_path)?;
        let folded = wal.len();
        wal.truncate()?;

        info!(
            path = %db_path.display(),
            snapshot_bytes = size,
            wal_bytes = folded,
            "compacted"
        );
        Ok(())
    }

    #[cfg(unix)]
    fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::File::open(parent)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
        Ok(())
    }

    pub fn create_snapshot<P: AsRef<Path>>(
        state: &StoreState,
        snapshot_path: P,
    ) -> Result<u64, StorageError> {
        let mut writer = DatabaseWriter::new(snapshot_path)?;
        writer.write_state(state)
    }

    pub fn verify_file<P: AsRef<Path>>(db_path: P) -> Result<bool, StorageError> {
        let reader = DatabaseReader::new(db_path)?;
        reader.read_and_verify()?;
        Ok(true)
    }
}
