// Write-ahead log: one frame per committed transaction or user change.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::core::{User, now_millis};
use crate::error::StorageError;
use crate::storage::database::Mutation;
use crate::storage::persistence::{encode_batch, encode_user, read_array, read_u32, read_u64};

const APPEND_MAGIC: [u8; 4] = [0x41, 0x50, 0x4E, 0x44]; // "APND"
pub const ENTRY_HEADER_SIZE: usize = 4 + 1 + 8 + 4 + 32 + 4; // 53 bytes total, no padding needed
const HEADER_CHECK_AT: usize = ENTRY_HEADER_SIZE - 4;

/// Upper bound on a single frame body.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

pub const ENTRY_BATCH: u8 = 1;
pub const ENTRY_USER: u8 = 2;

#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub magic: [u8; 4],
    pub entry_type: u8,
    pub timestamp: u64,
    pub data_size: u32,
    pub checksum: [u8; 32],
}

impl AppendEntry {
    pub fn new(entry_type: u8, data_size: u32, checksum: [u8; 32]) -> Self {
        Self {
            magic: APPEND_MAGIC,
            entry_type,
            timestamp: now_millis(),
            data_size,
            checksum,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut bytes = [0u8; ENTRY_HEADER_SIZE];

        let mut put = |at: usize, src: &[u8]| {
            if let Some(dst) = bytes.get_mut(at..at + src.len()) {
                dst.copy_from_slice(src);
            }
        };

        put(0, &self.magic);
        put(4, &[self.entry_type]);
        put(5, &self.timestamp.to_le_bytes());
        put(13, &self.data_size.to_le_bytes());
        put(17, &self.checksum);

        let check = bytes.get(..HEADER_CHECK_AT).map(header_check);
        if let (Some(Ok(check)), Some(dst)) = (check, bytes.get_mut(HEADER_CHECK_AT..)) {
            dst.copy_from_slice(&check);
        }

        bytes
    }

    /// True when the trailing check matches the header fields before it.
    pub fn header_is_intact(bytes: &[u8]) -> Result<bool, StorageError> {
        let stored: [u8; 4] = read_array(bytes, HEADER_CHECK_AT, "header check")?;
        let fields = bytes
            .get(..HEADER_CHECK_AT)
            .ok_or_else(|| StorageError::Deserialization("Short WAL header".to_string()))?;
        Ok(header_check(fields)? == stored)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let [entry_type]: [u8; 1] = read_array(bytes, 4, "entry_type")?;

        Ok(Self {
            magic: read_array(bytes, 0, "magic bytes")?,
            entry_type,
            timestamp: read_u64(bytes, 5, "timestamp")?,
            data_size: read_u32(bytes, 13, "data_size")?,
            checksum: read_array(bytes, 17, "checksum")?,
        })
    }
}

pub fn checksum(data: &[u8]) -> Result<[u8; 32], StorageError> {
    hex::decode(sha256::digest(data))
        .map_err(|e| StorageError::Serialization(format!("Hex decode failed: {}", e)))?
        .try_into()
        .map_err(|_| StorageError::Serialization("Checksum conversion failed".to_string()))
}

fn header_check(fields: &[u8]) -> Result<[u8; 4], StorageError> {
    read_array(&checksum(fields)?, 0, "header check")
}

/// Result of reading the log front to back.
#[derive(Debug, Default)]
pub struct WalScan {
    pub entries: Vec<(AppendEntry, Vec<u8>)>,
    /// Length of the prefix made of complete, verified frames.
    pub valid_len: u64,
    /// Bytes after `valid_len` belonging to a frame whose write never finished.
    pub torn_bytes: u64,
}

pub struct AppendLog {
    path: PathBuf,
    file: File,
    len: u64,
    /// Set when a failed append could not be cut back off the file.
    unusable: bool,
}

impl AppendLog {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        let append_path = Self::path_for(db_path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&append_path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: append_path,
            file,
            len,
            unusable: false,
        })
    }

    pub fn path_for<P: AsRef<Path>>(db_path: P) -> PathBuf {
        let mut append_path = PathBuf::from(db_path.as_ref());
        append_path.set_extension("wal");
        append_path
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append_batch(&mut self, mutations: &[Mutation]) -> Result<(), StorageError> {
        let data = encode_batch(mutations)?;
        self.append_frame(ENTRY_BATCH, &data)
    }

    pub fn append_user(&mut self, user: &User) -> Result<(), StorageError> {
        let data = encode_user(user)?;
        self.append_frame(ENTRY_USER, &data)
    }

    fn append_frame(&mut self, entry_type: u8, data: &[u8]) -> Result<(), StorageError> {
        if self.unusable {
            return Err(StorageError::WalUnusable(
                "an earlier append left a partial frame".to_string(),
            ));
        }

        let data_size = u32::try_from(data.len())
            .ok()
            .filter(|size| *size <= MAX_FRAME_SIZE)
            .ok_or_else(|| StorageError::Serialization("WAL frame too large".to_string()))?;
        let entry = AppendEntry::new(entry_type, data_size, checksum(data)?);

        let mut frame = Vec::with_capacity(ENTRY_HEADER_SIZE + data.len());
        frame.extend_from_slice(&entry.to_bytes());
        frame.extend_from_slice(data);

        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data());

        if let Err(e) = written {
            // cut off whatever part of the frame made it to disk
            if let Err(cut) = self.file.set_len(self.len) {
                self.unusable = true;
                error!(
                    wal = %self.path.display(),
                    write_error = %e,
                    truncate_error = %cut,
                    "partial WAL frame could not be removed"
                );
                return Err(StorageError::WalUnusable(format!(
                    "append failed ({}) and rollback failed ({})",
                    e, cut
                )));
            }
            return Err(e.into());
        }

        self.len += frame.len() as u64;
        Ok(())
    }

    pub fn read_all_entries(&mut self) -> Result<WalScan, StorageError> {
        let mut buffer = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buffer)?;

        let mut scan = WalScan::default();
        let mut offset = 0usize;

        while offset < buffer.len() {
            let Some(header_bytes) = buffer.get(offset..offset + ENTRY_HEADER_SIZE) else {
                break;
            };

            let entry = AppendEntry::from_bytes(header_bytes)?;
            if entry.magic != APPEND_MAGIC {
                return Err(StorageError::Deserialization(format!(
                    "Bad WAL frame magic at offset {}",
                    offset
                )));
            }

            // a fully written header is trusted; only the body can be torn
            if !AppendEntry::header_is_intact(header_bytes)? {
                return Err(StorageError::ChecksumMismatch);
            }
            if entry.data_size > MAX_FRAME_SIZE {
                return Err(StorageError::Deserialization(format!(
                    "WAL frame at offset {} claims {} bytes",
                    offset, entry.data_size
                )));
            }

            let data_start = offset + ENTRY_HEADER_SIZE;
            let data_end = data_start + entry.data_size as usize;
            let Some(data) = buffer.get(data_start..data_end) else {
                break;
            };

            if checksum(data)? != entry.checksum {
                return Err(StorageError::ChecksumMismatch);
            }

            scan.entries.push((entry, data.to_vec()));
            offset = data_end;
        }

        scan.valid_len = offset as u64;
        scan.torn_bytes = (buffer.len() - offset) as u64;
        Ok(scan)
    }

    pub fn truncate_to(&mut self, len: u64) -> Result<(), StorageError> {
        self.file.set_len(len)?;
        self.file.sync_data()?;
        self.len = len;
        self.unusable = false;
        Ok(())
    }

    pub fn truncate(&mut self) -> Result<(), StorageError> {
        self.truncate_to(0)
    }

}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::panic)]
    #![allow(unused_must_use)]

    use super::*;
    use crate::core::{ActionType, AuditTrail, NewAuditEntry, RecordKey};
    use crate::storage::persistence::{decode_batch, decode_user};
    use std::fs;
    use tempfile::TempDir;

    fn db_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.idhini")
    }

    fn audit_mutation(subject: RecordKey) -> Mutation {
        let trail = AuditTrail::new();
        let entry = trail.seal(
            NewAuditEntry {
                subject,
                action: ActionType::Created,
                actor_id: "U1".to_string(),
                old_value: None,
                new_value: None,
                notes: None,
            },
            1,
        );
        Mutation::AppendAudit(entry)
    }

    #[test]
    fn test_entry_serialization() {
        let checksum = [7u8; 32];
        let entry = AppendEntry::new(ENTRY_BATCH, 100, checksum);

        let bytes = entry.to_bytes();
        let entry2 = AppendEntry::from_bytes(&bytes).unwrap();

        assert_eq!(entry.magic, entry2.magic);
        assert_eq!(entry.entry_type, entry2.entry_type);
        assert_eq!(entry.timestamp, entry2.timestamp);
        assert_eq!(entry.data_size, entry2.data_size);
        assert_eq!(entry.checksum, entry2.checksum);
    }

    #[test]
    fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();

        let scan = append_log.read_all_entries().unwrap();
        assert!(scan.entries.is_empty());
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn test_mixed_entries_keep_order() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();

        append_log.append_user(&User::new("U1")).unwrap();
        append_log
            .append_batch(&[audit_mutation(RecordKey::request(1))])
            .unwrap();
        append_log.append_user(&User::new("U2")).unwrap();

        let scan = append_log.read_all_entries().unwrap();
        assert_eq!(scan.entries.len(), 3);
        assert_eq!(scan.entries[0].0.entry_type, ENTRY_USER);
        assert_eq!(scan.entries[1].0.entry_type, ENTRY_BATCH);
        assert_eq!(scan.entries[2].0.entry_type, ENTRY_USER);
        assert_eq!(scan.valid_len, append_log.len());

        let user = decode_user(&scan.entries[2].1).unwrap();
        assert_eq!(user.user_id, "U2");

        let batch = decode_batch(&scan.entries[1].1).unwrap();
        assert!(matches!(&batch[0], Mutation::AppendAudit(e) if e.subject == RecordKey::request(1)));
    }

    #[test]
    fn test_file_persistence_simple() {
        let dir = TempDir::new().unwrap();

        {
            let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
            append_log.append_user(&User::new("persistent_user")).unwrap();
        }

        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        assert!(!append_log.is_empty());
        assert_eq!(append_log.read_all_entries().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_torn_tail_is_reported_not_returned() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();

        append_log.append_user(&User::new("U1")).unwrap();
        let committed = append_log.len();
        append_log.append_user(&User::new("U2")).unwrap();
        drop(append_log);

        // chop the second frame in half, as a crash mid-write would
        let wal_path = AppendLog::path_for(db_path(&dir));
        let full = fs::metadata(&wal_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
        file.set_len(committed + (full - committed) / 2).unwrap();
        drop(file);

        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        let scan = append_log.read_all_entries().unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.valid_len, committed);
        assert!(scan.torn_bytes > 0);
    }

    #[test]
    fn test_checksum_failure() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        append_log.append_user(&User::new("test_user")).unwrap();
        drop(append_log);

        // Reopen file nd corrupt the stored checksum
        let wal_path = AppendLog::path_for(db_path(&dir));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&wal_path)
            .unwrap();

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        file.read_exact(&mut header).unwrap();

        // checksum starts at byte 17
        header[17] = header[17].wrapping_add(1);

        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&header).unwrap();
        file.flush().unwrap();

        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        match append_log.read_all_entries() {
            Err(StorageError::ChecksumMismatch) => {}
            other => panic!("Expected ChecksumMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_size_in_earlier_frame_is_not_a_torn_tail() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        for id in ["U1", "U2", "U3"] {
            append_log.append_user(&User::new(id)).unwrap();
        }
        drop(append_log);

        let wal_path = AppendLog::path_for(db_path(&dir));
        let mut bytes = fs::read(&wal_path).unwrap();
        bytes[13..17].copy_from_slice(&0x7fff_ffffu32.to_le_bytes());
        fs::write(&wal_path, &bytes).unwrap();

        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        assert!(matches!(
            append_log.read_all_entries(),
            Err(StorageError::ChecksumMismatch)
        ));
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), bytes.len() as u64);
    }

    #[test]
    fn test_header_check_round_trip() {
        let entry = AppendEntry::new(ENTRY_USER, 12, [3u8; 32]);
        let mut bytes = entry.to_bytes();
        assert!(AppendEntry::header_is_intact(&bytes).unwrap());

        bytes[4] = ENTRY_BATCH;
        assert!(!AppendEntry::header_is_intact(&bytes).unwrap());
    }

    #[test]
    fn test_unusable_log_refuses_appends_until_truncated() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();
        append_log.append_user(&User::new("U1")).unwrap();
        let len = append_log.len();

        append_log.unusable = true;
        assert!(matches!(
            append_log.append_user(&User::new("U2")),
            Err(StorageError::WalUnusable(_))
        ));
        assert_eq!(append_log.len(), len);
        assert_eq!(append_log.read_all_entries().unwrap().entries.len(), 1);

        append_log.truncate().unwrap();
        append_log.append_user(&User::new("U2")).unwrap();
        assert_eq!(append_log.read_all_entries().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let mut append_log = AppendLog::new(db_path(&dir)).unwrap();

        append_log.append_user(&User::new("test_user")).unwrap();
        append_log.truncate().unwrap();
        assert!(append_log.is_empty());
        assert!(append_log.read_all_entries().unwrap().entries.is_empty());

        append_log.append_user(&User::new("test_user2")).unwrap();
        assert_eq!(append_log.read_all_entries().unwrap().entries.len(), 1);
    }
}
