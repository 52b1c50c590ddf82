use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::core::{
    ActionType, AuditLogEntry, LineItem, RecordKey, SubjectKind, User, WorkflowRecord,
};
use crate::error::StorageError;
use crate::storage::database::Mutation;
use crate::workflow::{RecordState, Resolution};

pub const MAGIC_NUMBER: [u8; 4] = [0x49, 0x44, 0x48, 0x4E]; // "IDHN"
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
pub const HEADER_SIZE: usize = 96;
pub const FOOTER_SIZE: usize = 32 + 8;

/// Fixed-size snapshot header, little endian.
///
/// ```text
/// 0..4    magic           4..6    version major/minor   6..8 reserved
/// 8..16   record_count    16..24  audit_count           24..32 user_count
/// 32..40  created         40..48  body_offset           48..56 body_len
/// 56..88  body checksum   88..96  reserved
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub magic: [u8; 4],
    pub version_major: u8,
    pub version_minor: u8,
    pub record_count: u64,
    pub audit_count: u64,
    pub user_count: u64,
    pub created_timestamp: u64,
    pub body_offset: u64,
    pub body_len: u64,
    pub checksum: [u8; 32],
}

impl DatabaseHeader {
    pub fn new(record_count: u64, audit_count: u64, user_count: u64, body_len: u64) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            record_count,
            audit_count,
            user_count,
            created_timestamp: crate::core::now_millis(),
            body_offset: HEADER_SIZE as u64,
            body_len,
            checksum: [0; 32],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut put = |at: usize, src: &[u8]| {
            if let Some(dst) = bytes.get_mut(at..at + src.len()) {
                dst.copy_from_slice(src);
            }
        };

        put(0, &self.magic);
        put(4, &[self.version_major, self.version_minor]);
        put(8, &self.record_count.to_le_bytes());
        put(16, &self.audit_count.to_le_bytes());
        put(24, &self.user_count.to_le_bytes());
        put(32, &self.created_timestamp.to_le_bytes());
        put(40, &self.body_offset.to_le_bytes());
        put(48, &self.body_len.to_le_bytes());
        put(56, &self.checksum);

        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let magic: [u8; 4] = read_array(bytes, 0, "magic")?;
        let [version_major, version_minor]: [u8; 2] = read_array(bytes, 4, "version")?;

        Ok(Self {
            magic,
            version_major,
            version_minor,
            record_count: read_u64(bytes, 8, "record_count")?,
            audit_count: read_u64(bytes, 16, "audit_count")?,
            user_count: read_u64(bytes, 24, "user_count")?,
            created_timestamp: read_u64(bytes, 32, "created_timestamp")?,
            body_offset: read_u64(bytes, 40, "body_offset")?,
            body_len: read_u64(bytes, 48, "body_len")?,
            checksum: read_array(bytes, 56, "checksum")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFooter {
    pub integrity_hash: [u8; 32], // sha256 of header + body
    pub total_file_size: u64,
}

impl DatabaseFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        if let Some(dst) = bytes.get_mut(0..32) {
            dst.copy_from_slice(&self.integrity_hash);
        }
        if let Some(dst) = bytes.get_mut(32..40) {
            dst.copy_from_slice(&self.total_file_size.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(Self {
            integrity_hash: read_array(bytes, 0, "integrity_hash")?,
            total_file_size: read_u64(bytes, 32, "total_file_size")?,
        })
    }
}

pub(crate) fn read_array<const N: usize>(
    bytes: &[u8],
    at: usize,
    field: &str,
) -> Result<[u8; N], StorageError> {
    bytes
        .get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StorageError::Deserialization(format!("Failed to read {}", field)))
}

pub(crate) fn read_u64(bytes: &[u8], at: usize, field: &str) -> Result<u64, StorageError> {
    read_array::<8>(bytes, at, field).map(u64::from_le_bytes)
}

pub(crate) fn read_u32(bytes: &[u8], at: usize, field: &str) -> Result<u32, StorageError> {
    read_array::<4>(bytes, at, field).map(u32::from_le_bytes)
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct SerializableLineItem {
    pub line_number: u32,
    pub sku: String,
    pub quantity: u32,
    pub note: Option<String>,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct SerializableRecord {
    pub kind: u8,
    pub id: u64,
    pub state: u8,
    pub maker_id: String,
    pub checker_id: Option<String>,
    pub created_at: u64,
    pub resolved_at: Option<u64>,
    pub resolution_reason: Option<String>,
    pub source_request_id: Option<u64>,
    pub line_items: Vec<SerializableLineItem>,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct SerializableAuditEntry {
    pub log_id: u64,
    pub kind: u8,
    pub subject_id: u64,
    pub action: u8,
    pub actor_id: String,
    pub timestamp: u64,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub notes: Option<String>,
    pub prev_hash: String,
    pub entry_hash: String,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
pub struct SerializableUser {
    pub user_id: String,
    pub roles: Vec<String>,
    pub active: bool,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
pub enum SerializableMutation {
    InsertRecord(SerializableRecord),
    ResolveRecord {
        kind: u8,
        id: u64,
        state: u8,
        checker_id: String,
        resolved_at: u64,
        reason: Option<String>,
    },
    AppendAudit(SerializableAuditEntry),
}

/// One committed transaction; the unit of a WAL frame.
#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
pub struct SerializableBatch {
    pub mutations: Vec<SerializableMutation>,
}

#[derive(Archive, Serialize, Deserialize, Debug)]
pub struct DatabaseBody {
    pub records: Vec<SerializableRecord>,
    pub audit: Vec<SerializableAuditEntry>,
    pub users: Vec<SerializableUser>,
    pub next_request_id: u64,
    pub next_dispatch_id: u64,
}

fn kind_from(code: u8) -> Result<SubjectKind, StorageError> {
    SubjectKind::from_code(code)
        .ok_or_else(|| StorageError::Deserialization(format!("Unknown record kind {}", code)))
}

fn state_from(code: u8) -> Result<RecordState, StorageError> {
    RecordState::from_code(code)
        .ok_or_else(|| StorageError::Deserialization(format!("Unknown record state {}", code)))
}

impl From<&LineItem> for SerializableLineItem {
    fn from(item: &LineItem) -> Self {
        Self {
            line_number: item.line_number,
            sku: item.sku.clone(),
            quantity: item.quantity,
            note: item.note.clone(),
        }
    }
}

impl From<SerializableLineItem> for LineItem {
    fn from(item: SerializableLineItem) -> Self {
        Self {
            line_number: item.line_number,
            sku: item.sku,
            quantity: item.quantity,
            note: item.note,
        }
    }
}

impl From<&WorkflowRecord> for SerializableRecord {
    fn from(record: &WorkflowRecord) -> Self {
        Self {
            kind: record.key.kind.code(),
            id: record.key.id,
            state: record.state.code(),
            maker_id: record.maker_id.clone(),
            checker_id: record.checker_id.clone(),
            created_at: record.created_at,
            resolved_at: record.resolved_at,
            resolution_reason: record.resolution_reason.clone(),
            source_request_id: record.source_request_id,
            line_items: record.line_items.iter().map(SerializableLineItem::from).collect(),
        }
    }
}

impl TryFrom<SerializableRecord> for WorkflowRecord {
    type Error = StorageError;

    fn try_from(ser: SerializableRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            key: RecordKey::new(kind_from(ser.kind)?, ser.id),
            state: state_from(ser.state)?,
            maker_id: ser.maker_id,
            checker_id: ser.checker_id,
            created_at: ser.created_at,
            resolved_at: ser.resolved_at,
            resolution_reason: ser.resolution_reason,
            source_request_id: ser.source_request_id,
            line_items: ser.line_items.into_iter().map(LineItem::from).collect(),
        })
    }
}

impl From<&AuditLogEntry> for SerializableAuditEntry {
    fn from(entry: &AuditLogEntry) -> Self {
        Self {
            log_id: entry.log_id,
            kind: entry.subject.kind.code(),
            subject_id: entry.subject.id,
            action: entry.action.code(),
            actor_id: entry.actor_id.clone(),
            timestamp: entry.timestamp,
            old_value: entry.old_value.clone(),
            new_value: entry.new_value.clone(),
            notes: entry.notes.clone(),
            prev_hash: entry.prev_hash.clone(),
            entry_hash: entry.entry_hash.clone(),
        }
    }
}

impl TryFrom<SerializableAuditEntry> for AuditLogEntry {
    type Error = StorageError;

    fn try_from(ser: SerializableAuditEntry) -> Result<Self, Self::Error> {
        let action = ActionType::from_code(ser.action).ok_or_else(|| {
            StorageError::Deserialization(format!("Unknown audit action {}", ser.action))
        })?;

        Ok(Self {
            log_id: ser.log_id,
            subject: RecordKey::new(kind_from(ser.kind)?, ser.subject_id),
            action,
            actor_id: ser.actor_id,
            timestamp: ser.timestamp,
            old_value: ser.old_value,
            new_value: ser.new_value,
            notes: ser.notes,
            prev_hash: ser.prev_hash,
            entry_hash: ser.entry_hash,
        })
    }
}

impl From<&User> for SerializableUser {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id.clone(),
            roles: user.roles.iter().cloned().collect(),
            active: user.active,
        }
    }
}

impl From<SerializableUser> for User {
    fn from(ser: SerializableUser) -> Self {
        let mut user = User::new(&ser.user_id);
        for role in &ser.roles {
            user.add_role(role);
        }
        user.active = ser.active;
        user
    }
}

impl From<&Mutation> for SerializableMutation {
    fn from(mutation: &Mutation) -> Self {
        match mutation {
            Mutation::InsertRecord(record) => Self::InsertRecord(record.into()),
            Mutation::ResolveRecord { key, resolution } => Self::ResolveRecord {
                kind: key.kind.code(),
                id: key.id,
                state: resolution.state.code(),
                checker_id: resolution.checker_id.clone(),
                resolved_at: resolution.resolved_at,
                reason: resolution.reason.clone(),
            },
            Mutation::AppendAudit(entry) => Self::AppendAudit(entry.into()),
        }
    }
}

impl TryFrom<SerializableMutation> for Mutation {
    type Error = StorageError;

    fn try_from(ser: SerializableMutation) -> Result<Self, Self::Error> {
        Ok(match ser {
            SerializableMutation::InsertRecord(record) => {
                Mutation::InsertRecord(record.try_into()?)
            }
            SerializableMutation::ResolveRecord {
                kind,
                id,
                state,
                checker_id,
                resolved_at,
                reason,
            } => Mutation::ResolveRecord {
                key: RecordKey::new(kind_from(kind)?, id),
                resolution: Resolution {
                    state: state_from(state)?,
                    checker_id,
                    resolved_at,
                    reason,
                },
            },
            SerializableMutation::AppendAudit(entry) => Mutation::AppendAudit(entry.try_into()?),
        })
    }
}

// rkyv wants its input aligned, bytes read from disk are not
fn aligned(data: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(data.len());
    buf.extend_from_slice(data);
    buf
}

pub fn encode_batch(mutations: &[Mutation]) -> Result<Vec<u8>, StorageError> {
    let batch = SerializableBatch {
        mutations: mutations.iter().map(SerializableMutation::from).collect(),
    };

    rkyv::to_bytes::<RkyvError>(&batch)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

pub fn decode_batch(data: &[u8]) -> Result<Vec<Mutation>, StorageError> {
    let batch = rkyv::from_bytes::<SerializableBatch, RkyvError>(&aligned(data))
        .map_err(|e| StorageError::Deserialization(format!("Failed to decode WAL batch: {}", e)))?;

    batch.mutations.into_iter().map(Mutation::try_from).collect()
}

pub fn encode_user(user: &User) -> Result<Vec<u8>, StorageError> {
    rkyv::to_bytes::<RkyvError>(&SerializableUser::from(user))
        .map(|bytes| bytes.to_vec())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

pub fn decode_user(data: &[u8]) -> Result<User, StorageError> {
    rkyv::from_bytes::<SerializableUser, RkyvError>(&aligned(data))
        .map(User::from)
        .map_err(|e| StorageError::Deserialization(format!("Failed to decode WAL user: {}", e)))
}

pub fn encode_body(body: &DatabaseBody) -> Result<Vec<u8>, StorageError> {
    rkyv::to_bytes::<RkyvError>(body)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

pub fn decode_body(data: &[u8]) -> Result<DatabaseBody, StorageError> {
    rkyv::from_bytes::<DatabaseBody, RkyvError>(&aligned(data))
        .map_err(|e| StorageError::Deserialization(format!("Body corruption: {}", e)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = DatabaseHeader::new(3, 7, 2, 1024);
        header.checksum = [0xAB; 32];

        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"IDHN");
        assert_eq!(bytes[88..96], [0u8; 8]);

        let parsed = DatabaseHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_short_header_is_an_error() {
        let header = DatabaseHeader::new(0, 0, 0, 0).to_bytes();
        assert!(DatabaseHeader::from_bytes(&header[..40]).is_err());
    }

    #[test]
    fn test_unknown_codes_rejected() {
        let ser = SerializableRecord {
            kind: 9,
            id: 1,
            state: 0,
            maker_id: "U1".to_string(),
            checker_id: None,
            created_at: 0,
            resolved_at: None,
            resolution_reason: None,
            source_request_id: None,
            line_items: vec![],
        };

        assert!(matches!(
            WorkflowRecord::try_from(ser),
            Err(StorageError::Deserialization(_))
        ));
    }

    #[test]
    fn test_user_keeps_active_flag() {
        let mut user = User::new("U7").with_role("checker");
        user.deactivate();

        let decoded = decode_user(&encode_user(&user).unwrap()).unwrap();
        assert_eq!(decoded, user);
    }
}
