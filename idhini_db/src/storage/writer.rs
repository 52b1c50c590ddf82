use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::StorageError;
use crate::storage::append::checksum;
use crate::storage::database::StoreState;
use crate::storage::persistence::{
    DatabaseBody, DatabaseFooter, DatabaseHeader, FOOTER_SIZE, HEADER_SIZE, SerializableAuditEntry,
    SerializableRecord, SerializableUser, encode_body,
};

pub struct DatabaseWriter {
    file: File,
}

impl DatabaseWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self { file })
    }

    /// Writes header, body and footer, then syncs. Returns the file size.
    pub fn write_state(&mut self, state: &StoreState) -> Result<u64, StorageError> {
        let records: Vec<SerializableRecord> = state
            .records
            .values()
            .map(SerializableRecord::from)
            .collect();

        let audit: Vec<SerializableAuditEntry> = state
            .audit
            .all_entries()
            .map(SerializableAuditEntry::from)
            .collect();

        let users: Vec<SerializableUser> = state
            .users
            .all_users()
            .iter()
            .map(SerializableUser::from)
            .collect();

        let body = DatabaseBody {
            records,
            audit,
            users,
            next_request_id: state.next_request_id,
            next_dispatch_id: state.next_dispatch_id,
        };
        let body_bytes = encode_body(&body)?;

        let mut header = DatabaseHeader::new(
            body.records.len() as u64,
            body.audit.len() as u64,
            body.users.len() as u64,
            body_bytes.len() as u64,
        );
        header.checksum = checksum(&body_bytes)?;
        let header_bytes = header.to_bytes();

        let mut pre_footer_data = Vec::with_capacity(HEADER_SIZE + body_bytes.len());
        pre_footer_data.extend_from_slice(&header_bytes);
        pre_footer_data.extend_from_slice(&body_bytes);

        let total_file_size = (pre_footer_data.len() + FOOTER_SIZE) as u64;
        let footer = DatabaseFooter {
            integrity_hash: checksum(&pre_footer_data)?,
            total_file_size,
        };

        self.file.write_all(&pre_footer_data)?;
        self.file.write_all(&footer.to_bytes())?;
        self.file.flush()?;
        self.file.sync_all()?;

        Ok(total_file_size)
    }
}
