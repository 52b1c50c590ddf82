use std::fs;
use std::path::Path;

use crate::error::StorageError;
use crate::storage::append::checksum;
use crate::storage::persistence::{
    DatabaseBody, DatabaseFooter, DatabaseHeader, FOOTER_SIZE, HEADER_SIZE, MAGIC_NUMBER,
    VERSION_MAJOR, decode_body,
};

pub struct DatabaseReader {
    buffer: Vec<u8>,
}

impl DatabaseReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        // snapshot the file into memory so a concurrent writer cannot change it mid-read
        let buffer = fs::read(path)?;
        Ok(Self { buffer })
    }

    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self { buffer }
    }

    pub fn read_header(&self) -> Result<DatabaseHeader, StorageError> {
        let header_slice = self.buffer.get(..HEADER_SIZE).ok_or_else(|| {
            StorageError::Deserialization("File truncated: missing header".to_string())
        })?;

        let header = DatabaseHeader::from_bytes(header_slice)?;

        if header.magic != MAGIC_NUMBER {
            return Err(StorageError::InvalidMagic);
        }

        if header.version_major != VERSION_MAJOR {
            return Err(StorageError::UnsupportedVersion(
                header.version_major,
                header.version_minor,
            ));
        }

        Ok(header)
    }

    pub fn read_and_verify(&self) -> Result<(DatabaseHeader, DatabaseBody), StorageError> {
        let header = self.read_header()?;

        let body_start = usize::try_from(header.body_offset)
            .map_err(|_| StorageError::Deserialization("Body offset overflow".to_string()))?;
        let body_len = usize::try_from(header.body_len)
            .map_err(|_| StorageError::Deserialization("Body length overflow".to_string()))?;
        let body_end = body_start.checked_add(body_len).ok_or_else(|| {
            StorageError::Deserialization("Body length overflow".to_string())
        })?;

        let body_bytes = self.buffer.get(body_start..body_end).ok_or_else(|| {
            StorageError::Deserialization(
                "Header offsets point outside file boundaries".to_string(),
            )
        })?;

        if checksum(body_bytes)? != header.checksum {
            return Err(StorageError::ChecksumMismatch);
        }

        let footer_bytes = self
            .buffer
            .get(body_end..body_end + FOOTER_SIZE)
            .ok_or_else(|| {
                StorageError::Deserialization("File truncated: missing footer".to_string())
            })?;
        let footer = DatabaseFooter::from_bytes(footer_bytes)?;

        if footer.total_file_size != self.buffer.len() as u64 {
            return Err(StorageError::ValidationFailed(format!(
                "File size {} does not match footer ({})",
                self.buffer.len(),
                footer.total_file_size
            )));
        }

        let pre_footer = self.buffer.get(..body_end).ok_or_else(|| {
            StorageError::Deserialization("File truncated".to_string())
        })?;
        if checksum(pre_footer)? != footer.integrity_hash {
            return Err(StorageError::ChecksumMismatch);
        }

        let body = decode_body(body_bytes)?;

        if body.records.len() as u64 != header.record_count
            || body.audit.len() as u64 != header.audit_count
            || body.users.len() as u64 != header.user_count
        {
            return Err(StorageError::ValidationFailed(
                "Header counts do not match body".to_string(),
            ));
        }

        Ok((header, body))
    }
}
