use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha256::digest;

use crate::core::RecordKey;
use crate::error::StorageError;

/// Seed hashed into the first entry of every trail.
const CHAIN_SEED: &str = "IDHINI_AUDIT_CHAIN_SEED_V1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Created,
    Approved,
    Rejected,
}

impl ActionType {
    pub fn code(self) -> u8 {
        match self {
            ActionType::Created => 1,
            ActionType::Approved => 2,
            ActionType::Rejected => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ActionType::Created),
            2 => Some(ActionType::Approved),
            3 => Some(ActionType::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Created => "created",
            ActionType::Approved => "approved",
            ActionType::Rejected => "rejected",
        }
    }

    pub fn is_resolution(self) -> bool {
        !matches!(self, ActionType::Created)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit event that has not been sealed into the trail yet.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub subject: RecordKey,
    pub action: ActionType,
    pub actor_id: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub log_id: u64,
    pub subject: RecordKey,
    pub action: ActionType,
    pub actor_id: String,
    pub timestamp: u64,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub notes: Option<String>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditLogEntry {
    fn compute_hash(&self) -> String {
        let material = json!([
            self.prev_hash,
            self.log_id,
            self.subject.kind.code(),
            self.subject.id,
            self.action.as_str(),
            self.actor_id,
            self.timestamp,
            self.old_value,
            self.new_value,
            self.notes,
        ]);

        digest(material.to_string())
    }
}

/// Append-only, hash-chained event log. Log ids start at 1 and are the
/// canonical replay order.
#[derive(Debug, Default)]
pub struct AuditTrail {
    entries: Vec<AuditLogEntry>,
    by_subject: HashMap<RecordKey, Vec<usize>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&AuditLogEntry> {
        self.entries.last()
    }

    pub fn next_log_id(&self) -> u64 {
        self.entries.len() as u64 + 1
    }

    /// Assigns the next log id, a non-decreasing timestamp and the chain hash.
    /// Does not append; the result goes through [`AuditTrail::append`].
    pub fn seal(&self, entry: NewAuditEntry, now: u64) -> AuditLogEntry {
        let (prev_hash, timestamp) = match self.entries.last() {
            Some(last) => (last.entry_hash.clone(), now.max(last.timestamp)),
            None => (digest(CHAIN_SEED), now),
        };

        let mut sealed = AuditLogEntry {
            log_id: self.next_log_id(),
            subject: entry.subject,
            action: entry.action,
            actor_id: entry.actor_id,
            timestamp,
            old_value: entry.old_value,
            new_value: entry.new_value,
            notes: entry.notes,
            prev_hash,
            entry_hash: String::new(),
        };
        sealed.entry_hash = sealed.compute_hash();
        sealed
    }

    /// Appends a sealed entry, refusing anything that does not extend the chain.
    pub fn append(&mut self, entry: AuditLogEntry) -> Result<(), StorageError> {
        let expected_id = self.next_log_id();
        if entry.log_id != expected_id {
            return Err(StorageError::ChainValidation(format!(
                "expected log id {}, got {}",
                expected_id, entry.log_id
            )));
        }

        let expected_prev = match self.entries.last() {
            Some(last) => last.entry_hash.clone(),
            None => digest(CHAIN_SEED),
        };
        if entry.prev_hash != expected_prev {
            return Err(StorageError::ChainValidation(format!(
                "entry {} does not link to its predecessor",
                entry.log_id
            )));
        }

        let position = self.entries.len();
        self.by_subject
            .entry(entry.subject)
            .or_default()
            .push(position);
        self.entries.push(entry);
        Ok(())
    }

    /// Undo of the most recent append for a transaction that did not commit.
    pub(crate) fn rollback_last(&mut self) -> Option<AuditLogEntry> {
        let entry = self.entries.pop()?;
        if let Some(positions) = self.by_subject.get_mut(&entry.subject) {
            positions.pop();
            if positions.is_empty() {
                self.by_subject.remove(&entry.subject);
            }
        }
        Some(entry)
    }

    /// Entries for one record, oldest first.
    pub fn query_by_subject(&self, subject: RecordKey) -> Vec<AuditLogEntry> {
        self.by_subject
            .get(&subject)
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|&i| self.entries.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The whole trail, newest first.
    pub fn query_all(&self) -> Vec<AuditLogEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = &AuditLogEntry> {
        self.entries.iter()
    }

    pub fn verify_chain(&self) -> Result<(), StorageError> {
        let mut prev_hash = digest(CHAIN_SEED);
        let mut prev_timestamp = 0;

        for (position, entry) in self.entries.iter().enumerate() {
            let expected_id = position as u64 + 1;
            if entry.log_id != expected_id {
                return Err(StorageError::ChainValidation(format!(
                    "log id {} found at position {}",
                    entry.log_id, expected_id
                )));
            }

            if entry.prev_hash != prev_hash {
                return Err(StorageError::ChainValidation(format!(
                    "entry {} does not link to its predecessor",
                    entry.log_id
                )));
            }

            if entry.compute_hash() != entry.entry_hash {
                return Err(StorageError::ChainValidation(format!(
                    "entry {} content does not match its hash",
                    entry.log_id
                )));
            }

            if entry.timestamp < prev_timestamp {
                return Err(StorageError::ChainValidation(format!(
                    "entry {} is timestamped before its predecessor",
                    entry.log_id
                )));
            }

            prev_hash = entry.entry_hash.clone();
            prev_timestamp = entry.timestamp;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::indexing_slicing)]

    use super::*;

    fn created(subject: RecordKey, actor: &str) -> NewAuditEntry {
        NewAuditEntry {
            subject,
            action: ActionType::Created,
            actor_id: actor.to_string(),
            old_value: None,
            new_value: Some("{\"state\":\"pending\"}".to_string()),
            notes: None,
        }
    }

    fn push(trail: &mut AuditTrail, entry: NewAuditEntry, now: u64) -> AuditLogEntry {
        let sealed = trail.seal(entry, now);
        trail.append(sealed.clone()).expect("append");
        sealed
    }

    #[test]
    fn test_log_ids_are_contiguous() {
        let mut trail = AuditTrail::new();

        let first = push(&mut trail, created(RecordKey::request(1), "U1"), 100);
        let second = push(&mut trail, created(RecordKey::dispatch(1), "U1"), 101);

        assert_eq!(first.log_id, 1);
        assert_eq!(second.log_id, 2);
        assert_eq!(second.prev_hash, first.entry_hash);
        assert!(trail.verify_chain().is_ok());
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut trail = AuditTrail::new();

        push(&mut trail, created(RecordKey::request(1), "U1"), 500);
        let skewed = push(&mut trail, created(RecordKey::request(2), "U1"), 100);

        assert_eq!(skewed.timestamp, 500);
    }

    #[test]
    fn test_query_by_subject_keeps_kinds_apart() {
        let mut trail = AuditTrail::new();

        push(&mut trail, created(RecordKey::request(1), "U1"), 1);
        push(&mut trail, created(RecordKey::dispatch(1), "U2"), 2);
        push(&mut trail, created(RecordKey::request(2), "U3"), 3);

        let request_log = trail.query_by_subject(RecordKey::request(1));
        assert_eq!(request_log.len(), 1);
        assert_eq!(request_log[0].actor_id, "U1");

        let dispatch_log = trail.query_by_subject(RecordKey::dispatch(1));
        assert_eq!(dispatch_log.len(), 1);
        assert_eq!(dispatch_log[0].actor_id, "U2");

        assert!(trail.query_by_subject(RecordKey::dispatch(9)).is_empty());
    }

    #[test]
    fn test_query_all_is_newest_first() {
        let mut trail = AuditTrail::new();
        for id in 1..=3 {
            push(&mut trail, created(RecordKey::request(id), "U1"), id);
        }

        let ids: Vec<u64> = trail.query_all().iter().map(|e| e.log_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_append_rejects_gaps() {
        let mut trail = AuditTrail::new();
        let mut sealed = trail.seal(created(RecordKey::request(1), "U1"), 1);
        sealed.log_id = 5;

        assert!(matches!(
            trail.append(sealed),
            Err(StorageError::ChainValidation(_))
        ));
        assert!(trail.is_empty());
    }

    #[test]
    fn test_rollback_last_restores_index() {
        let mut trail = AuditTrail::new();
        push(&mut trail, created(RecordKey::request(1), "U1"), 1);
        push(&mut trail, created(RecordKey::request(1), "U2"), 2);

        let undone = trail.rollback_last().unwrap();
        assert_eq!(undone.log_id, 2);
        assert_eq!(trail.query_by_subject(RecordKey::request(1)).len(), 1);
        assert_eq!(trail.next_log_id(), 2);
    }

    #[test]
    fn test_tampering_detected() {
        let mut trail = AuditTrail::new();
        push(&mut trail, created(RecordKey::request(1), "U1"), 1);
        push(&mut trail, created(RecordKey::request(2), "U1"), 2);

        // modify data
        trail.entries[0].actor_id = "evil user bahaha".to_owned();

        assert!(matches!(
            trail.verify_chain(),
            Err(StorageError::ChainValidation(_))
        ));
    }
}
