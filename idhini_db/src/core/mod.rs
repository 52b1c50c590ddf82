pub mod audit;
pub mod record;
pub mod user;

pub use audit::{ActionType, AuditLogEntry, AuditTrail, NewAuditEntry};
pub use record::{LineItem, LineItemInput, NewRecord, RecordKey, SubjectKind, WorkflowRecord};
pub use user::{IdentityResolver, User, UserDirectory};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. A clock set before 1970 reads as 0,
/// the audit trail clamps timestamps so ordering still holds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
