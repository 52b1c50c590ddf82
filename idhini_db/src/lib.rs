#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::indexing_slicing)]
#![deny(clippy::panic)]
#![deny(unused_must_use)]

pub mod core;
pub mod error;
pub mod service;
pub mod storage;
pub mod workflow;

pub use crate::core::{
    AuditLogEntry, LineItemInput, RecordKey, SubjectKind, User, WorkflowRecord,
};
pub use crate::error::{ErrorKind, ServiceError, StorageError, WorkflowError};
pub use crate::service::{Outcome, WorkflowService};
pub use crate::storage::{Database, FaultPoint, UnitOfWork};
pub use crate::workflow::{DispatchPayload, RecordState, RequestPayload, TransitionEngine};
