use serde::{Deserialize, Serialize};

use crate::core::{LineItem, LineItemInput, RecordKey, SubjectKind};
use crate::error::WorkflowError;
use crate::storage::Transaction;

/// Validated creation payload, common to every kind.
#[derive(Debug, Clone)]
pub struct Draft {
    pub line_items: Vec<LineItem>,
    pub source_request_id: Option<u64>,
}

/// A record family driven by the shared engine. Each kind only supplies its
/// payload shape and the checks that turn it into a [`Draft`].
pub trait RecordKind {
    const SUBJECT: SubjectKind;
    type Payload;

    /// Runs inside the creating transaction, so lookups see committed state.
    fn prepare(payload: Self::Payload, tx: &Transaction<'_>) -> Result<Draft, WorkflowError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestPayload {
    pub line_items: Vec<LineItemInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchPayload {
    #[serde(default)]
    pub source_request_id: Option<u64>,
    pub line_items: Vec<LineItemInput>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProductRequest;

#[derive(Debug, Clone, Copy)]
pub struct Dispatch;

impl RecordKind for ProductRequest {
    const SUBJECT: SubjectKind = SubjectKind::ProductRequest;
    type Payload = RequestPayload;

    fn prepare(payload: RequestPayload, _tx: &Transaction<'_>) -> Result<Draft, WorkflowError> {
        Ok(Draft {
            line_items: LineItem::validate_all(payload.line_items)?,
            source_request_id: None,
        })
    }
}

impl RecordKind for Dispatch {
    const SUBJECT: SubjectKind = SubjectKind::Dispatch;
    type Payload = DispatchPayload;

    fn prepare(payload: DispatchPayload, tx: &Transaction<'_>) -> Result<Draft, WorkflowError> {
        let line_items = LineItem::validate_all(payload.line_items)?;

        // existence only, the dispatch does not depend on the request's state
        if let Some(request_id) = payload.source_request_id {
            let key = RecordKey::request(request_id);
            if tx.record(key).is_none() {
                return Err(WorkflowError::NotFound(format!(
                    "Source {} not found",
                    key
                )));
            }
        }

        Ok(Draft {
            line_items,
            source_request_id: payload.source_request_id,
        })
    }
}
