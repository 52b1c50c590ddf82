use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::workflow::{RecordState, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    ProductRequest,
    Dispatch,
}

impl SubjectKind {
    pub fn code(self) -> u8 {
        match self {
            SubjectKind::ProductRequest => 1,
            SubjectKind::Dispatch => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SubjectKind::ProductRequest),
            2 => Some(SubjectKind::Dispatch),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SubjectKind::ProductRequest => "product request",
            SubjectKind::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Record ids are allocated per kind, so a record is only identified by
/// the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: SubjectKind,
    pub id: u64,
}

impl RecordKey {
    pub fn new(kind: SubjectKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn request(id: u64) -> Self {
        Self::new(SubjectKind::ProductRequest, id)
    }

    pub fn dispatch(id: u64) -> Self {
        Self::new(SubjectKind::Dispatch, id)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.kind, self.id)
    }
}

/// Line item as submitted by a maker, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemInput {
    pub sku: String,
    pub quantity: i64,
    #[serde(default)]
    pub note: Option<String>,
}

impl LineItemInput {
    pub fn new(sku: &str, quantity: i64) -> Self {
        Self {
            sku: sku.to_owned(),
            quantity,
            note: None,
        }
    }

    pub fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_owned());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_number: u32,
    pub sku: String,
    pub quantity: u32,
    pub note: Option<String>,
}

impl LineItem {
    /// Validates every submitted item and numbers them from 1 in the order given.
    pub fn validate_all(items: Vec<LineItemInput>) -> Result<Vec<LineItem>, WorkflowError> {
        if items.is_empty() {
            return Err(WorkflowError::Validation(
                "At least one line item is required".to_string(),
            ));
        }

        let mut validated = Vec::with_capacity(items.len());
        for (position, item) in items.into_iter().enumerate() {
            let line_number = position as u32 + 1;

            let sku = item.sku.trim();
            if sku.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "Line {}: SKU cannot be empty",
                    line_number
                )));
            }

            if item.quantity <= 0 {
                return Err(WorkflowError::Validation(format!(
                    "Line {}: quantity must be positive, got {}",
                    line_number, item.quantity
                )));
            }

            let quantity = u32::try_from(item.quantity).map_err(|_| {
                WorkflowError::Validation(format!(
                    "Line {}: quantity {} is too large",
                    line_number, item.quantity
                ))
            })?;

            let note = item
                .note
                .map(|n| n.trim().to_owned())
                .filter(|n| !n.is_empty());

            validated.push(LineItem {
                line_number,
                sku: sku.to_owned(),
                quantity,
                note,
            });
        }

        Ok(validated)
    }
}

/// Everything needed to allocate a record; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub kind: SubjectKind,
    pub maker_id: String,
    pub line_items: Vec<LineItem>,
    pub source_request_id: Option<u64>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub key: RecordKey,
    pub state: RecordState,
    pub maker_id: String,
    pub checker_id: Option<String>,
    pub created_at: u64,
    pub resolved_at: Option<u64>,
    pub resolution_reason: Option<String>,
    /// Only dispatches carry this; it is a reference, not ownership.
    pub source_request_id: Option<u64>,
    pub line_items: Vec<LineItem>,
}

impl WorkflowRecord {
    pub fn pending(key: RecordKey, new: NewRecord) -> Self {
        Self {
            key,
            state: RecordState::Pending,
            maker_id: new.maker_id,
            checker_id: None,
            created_at: new.created_at,
            resolved_at: None,
            resolution_reason: None,
            source_request_id: new.source_request_id,
            line_items: new.line_items,
        }
    }

    pub fn id(&self) -> u64 {
        self.key.id
    }

    pub fn kind(&self) -> SubjectKind {
        self.key.kind
    }

    pub fn is_pending(&self) -> bool {
        self.state == RecordState::Pending
    }

    pub fn total_quantity(&self) -> u64 {
        self.line_items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    /// Moves the record out of Pending. Callers check the current state first;
    /// this only refuses to overwrite a resolution that already happened.
    pub(crate) fn apply_resolution(&mut self, resolution: &Resolution) -> bool {
        if !self.is_pending() {
            return false;
        }

        self.state = resolution.state;
        self.checker_id = Some(resolution.checker_id.clone());
        self.resolved_at = Some(resolution.resolved_at);
        self.resolution_reason = resolution.reason.clone();
        true
    }
}
