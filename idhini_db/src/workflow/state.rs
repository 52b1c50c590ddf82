use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Approved,
    Rejected,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordState::Pending)
    }

    /// Pending is the only state with outgoing edges.
    pub fn can_transition_to(self, target: RecordState) -> bool {
        matches!(
            (self, target),
            (RecordState::Pending, RecordState::Approved)
                | (RecordState::Pending, RecordState::Rejected)
        )
    }

    pub fn code(self) -> u8 {
        match self {
            RecordState::Pending => 0,
            RecordState::Approved => 1,
            RecordState::Rejected => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RecordState::Pending),
            1 => Some(RecordState::Approved),
            2 => Some(RecordState::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Approved => "approved",
            RecordState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RecordState::Pending),
            "approved" => Ok(RecordState::Approved),
            "rejected" => Ok(RecordState::Rejected),
            other => Err(format!(
                "Unknown state '{}'. Must be one of: pending, approved, rejected",
                other
            )),
        }
    }
}
