use serde::{Deserialize, Serialize};

use super::state::RecordState;
use super::validators::Guard;
use crate::core::ActionType;

/// A checker's decision on a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

impl Decision {
    pub fn transition(&self) -> &'static Transition {
        match self {
            Decision::Approve => &APPROVE,
            Decision::Reject { .. } => &REJECT,
        }
    }

    /// Rejection reason, trimmed. Approvals never carry one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Approve => None,
            Decision::Reject { reason } => Some(reason.trim()),
        }
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from_state: RecordState,
    pub to_state: RecordState,
    pub name: &'static str,
    pub action: ActionType,
    /// Checked in order inside the transaction, before anything is written.
    pub guards: &'static [Guard],
}

pub static APPROVE: Transition = Transition {
    from_state: RecordState::Pending,
    to_state: RecordState::Approved,
    name: "approve",
    action: ActionType::Approved,
    guards: &[Guard::RequiresPending, Guard::DistinctChecker],
};

pub static REJECT: Transition = Transition {
    from_state: RecordState::Pending,
    to_state: RecordState::Rejected,
    name: "reject",
    action: ActionType::Rejected,
    guards: &[
        Guard::RequiresPending,
        Guard::DistinctChecker,
        Guard::ReasonRequired,
    ],
};

impl Transition {
    pub fn all() -> [&'static Transition; 2] {
        [&APPROVE, &REJECT]
    }

    pub fn find(from_state: RecordState, to_state: RecordState) -> Option<&'static Transition> {
        Self::all()
            .into_iter()
            .find(|t| t.from_state == from_state && t.to_state == to_state)
    }
}

/// The write half of a transition: what the record looks like once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub state: RecordState,
    pub checker_id: String,
    pub resolved_at: u64,
    pub reason: Option<String>,
}
