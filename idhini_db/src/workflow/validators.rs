use crate::core::WorkflowRecord;
use crate::error::WorkflowError;

use super::transition::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The record has not been resolved yet.
    RequiresPending,
    /// Nobody resolves their own record.
    DistinctChecker,
    /// Rejections must say why.
    ReasonRequired,
}

impl Guard {
    pub fn check(
        &self,
        record: &WorkflowRecord,
        checker_id: &str,
        decision: &Decision,
    ) -> Result<(), WorkflowError> {
        match self {
            Guard::RequiresPending => {
                if record.is_pending() {
                    Ok(())
                } else {
                    Err(WorkflowError::InvalidState(format!(
                        "{} is already {}",
                        record.key, record.state
                    )))
                }
            }
            Guard::DistinctChecker => {
                if record.maker_id == checker_id {
                    Err(WorkflowError::SelfApproval(checker_id.to_owned()))
                } else {
                    Ok(())
                }
            }
            Guard::ReasonRequired => match decision.reason() {
                Some(reason) if !reason.is_empty() => Ok(()),
                _ => Err(WorkflowError::Validation(
                    "A reason is required to reject".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NewRecord, RecordKey, SubjectKind};

    fn pending_by(maker: &str) -> WorkflowRecord {
        WorkflowRecord::pending(
            RecordKey::request(1),
            NewRecord {
                kind: SubjectKind::ProductRequest,
                maker_id: maker.to_string(),
                line_items: vec![],
                source_request_id: None,
                created_at: 0,
            },
        )
    }

    #[test]
    fn test_distinct_checker() {
        let record = pending_by("U1");

        assert!(Guard::DistinctChecker.check(&record, "U2", &Decision::Approve).is_ok());
        assert!(matches!(
            Guard::DistinctChecker.check(&record, "U1", &Decision::Approve),
            Err(WorkflowError::SelfApproval(_))
        ));
    }

    #[test]
    fn test_requires_pending() {
        let mut record = pending_by("U1");
        assert!(Guard::RequiresPending.check(&record, "U2", &Decision::Approve).is_ok());

        record.state = crate::workflow::RecordState::Rejected;
        assert!(matches!(
            Guard::RequiresPending.check(&record, "U2", &Decision::Approve),
            Err(WorkflowError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reason_required() {
        let record = pending_by("U1");

        for reason in ["", "   "] {
            let decision = Decision::Reject {
                reason: reason.to_string(),
            };
            assert!(matches!(
                Guard::ReasonRequired.check(&record, "U2", &decision),
                Err(WorkflowError::Validation(_))
            ));
        }

        let decision = Decision::Reject {
            reason: "wrong SKU".to_string(),
        };
        assert!(Guard::ReasonRequired.check(&record, "U2", &decision).is_ok());
    }
}
