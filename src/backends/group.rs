//! Group membership records and completion evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConveyorError, Result};
use crate::state_machine::TaskState;

/// Fixed membership of one task group, written once by `init_group`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group_uuid: String,
    pub task_uuids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl GroupMeta {
    pub fn new(group_uuid: impl Into<String>, task_uuids: Vec<String>) -> Self {
        Self {
            group_uuid: group_uuid.into(),
            task_uuids,
            created_at: Utc::now(),
        }
    }

    /// Reject a caller whose idea of the group size differs from the record
    pub fn ensure_size(&self, expected: usize) -> Result<()> {
        if self.task_uuids.len() != expected {
            return Err(ConveyorError::GroupSizeMismatch {
                group_uuid: self.group_uuid.clone(),
                expected,
                actual: self.task_uuids.len(),
            });
        }
        Ok(())
    }
}

/// Tally of member states; completion alone says nothing about success
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupProgress {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl GroupProgress {
    pub fn from_states(states: &[TaskState]) -> Self {
        states.iter().fold(
            Self {
                total: states.len(),
                ..Self::default()
            },
            |mut progress, state| {
                if state.is_completed() {
                    progress.completed += 1;
                }
                if state.is_success() {
                    progress.succeeded += 1;
                }
                if state.is_failure() {
                    progress.failed += 1;
                }
                progress
            },
        )
    }

    pub fn is_completed(&self) -> bool {
        self.completed == self.total
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Signature;

    #[test]
    fn test_size_check() {
        let meta = GroupMeta::new("group_1", vec!["a".into(), "b".into()]);
        assert!(meta.ensure_size(2).is_ok());
        let err = meta.ensure_size(3).unwrap_err();
        assert!(matches!(
            err,
            ConveyorError::GroupSizeMismatch { expected: 3, actual: 2, .. }
        ));
    }

    #[test]
    fn test_progress_distinguishes_failure_from_success() {
        let a = Signature::new("add").with_uuid("a");
        let b = Signature::new("add").with_uuid("b");

        let running = GroupProgress::from_states(&[
            TaskState::started(&a),
            TaskState::success(&b, Vec::new()),
        ]);
        assert!(!running.is_completed());

        let finished = GroupProgress::from_states(&[
            TaskState::failure(&a, "boom"),
            TaskState::success(&b, Vec::new()),
        ]);
        assert!(finished.is_completed());
        assert!(!finished.all_succeeded());
        assert_eq!(finished.failed, 1);
    }
}
