//! Persisted per-task state records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::states::TaskStateTag;
use crate::messaging::Signature;

/// One typed return value of a successful task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: serde_json::Value,
}

impl TaskResult {
    pub fn new(value_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            value_type: value_type.into(),
            value,
        }
    }
}

/// State record of a single task, keyed by task UUID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_uuid: String,
    pub task_name: String,
    pub state: TaskStateTag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    fn for_signature(signature: &Signature, state: TaskStateTag) -> Self {
        let now = Utc::now();
        Self {
            task_uuid: signature.uuid.clone(),
            task_name: signature.name.clone(),
            state,
            results: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pending(signature: &Signature) -> Self {
        Self::for_signature(signature, TaskStateTag::Pending)
    }

    pub fn received(signature: &Signature) -> Self {
        Self::for_signature(signature, TaskStateTag::Received)
    }

    pub fn started(signature: &Signature) -> Self {
        Self::for_signature(signature, TaskStateTag::Started)
    }

    pub fn success(signature: &Signature, results: Vec<TaskResult>) -> Self {
        Self {
            results,
            ..Self::for_signature(signature, TaskStateTag::Success)
        }
    }

    pub fn failure(signature: &Signature, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::for_signature(signature, TaskStateTag::Failure)
        }
    }

    /// Keep the creation time of the record this one replaces
    pub fn continuing(mut self, previous: &TaskState) -> Self {
        self.created_at = previous.created_at;
        self
    }

    /// True once the task reached SUCCESS or FAILURE
    pub fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskStateTag::Success
    }

    pub fn is_failure(&self) -> bool {
        self.state == TaskStateTag::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> Signature {
        Signature::new("add").with_uuid("task_1")
    }

    #[test]
    fn test_only_terminal_states_are_completed() {
        let sig = signature();
        assert!(!TaskState::pending(&sig).is_completed());
        assert!(!TaskState::received(&sig).is_completed());
        assert!(!TaskState::started(&sig).is_completed());
        assert!(TaskState::success(&sig, vec![]).is_completed());
        assert!(TaskState::failure(&sig, "boom").is_completed());
    }

    #[test]
    fn test_constructors_carry_signature_identity() {
        let sig = signature();
        let state = TaskState::failure(&sig, "boom");
        assert_eq!(state.task_uuid, "task_1");
        assert_eq!(state.task_name, "add");
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.is_failure());
        assert!(!state.is_success());
    }

    #[test]
    fn test_continuing_keeps_creation_time() {
        let sig = signature();
        let first = TaskState::pending(&sig);
        let mut next = TaskState::started(&sig);
        next.updated_at = first.created_at + chrono::Duration::seconds(5);
        let next = next.continuing(&first);

        assert_eq!(next.created_at, first.created_at);
        assert!(next.updated_at > next.created_at);
    }

    #[test]
    fn test_record_without_updated_at_decodes() {
        let decoded: TaskState = serde_json::from_value(serde_json::json!({
            "task_uuid": "task_1",
            "task_name": "add",
            "state": "PENDING",
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(decoded.updated_at >= decoded.created_at);
    }

    #[test]
    fn test_result_type_field_name() {
        let result = TaskResult::new("float64", serde_json::json!(2));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "float64");
        assert_eq!(json["value"], 2);
    }
}
