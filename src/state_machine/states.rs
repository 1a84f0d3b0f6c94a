use serde::{Deserialize, Serialize};
use std::fmt;

/// Task state tags stored by the result backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStateTag {
    /// Task has been published but not yet picked up
    Pending,
    /// A worker accepted the delivery
    Received,
    /// The task processor began executing
    Started,
    /// Task completed successfully
    Success,
    /// Task failed with an error
    Failure,
}

impl TaskStateTag {
    /// Check if this is a terminal state (no further transitions expected)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Check if this is an error state
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure)
    }

    /// Check if a worker currently owns the task
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Received | Self::Started)
    }
}

impl fmt::Display for TaskStateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Received => write!(f, "RECEIVED"),
            Self::Started => write!(f, "STARTED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

impl std::str::FromStr for TaskStateTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RECEIVED" => Ok(Self::Received),
            "STARTED" => Ok(Self::Started),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// Default state for newly published tasks
impl Default for TaskStateTag {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_terminal_check() {
        assert!(TaskStateTag::Success.is_terminal());
        assert!(TaskStateTag::Failure.is_terminal());
        assert!(!TaskStateTag::Pending.is_terminal());
        assert!(!TaskStateTag::Received.is_terminal());
        assert!(!TaskStateTag::Started.is_terminal());
    }

    #[test]
    fn test_active_states() {
        assert!(TaskStateTag::Received.is_active());
        assert!(TaskStateTag::Started.is_active());
        assert!(!TaskStateTag::Pending.is_active());
        assert!(!TaskStateTag::Success.is_active());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(TaskStateTag::Started.to_string(), "STARTED");
        assert_eq!(
            "FAILURE".parse::<TaskStateTag>().unwrap(),
            TaskStateTag::Failure
        );
        assert!("complete".parse::<TaskStateTag>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&TaskStateTag::Received).unwrap();
        assert_eq!(json, "\"RECEIVED\"");

        let parsed: TaskStateTag = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStateTag::Received);
    }
}
