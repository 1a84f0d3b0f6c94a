//! # Conveyor Error Types
//!
//! Structured error handling for the broker engine and the result backends.
//! Every variant maps onto an [`ErrorKind`], which is the part callers are
//! expected to match on; the rendered messages are implementation detail.

use thiserror::Error;

/// Contract-level classification of a [`ConveyorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad arguments (non-positive delay, malformed input to an operation)
    Validation,
    /// Invalid or unloadable configuration
    Configuration,
    /// Broker or store connectivity, declare/publish/consume failures
    Transport,
    /// Marshal/unmarshal failures
    Serialization,
    /// Decompression or stored-record decode failure
    CorruptPayload,
    /// Missing task state or group record
    NotFound,
    /// Caller and backend disagree (group size)
    Mismatch,
    /// Task processor failure surfaced through the handler path
    Processing,
}

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transport error: {operation}: {message}")]
    Transport { operation: String, message: String },

    #[error("Failed delivery of delivery tag: {delivery_tag}")]
    PublishNacked { delivery_tag: u64 },

    #[error("Received an empty message")]
    EmptyDelivery,

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Corrupt payload: {message}")]
    CorruptPayload { message: String },

    #[error("Task state not found: {task_uuid}")]
    TaskStateNotFound { task_uuid: String },

    #[error("Group meta not found: {group_uuid}")]
    GroupNotFound { group_uuid: String },

    #[error("Group {group_uuid} has {actual} tasks, expected {expected}")]
    GroupSizeMismatch {
        group_uuid: String,
        expected: usize,
        actual: usize,
    },

    #[error("Processing failed for task {task_name}: {source}")]
    Processing {
        task_name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ConveyorError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transport error for the named operation
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a corrupt payload error
    pub fn corrupt_payload(message: impl Into<String>) -> Self {
        Self::CorruptPayload {
            message: message.into(),
        }
    }

    pub fn task_state_not_found(task_uuid: impl Into<String>) -> Self {
        Self::TaskStateNotFound {
            task_uuid: task_uuid.into(),
        }
    }

    pub fn group_not_found(group_uuid: impl Into<String>) -> Self {
        Self::GroupNotFound {
            group_uuid: group_uuid.into(),
        }
    }

    /// Wrap a task processor failure
    pub fn processing(task_name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Processing {
            task_name: task_name.into(),
            source,
        }
    }

    /// Contract kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Transport { .. } | Self::PublishNacked { .. } | Self::EmptyDelivery => {
                ErrorKind::Transport
            }
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::CorruptPayload { .. } => ErrorKind::CorruptPayload,
            Self::TaskStateNotFound { .. } | Self::GroupNotFound { .. } => ErrorKind::NotFound,
            Self::GroupSizeMismatch { .. } => ErrorKind::Mismatch,
            Self::Processing { .. } => ErrorKind::Processing,
        }
    }

    /// True for missing task state or group records
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when the error was reported by the broker connection itself
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport { operation, .. } if operation == "connection")
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {err}"))
    }
}

impl From<config::ConfigError> for ConveyorError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConveyorError>;
