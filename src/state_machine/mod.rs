//! # Task State Machine
//!
//! State tags and the per-task record written by task processors.
//!
//! ```text
//! PENDING -> RECEIVED -> STARTED -> SUCCESS
//!                               \-> FAILURE
//! ```
//!
//! The stores overwrite records without checking the transition; callers
//! own ordering for the tasks they execute.

pub mod states;
pub mod task_state;

pub use states::TaskStateTag;
pub use task_state::{TaskResult, TaskState};
