//! # Result Backend Contract
//!
//! Stores implement the primitive record operations. The task state
//! machine and the group-completion protocol are provided on top of them,
//! so every store answers "is this group done?" the same way.
//!
//! Writers to one task UUID are sequenced by that task's own lifecycle.
//! Readers polling a group may observe a member mid-transition and are
//! expected to poll again.

use async_trait::async_trait;

use super::group::{GroupMeta, GroupProgress};
use crate::error::{ErrorKind, Result};
use crate::messaging::Signature;
use crate::state_machine::{TaskResult, TaskState};

#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Short store name used in logs
    fn name(&self) -> &'static str;

    /// Overwrite the record for `state.task_uuid`
    async fn put_task_state(&self, state: &TaskState) -> Result<()>;

    /// NotFound when never written, purged or expired; CorruptPayload when undecodable
    async fn get_state(&self, task_uuid: &str) -> Result<TaskState>;

    async fn purge_state(&self, task_uuid: &str) -> Result<()>;

    /// Write the fixed membership of a group
    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> Result<()>;

    /// NotFound when the group was never initialised, purged or expired
    async fn get_group_meta(&self, group_uuid: &str) -> Result<GroupMeta>;

    async fn purge_group_meta(&self, group_uuid: &str) -> Result<()>;

    /// States of `task_uuids` in order; the first missing or corrupt record fails the call
    async fn fetch_task_states(&self, task_uuids: &[String]) -> Result<Vec<TaskState>> {
        let mut states = Vec::with_capacity(task_uuids.len());
        for task_uuid in task_uuids {
            states.push(self.get_state(task_uuid).await?);
        }
        Ok(states)
    }

    /// Write `state`, carrying over `created_at` from an existing readable record
    async fn record_transition(&self, state: TaskState) -> Result<()> {
        let state = match self.get_state(&state.task_uuid).await {
            Ok(previous) => state.continuing(&previous),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::CorruptPayload) => state,
            Err(e) => return Err(e),
        };
        self.put_task_state(&state).await
    }

    async fn set_state_pending(&self, signature: &Signature) -> Result<()> {
        self.record_transition(TaskState::pending(signature)).await
    }

    async fn set_state_received(&self, signature: &Signature) -> Result<()> {
        self.record_transition(TaskState::received(signature)).await
    }

    async fn set_state_started(&self, signature: &Signature) -> Result<()> {
        self.record_transition(TaskState::started(signature)).await
    }

    async fn set_state_success(&self, signature: &Signature, results: Vec<TaskResult>) -> Result<()> {
        self.record_transition(TaskState::success(signature, results))
            .await
    }

    async fn set_state_failure(&self, signature: &Signature, error: &str) -> Result<()> {
        self.record_transition(TaskState::failure(signature, error))
            .await
    }

    /// Member states in membership order, after the existence and size checks
    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> Result<Vec<TaskState>> {
        let meta = self.get_group_meta(group_uuid).await?;
        meta.ensure_size(group_task_count)?;
        self.fetch_task_states(&meta.task_uuids).await
    }

    /// True once every member reached SUCCESS or FAILURE
    ///
    /// Errors whenever completeness cannot be determined: missing group,
    /// size disagreement, or a member whose state is missing or corrupt.
    async fn group_completed(&self, group_uuid: &str, group_task_count: usize) -> Result<bool> {
        let states = self.group_task_states(group_uuid, group_task_count).await?;
        Ok(GroupProgress::from_states(&states).is_completed())
    }
}
