//! # In-Memory Result Backend
//!
//! `DashMap`-backed store. Records are kept as encoded JSON, like any
//! external store would hold them, so decode failures surface the same way.
//! Expired records read as missing and are removed on access;
//! [`InMemoryResultBackend::purge_expired`] sweeps the rest.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

use super::group::GroupMeta;
use super::traits::ResultBackend;
use crate::config::BackendConfig;
use crate::error::{ConveyorError, Result};
use crate::logging::log_backend_operation;
use crate::state_machine::TaskState;

const BACKEND_NAME: &str = "in_memory";

#[derive(Debug, Clone)]
struct StoredRecord {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryResultBackend {
    tasks: DashMap<String, StoredRecord>,
    groups: DashMap<String, StoredRecord>,
    expire_in: Option<Duration>,
}

fn read(map: &DashMap<String, StoredRecord>, key: &str) -> Option<Vec<u8>> {
    let now = Instant::now();
    {
        let record = map.get(key)?;
        if !record.is_expired(now) {
            return Some(record.bytes.clone());
        }
    }
    map.remove_if(key, |_, record| record.is_expired(now));
    None
}

fn decode<T: DeserializeOwned>(kind: &str, key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ConveyorError::corrupt_payload(format!("{kind} record {key}: {e}")))
}

impl InMemoryResultBackend {
    /// Records never expire
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiry(expire_in: Duration) -> Self {
        Self {
            expire_in: Some(expire_in),
            ..Self::default()
        }
    }

    /// Expiry from `results_expire_in_secs`; zero disables it
    pub fn from_config(config: &BackendConfig) -> Self {
        match config.results_expire_in_secs {
            0 => Self::new(),
            _ => Self::with_expiry(config.results_expire_in()),
        }
    }

    fn record(&self, bytes: Vec<u8>) -> StoredRecord {
        StoredRecord {
            bytes,
            // a TTL past the clock's range never expires
            expires_at: self
                .expire_in
                .and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    /// Store raw bytes as a task record, bypassing encoding
    pub fn insert_raw_task_record(&self, task_uuid: &str, bytes: Vec<u8>) {
        self.tasks.insert(task_uuid.to_string(), self.record(bytes));
    }

    /// Drop every expired record, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tasks.len() + self.groups.len();
        self.tasks.retain(|_, record| !record.is_expired(now));
        self.groups.retain(|_, record| !record.is_expired(now));
        before - (self.tasks.len() + self.groups.len())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn put_task_state(&self, state: &TaskState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.tasks
            .insert(state.task_uuid.clone(), self.record(bytes));
        log_backend_operation(
            "put_task_state",
            BACKEND_NAME,
            &state.task_uuid,
            &state.state.to_string(),
            None,
        );
        Ok(())
    }

    async fn get_state(&self, task_uuid: &str) -> Result<TaskState> {
        let bytes =
            read(&self.tasks, task_uuid).ok_or_else(|| ConveyorError::task_state_not_found(task_uuid))?;
        decode("task state", task_uuid, &bytes)
    }

    async fn purge_state(&self, task_uuid: &str) -> Result<()> {
        self.tasks.remove(task_uuid);
        log_backend_operation("purge_state", BACKEND_NAME, task_uuid, "purged", None);
        Ok(())
    }

    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> Result<()> {
        let meta = GroupMeta::new(group_uuid, task_uuids.to_vec());
        let bytes = serde_json::to_vec(&meta)?;
        self.groups.insert(group_uuid.to_string(), self.record(bytes));
        log_backend_operation(
            "init_group",
            BACKEND_NAME,
            group_uuid,
            "initialised",
            Some(&format!("{} tasks", task_uuids.len())),
        );
        Ok(())
    }

    async fn get_group_meta(&self, group_uuid: &str) -> Result<GroupMeta> {
        let bytes =
            read(&self.groups, group_uuid).ok_or_else(|| ConveyorError::group_not_found(group_uuid))?;
        decode("group meta", group_uuid, &bytes)
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> Result<()> {
        self.groups.remove(group_uuid);
        log_backend_operation("purge_group_meta", BACKEND_NAME, group_uuid, "purged", None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Signature;
    use crate::state_machine::{TaskResult, TaskStateTag};
    use crate::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_returns_same_tag() {
        let backend = InMemoryResultBackend::new();
        let sig = Signature::new("add").with_uuid("task_1");

        backend.set_state_pending(&sig).await.unwrap();
        assert_eq!(backend.get_state("task_1").await.unwrap().state, TaskStateTag::Pending);

        backend.set_state_received(&sig).await.unwrap();
        assert_eq!(backend.get_state("task_1").await.unwrap().state, TaskStateTag::Received);

        backend.set_state_started(&sig).await.unwrap();
        assert_eq!(backend.get_state("task_1").await.unwrap().state, TaskStateTag::Started);

        backend
            .set_state_success(&sig, vec![TaskResult::new("float64", json!(2))])
            .await
            .unwrap();
        let state = backend.get_state("task_1").await.unwrap();
        assert_eq!(state.state, TaskStateTag::Success);
        assert_eq!(state.results, vec![TaskResult::new("float64", json!(2))]);
        assert!(state.is_completed());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_records_differ() {
        let backend = InMemoryResultBackend::new();
        let err = backend.get_state("nobody").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        backend.insert_raw_task_record("task_bad", b"{not json".to_vec());
        let err = backend.get_state("task_bad").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptPayload);
    }

    #[tokio::test]
    async fn test_expired_records_read_as_missing() {
        let backend = InMemoryResultBackend::with_expiry(Duration::from_millis(10));
        let sig = Signature::new("add").with_uuid("task_1");
        backend.set_state_pending(&sig).await.unwrap();
        backend.init_group("group_1", &["task_1".to_string()]).await.unwrap();
        assert!(backend.get_state("task_1").await.is_ok());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.get_state("task_1").await.unwrap_err().is_not_found());
        assert_eq!(backend.purge_expired(), 1);
        assert!(backend.get_group_meta("group_1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_huge_expiry_keeps_records() {
        let backend = InMemoryResultBackend::from_config(&BackendConfig {
            results_expire_in_secs: u64::MAX,
            ..BackendConfig::default()
        });
        let sig = Signature::new("add").with_uuid("task_1");
        backend.set_state_pending(&sig).await.unwrap();

        assert_eq!(backend.get_state("task_1").await.unwrap().state, TaskStateTag::Pending);
        assert_eq!(backend.purge_expired(), 0);
    }

    #[test]
    fn test_zero_expiry_disables_it() {
        let config = BackendConfig {
            results_expire_in_secs: 0,
            ..BackendConfig::default()
        };
        assert!(InMemoryResultBackend::from_config(&config).expire_in.is_none());
        assert_eq!(
            InMemoryResultBackend::from_config(&BackendConfig::default()).expire_in,
            Some(Duration::from_secs(3600))
        );
    }
}
