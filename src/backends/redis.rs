//! # Redis Result Backend
//!
//! Uses `redis::aio::ConnectionManager` for async multiplexed connections.
//! Task states and group metas are JSON strings keyed by their UUIDs and
//! written with `SET ... EX` so unpolled records age out. Group member
//! states are fetched with a single `MGET`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::group::GroupMeta;
use super::traits::ResultBackend;
use crate::config::BackendConfig;
use crate::error::{ConveyorError, Result};
use crate::logging::log_backend_operation;
use crate::state_machine::TaskState;

const BACKEND_NAME: &str = "redis";

fn decode<T: DeserializeOwned>(kind: &str, key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ConveyorError::corrupt_payload(format!("{kind} record {key}: {e}")))
}

fn redis_error(operation: &str) -> impl Fn(redis::RedisError) -> ConveyorError + '_ {
    move |e| ConveyorError::transport(operation, format!("Redis {operation} failed: {e}"))
}

/// Strip credentials before a URL reaches the logs
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[derive(Clone)]
pub struct RedisResultBackend {
    connection_manager: redis::aio::ConnectionManager,
    expire_in: Option<Duration>,
}

impl std::fmt::Debug for RedisResultBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisResultBackend")
            .field("connection_manager", &"ConnectionManager")
            .field("expire_in", &self.expire_in)
            .finish()
    }
}

impl RedisResultBackend {
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            ConveyorError::configuration(format!("Invalid Redis URL: {e}"))
        })?;
        let connection_manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(redis_error("connect"))?;

        debug!(url = %redact_url(&config.url), "Redis result backend connected");

        let expire_in = match config.results_expire_in_secs {
            0 => None,
            _ => Some(config.results_expire_in()),
        };
        Ok(Self {
            connection_manager,
            expire_in,
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = self.expire_in {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(redis_error("SET"))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(redis_error("GET"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error("DEL"))
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn put_task_state(&self, state: &TaskState) -> Result<()> {
        self.set(&state.task_uuid, serde_json::to_vec(state)?).await?;
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
        let bytes = self
            .get(task_uuid)
            .await?
            .ok_or_else(|| ConveyorError::task_state_not_found(task_uuid))?;
        decode("task state", task_uuid, &bytes)
    }

    async fn purge_state(&self, task_uuid: &str) -> Result<()> {
        self.delete(task_uuid).await?;
        log_backend_operation("purge_state", BACKEND_NAME, task_uuid, "purged", None);
        Ok(())
    }

    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> Result<()> {
        let meta = GroupMeta::new(group_uuid, task_uuids.to_vec());
        self.set(group_uuid, serde_json::to_vec(&meta)?).await?;
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
        let bytes = self
            .get(group_uuid)
            .await?
            .ok_or_else(|| ConveyorError::group_not_found(group_uuid))?;
        decode("group meta", group_uuid, &bytes)
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> Result<()> {
        self.delete(group_uuid).await?;
        log_backend_operation("purge_group_meta", BACKEND_NAME, group_uuid, "purged", None);
        Ok(())
    }

    async fn fetch_task_states(&self, task_uuids: &[String]) -> Result<Vec<TaskState>> {
        if task_uuids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection_manager.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(task_uuids)
            .query_async(&mut conn)
            .await
            .map_err(redis_error("MGET"))?;

        task_uuids
            .iter()
            .zip(values)
            .map(|(task_uuid, value)| {
                let bytes = value.ok_or_else(|| ConveyorError::task_state_not_found(task_uuid))?;
                decode("task state", task_uuid, &bytes)
            })
            .collect()
    }
}
