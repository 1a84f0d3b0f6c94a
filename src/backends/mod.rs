//! # Result Backends
//!
//! Durable task state records and group membership, behind the
//! [`ResultBackend`] contract.
//!
//! - [`InMemoryResultBackend`]: `DashMap` store for tests and single-process use
//! - [`RedisResultBackend`]: Redis store (feature `redis-backend`)

pub mod group;
pub mod in_memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod traits;

pub use group::{GroupMeta, GroupProgress};
pub use in_memory::InMemoryResultBackend;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisResultBackend;
pub use traits::ResultBackend;
