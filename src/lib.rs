#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, DashMap in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conveyor Core
//!
//! Transport and state-tracking core of a distributed task queue.
//!
//! ## Overview
//!
//! Producers publish task signatures to an AMQP-style broker; workers
//! consume them through a bounded pool of concurrent handlers. Tasks with a
//! future ETA are parked in self-expiring delay queues and dead-lettered
//! back into normal delivery by the broker itself. Per-task state and group
//! membership live in a result backend that can answer "is this group of
//! N tasks done?" without a global lock.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Signatures, compression, publisher, delay scheduler, consumption engine
//! - [`backends`] - Result backend contract, group completion, in-memory and Redis stores
//! - [`state_machine`] - Task state tags and records
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured `tracing` setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conveyor_core::messaging::providers::InMemoryConnector;
//! use conveyor_core::messaging::{AmqpBroker, Broker, Signature};
//! use conveyor_core::ConveyorConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> conveyor_core::Result<()> {
//! let config = ConveyorConfig::default();
//! let broker = AmqpBroker::from_config(Arc::new(InMemoryConnector::new()), &config);
//! broker.registry().register("add");
//!
//! broker.publish(Signature::new("add")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `rabbitmq` (default): `lapin` based connector
//! - `redis-backend` (default): Redis result backend

pub mod backends;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod state_machine;

pub use backends::{GroupMeta, InMemoryResultBackend, ResultBackend};
pub use config::ConveyorConfig;
pub use error::{ConveyorError, ErrorKind, Result};
pub use messaging::{AmqpBroker, Broker, Concurrency, Signature, TaskProcessor, TaskRegistry};
pub use state_machine::{TaskResult, TaskState, TaskStateTag};
