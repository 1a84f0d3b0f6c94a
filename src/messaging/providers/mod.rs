//! # Connector Providers
//!
//! - [`InMemoryConnector`]: process-local broker for tests and development
//! - [`RabbitMqConnector`]: AMQP broker over `lapin` (feature `rabbitmq`)

pub mod in_memory;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use in_memory::{InMemoryConnector, PublishedMessage, Settlement};
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqConnector;
