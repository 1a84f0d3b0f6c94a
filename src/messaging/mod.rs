//! # Messaging Module
//!
//! Broker-side engine of the task queue: signatures on the wire, payload
//! compression, the publisher and delay scheduler, and the bounded
//! consumption engine. Connection handling sits behind the [`Connector`]
//! capability so brokers stay transport-agnostic.

pub mod broker;
pub mod compression;
pub mod connector;
pub mod consumer;
pub mod delay;
pub mod delivery;
pub mod providers;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod signature;

pub use broker::{AmqpBroker, Broker, ConsumeOutcome};
pub use compression::Compressor;
pub use connector::{
    BoundChannel, BrokerChannel, Confirmation, ConnectionError, Connector, ExchangeDeclaration,
    FieldArgs, Publishing, QueueInfo,
};
pub use consumer::{consume_one, Concurrency, HandlerContext, TaskProcessor};
pub use delay::{delay_queue_name, DelayScheduler};
pub use delivery::{Acknowledger, Delivery};
pub use publisher::{adjust_routing_key, Publisher};
pub use registry::TaskRegistry;
pub use session::{ConsumptionSession, FibonacciBackoff};
pub use signature::{Arg, Headers, Signature};
