//! # Connector Capability
//!
//! The broker engine never manages connections itself. A [`Connector`]
//! declares the exchange/queue/binding triple and hands back a channel, the
//! declared queue, and the channel's publisher-confirmation stream. It also
//! exposes a stream of fatal connection errors.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};

use super::delivery::Delivery;
use super::signature::Headers;
use crate::error::Result;

/// Declaration arguments (exchange, queue or binding)
pub type FieldArgs = HashMap<String, serde_json::Value>;

/// Fatal connection-level failure reported by a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receiving side of a connector's fatal-error stream
pub type ConnectionErrorReceiver = broadcast::Receiver<ConnectionError>;

/// Stream of deliveries from one consumer registration
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Publisher confirmations in channel publish order
pub type ConfirmationReceiver = mpsc::UnboundedReceiver<Confirmation>;

/// Everything needed to declare and bind one queue
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeclaration {
    pub exchange_name: String,
    pub exchange_type: String,
    pub queue_name: String,
    pub queue_durable: bool,
    pub queue_auto_delete: bool,
    pub binding_key: String,
    pub exchange_args: FieldArgs,
    pub queue_args: FieldArgs,
    pub binding_args: FieldArgs,
}

/// Result of a declaration: the queue as the broker named it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
}

/// Whether a message must survive a broker restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

/// One outgoing message
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub headers: Headers,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
    pub delivery_mode: DeliveryMode,
}

/// Broker acknowledgement of a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// An open broker channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cap unacknowledged deliveries outstanding to this channel's consumers
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgement
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Publish; confirmation arrives on the declaration's confirmation stream
    async fn publish(&self, exchange: &str, routing_key: &str, publishing: Publishing)
        -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A declared exchange/queue pair with its channel
pub struct BoundChannel {
    pub channel: Box<dyn BrokerChannel>,
    pub queue: QueueInfo,
    pub confirmations: ConfirmationReceiver,
}

impl std::fmt::Debug for BoundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundChannel")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Connection capability the broker is constructed with
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Declare the exchange and queue, bind them, and open a channel
    async fn exchange(&self, declaration: &ExchangeDeclaration) -> Result<BoundChannel>;

    /// Subscribe to fatal connection errors
    fn connection_errors(&self) -> ConnectionErrorReceiver;
}
