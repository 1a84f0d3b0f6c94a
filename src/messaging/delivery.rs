//! In-flight broker messages.

use async_trait::async_trait;

use super::signature::Headers;
use crate::error::Result;

/// Settles a delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject; `requeue = false` discards or dead-letters the message
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// One broker message in flight
///
/// `ack` and `nack` consume the delivery, so it is settled at most once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
    pub headers: Headers,
    pub redelivered: bool,
    acknowledger: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        content_encoding: Option<String>,
        headers: Headers,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            content_encoding,
            headers,
            redelivered: false,
            acknowledger,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub async fn ack(self) -> Result<()> {
        self.acknowledger.ack(self.delivery_tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acknowledger.nack(self.delivery_tag, requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("content_encoding", &self.content_encoding)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
