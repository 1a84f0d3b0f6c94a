//! # In-Memory Connector
//!
//! Process-local exchange and queue model for tests and development.
//!
//! ## Features
//!
//! - **Routing**: direct, fanout and topic exchanges over declared bindings
//! - **Publisher Confirms**: every publish is confirmed, optionally negatively
//! - **Dead-Lettering**: `x-message-ttl` expiry and non-requeued rejections
//!   re-route through `x-dead-letter-exchange` / `x-dead-letter-routing-key`
//! - **Inspection**: declarations, QoS requests, settlements and queue depth
//!   are recorded for assertions
//!
//! Queue auto-expiry (`x-expires`) and prefetch limits are recorded but not
//! enforced.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, trace};

use crate::constants::{exchange_types, queue_args};
use crate::error::{ConveyorError, Result};
use crate::messaging::connector::{
    BoundChannel, BrokerChannel, Confirmation, ConnectionError, ConnectionErrorReceiver,
    Connector, DeliveryStream, ExchangeDeclaration, FieldArgs, Publishing, QueueInfo,
};
use crate::messaging::delivery::{Acknowledger, Delivery};
use crate::messaging::signature::Headers;

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, requeue: bool },
}

/// A publish as the connector saw it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub publishing: Publishing,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    body: Vec<u8>,
    content_encoding: Option<String>,
    headers: Headers,
    redelivered: bool,
}

#[derive(Debug)]
struct MemoryQueue {
    args: FieldArgs,
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(args: FieldArgs) -> Self {
        Self {
            args,
            messages: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn message_ttl(&self) -> Option<Duration> {
        self.args
            .get(queue_args::MESSAGE_TTL)
            .and_then(serde_json::Value::as_i64)
            .filter(|ttl| *ttl >= 0)
            .map(|ttl| Duration::from_millis(ttl as u64))
    }

    fn dead_letter_route(&self, original_key: &str) -> Option<(String, String)> {
        let exchange = self
            .args
            .get(queue_args::DEAD_LETTER_EXCHANGE)
            .and_then(serde_json::Value::as_str)?;
        let routing_key = self
            .args
            .get(queue_args::DEAD_LETTER_ROUTING_KEY)
            .and_then(serde_json::Value::as_str)
            .unwrap_or(original_key);
        Some((exchange.to_string(), routing_key.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

enum Pop {
    Ready(Delivery),
    Empty(Arc<Notify>),
    Gone,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    declarations: Mutex<Vec<ExchangeDeclaration>>,
    qos_requests: Mutex<Vec<u16>>,
    settlements: Mutex<Vec<Settlement>>,
    published: Mutex<Vec<PublishedMessage>>,
    next_delivery_tag: AtomicU64,
    next_message_id: AtomicU64,
    nack_confirms: AtomicBool,
    fail_declarations: AtomicBool,
    fail_qos: AtomicBool,
    closed_channels: AtomicU64,
    errors_tx: broadcast::Sender<ConnectionError>,
}

/// `*` matches one word, `#` matches zero or more
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

impl Inner {
    /// Copy the message into every queue bound to `exchange` for `routing_key`
    fn route(self: &Arc<Self>, exchange: &str, routing_key: &str, template: StoredMessage) -> usize {
        let mut expiring = Vec::new();
        let mut routed = 0;
        {
            let mut state = self.state.lock();
            let Some(exchange_type) = state.exchanges.get(exchange).cloned() else {
                debug!(exchange, "Dropping message for undeclared exchange");
                return 0;
            };

            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match exchange_type.as_str() {
                    exchange_types::FANOUT => true,
                    exchange_types::TOPIC => topic_matches(&b.key, routing_key),
                    _ => b.key == routing_key,
                })
                .map(|b| b.queue.clone())
                .collect();

            for queue_name in targets {
                let Some(queue) = state.queues.get_mut(&queue_name) else {
                    continue;
                };
                let message = StoredMessage {
                    id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
                    routing_key: routing_key.to_string(),
                    ..template.clone()
                };
                if let Some(ttl) = queue.message_ttl() {
                    expiring.push((queue_name.clone(), message.id, ttl));
                }
                queue.messages.push_back(message);
                queue.notify.notify_one();
                routed += 1;
            }
        }

        for (queue_name, message_id, ttl) in expiring {
            let inner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                inner.expire(&queue_name, message_id);
            });
        }
        trace!(exchange, routing_key, routed, "Routed message");
        routed
    }

    /// Remove an unconsumed message whose TTL elapsed and dead-letter it
    fn expire(self: &Arc<Self>, queue_name: &str, message_id: u64) {
        let expired = {
            let mut state = self.state.lock();
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            let Some(position) = queue.messages.iter().position(|m| m.id == message_id) else {
                return;
            };
            let message = queue.messages.remove(position);
            message.and_then(|m| queue.dead_letter_route(&m.routing_key).map(|route| (route, m)))
        };

        if let Some(((exchange, routing_key), message)) = expired {
            debug!(queue = queue_name, exchange = %exchange, routing_key = %routing_key, "Dead-lettering expired message");
            self.route(&exchange, &routing_key, message);
        }
    }

    fn pop_delivery(self: &Arc<Self>, queue_name: &str) -> Pop {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Pop::Gone;
        };
        let Some(message) = queue.messages.pop_front() else {
            return Pop::Empty(queue.notify.clone());
        };

        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery::new(
            delivery_tag,
            message.body.clone(),
            message.content_encoding.clone(),
            message.headers.clone(),
            Box::new(InMemoryAcker {
                inner: self.clone(),
            }),
        )
        .redelivered(message.redelivered);
        state
            .unacked
            .insert(delivery_tag, (queue_name.to_string(), message));
        Pop::Ready(delivery)
    }

    fn settle(self: &Arc<Self>, delivery_tag: u64, outcome: Settlement) -> Result<()> {
        let dead_letter = {
            let mut state = self.state.lock();
            let Some((queue_name, mut message)) = state.unacked.remove(&delivery_tag) else {
                return Err(ConveyorError::transport(
                    "settle",
                    format!("unknown delivery tag {delivery_tag}"),
                ));
            };
            self.settlements.lock().push(outcome);

            match outcome {
                Settlement::Ack { .. } => None,
                Settlement::Nack { requeue: true, .. } => {
                    if let Some(queue) = state.queues.get_mut(&queue_name) {
                        message.redelivered = true;
                        queue.messages.push_front(message);
                        queue.notify.notify_one();
                    }
                    None
                }
                Settlement::Nack { requeue: false, .. } => state
                    .queues
                    .get(&queue_name)
                    .and_then(|q| q.dead_letter_route(&message.routing_key))
                    .map(|route| (route, message)),
            }
        };

        if let Some(((exchange, routing_key), message)) = dead_letter {
            self.route(&exchange, &routing_key, message);
        }
        Ok(())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .settle(delivery_tag, Settlement::Ack { delivery_tag })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner.settle(
            delivery_tag,
            Settlement::Nack {
                delivery_tag,
                requeue,
            },
        )
    }
}

struct InMemoryChannel {
    inner: Arc<Inner>,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
    next_publish_tag: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConveyorError::transport(operation, "channel is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open("qos")?;
        if self.inner.fail_qos.load(Ordering::SeqCst) {
            return Err(ConveyorError::transport("qos", "prefetch rejected by broker"));
        }
        self.inner.qos_requests.lock().push(prefetch_count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open("consume")?;
        if !self.inner.state.lock().queues.contains_key(queue) {
            return Err(ConveyorError::transport(
                "consume",
                format!("queue {queue} not declared"),
            ));
        }
        debug!(queue, consumer_tag, "Registered in-memory consumer");

        let stream = futures::stream::unfold(
            (self.inner.clone(), queue.to_string()),
            |(inner, queue)| async move {
                loop {
                    let notify = match inner.pop_delivery(&queue) {
                        Pop::Ready(delivery) => return Some((delivery, (inner, queue))),
                        Pop::Empty(notify) => notify,
                        Pop::Gone => return None,
                    };
                    notify.notified().await;
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<()> {
        self.ensure_open("publish")?;
        if !self.inner.state.lock().exchanges.contains_key(exchange) {
            return Err(ConveyorError::transport(
                "publish",
                format!("exchange {exchange} not declared"),
            ));
        }

        self.inner.route(
            exchange,
            routing_key,
            StoredMessage {
                id: 0,
                routing_key: routing_key.to_string(),
                body: publishing.body.clone(),
                content_encoding: publishing.content_encoding.clone(),
                headers: publishing.headers.clone(),
                redelivered: false,
            },
        );
        self.inner.published.lock().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            publishing,
        });

        let confirmation = Confirmation {
            delivery_tag: self.next_publish_tag.fetch_add(1, Ordering::Relaxed),
            ack: !self.inner.nack_confirms.load(Ordering::SeqCst),
        };
        // Nobody listening is fine; delayed publishes never wait for confirms.
        let _ = self.confirm_tx.send(confirmation);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.closed_channels.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// In-memory [`Connector`]; clones share one broker
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    inner: Arc<Inner>,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    pub fn new() -> Self {
        let (errors_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                declarations: Mutex::new(Vec::new()),
                qos_requests: Mutex::new(Vec::new()),
                settlements: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                next_delivery_tag: AtomicU64::new(1),
                next_message_id: AtomicU64::new(1),
                nack_confirms: AtomicBool::new(false),
                fail_declarations: AtomicBool::new(false),
                fail_qos: AtomicBool::new(false),
                closed_channels: AtomicU64::new(0),
                errors_tx,
            }),
        }
    }

    /// Negatively confirm every subsequent publish
    pub fn set_nack_confirms(&self, nack: bool) {
        self.inner.nack_confirms.store(nack, Ordering::SeqCst);
    }

    /// Fail every subsequent declaration with a transport error
    pub fn set_fail_declarations(&self, fail: bool) {
        self.inner.fail_declarations.store(fail, Ordering::SeqCst);
    }

    /// Fail every subsequent prefetch request with a transport error
    pub fn set_fail_qos(&self, fail: bool) {
        self.inner.fail_qos.store(fail, Ordering::SeqCst);
    }

    /// Number of channels closed so far
    pub fn closed_channel_count(&self) -> u64 {
        self.inner.closed_channels.load(Ordering::SeqCst)
    }

    /// Emit a fatal connection error to every subscriber
    pub fn inject_connection_error(&self, message: impl Into<String>) {
        let _ = self.inner.errors_tx.send(ConnectionError::new(message));
    }

    /// Enqueue a raw body directly, bypassing exchanges
    pub fn push_raw(&self, queue: &str, body: Vec<u8>, content_encoding: Option<&str>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(ConveyorError::transport(
                "push_raw",
                format!("queue {queue} not declared"),
            ));
        };
        target.messages.push_back(StoredMessage {
            id: self.inner.next_message_id.fetch_add(1, Ordering::Relaxed),
            routing_key: String::new(),
            body,
            content_encoding: content_encoding.map(str::to_string),
            headers: Headers::new(),
            redelivered: false,
        });
        target.notify.notify_one();
        Ok(())
    }

    /// Messages waiting in `queue`, excluding unacknowledged deliveries
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    pub fn queue_args(&self, queue: &str) -> Option<FieldArgs> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.args.clone())
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    pub fn declarations(&self) -> Vec<ExchangeDeclaration> {
        self.inner.declarations.lock().clone()
    }

    pub fn qos_requests(&self) -> Vec<u16> {
        self.inner.qos_requests.lock().clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.settlements.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().clone()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn exchange(&self, declaration: &ExchangeDeclaration) -> Result<BoundChannel> {
        if self.inner.fail_declarations.load(Ordering::SeqCst) {
            return Err(ConveyorError::transport(
                "declare",
                format!("exchange declare failed for {}", declaration.exchange_name),
            ));
        }
        self.inner.declarations.lock().push(declaration.clone());

        {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.exchanges.get(&declaration.exchange_name) {
                if existing != &declaration.exchange_type {
                    return Err(ConveyorError::transport(
                        "declare",
                        format!(
                            "exchange {} already declared as {existing}",
                            declaration.exchange_name
                        ),
                    ));
                }
            }
            state.exchanges.insert(
                declaration.exchange_name.clone(),
                declaration.exchange_type.clone(),
            );
            state
                .queues
                .entry(declaration.queue_name.clone())
                .or_insert_with(|| MemoryQueue::new(declaration.queue_args.clone()));

            let binding = Binding {
                exchange: declaration.exchange_name.clone(),
                queue: declaration.queue_name.clone(),
                key: declaration.binding_key.clone(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }

        let (confirm_tx, confirmations) = mpsc::unbounded_channel();
        Ok(BoundChannel {
            channel: Box::new(InMemoryChannel {
                inner: self.inner.clone(),
                confirm_tx,
                next_publish_tag: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
            queue: QueueInfo {
                name: declaration.queue_name.clone(),
            },
            confirmations,
        })
    }

    fn connection_errors(&self) -> ConnectionErrorReceiver {
        self.inner.errors_tx.subscribe()
    }
}
