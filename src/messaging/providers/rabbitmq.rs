//! # RabbitMQ Connector
//!
//! [`Connector`] over the `lapin` crate (AMQP 0.9.1). Each declaration opens
//! a fresh channel in publisher-confirm mode; confirmations are forwarded to
//! the returned confirmation stream in publish order. Connection errors
//! reported by lapin are broadcast to every consumption session.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::constants::exchange_types;
use crate::error::{ConveyorError, Result};
use crate::messaging::connector::{
    BoundChannel, BrokerChannel, Confirmation, ConnectionError, ConnectionErrorReceiver,
    Connector, DeliveryMode, DeliveryStream, ExchangeDeclaration, FieldArgs, Publishing,
    QueueInfo,
};
use crate::messaging::delivery::{Acknowledger, Delivery};
use crate::messaging::signature::Headers;

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        exchange_types::DIRECT => ExchangeKind::Direct,
        exchange_types::FANOUT => ExchangeKind::Fanout,
        exchange_types::TOPIC => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn json_value(value: &AMQPValue) -> serde_json::Value {
    match value {
        AMQPValue::Boolean(b) => serde_json::Value::from(*b),
        AMQPValue::ShortShortInt(i) => serde_json::Value::from(*i),
        AMQPValue::ShortShortUInt(i) => serde_json::Value::from(*i),
        AMQPValue::ShortInt(i) => serde_json::Value::from(*i),
        AMQPValue::ShortUInt(i) => serde_json::Value::from(*i),
        AMQPValue::LongInt(i) => serde_json::Value::from(*i),
        AMQPValue::LongUInt(i) => serde_json::Value::from(*i),
        AMQPValue::LongLongInt(i) => serde_json::Value::from(*i),
        AMQPValue::Float(f) => serde_json::Value::from(*f),
        AMQPValue::Double(f) => serde_json::Value::from(*f),
        AMQPValue::ShortString(s) => serde_json::Value::from(s.as_str()),
        AMQPValue::LongString(s) => {
            serde_json::Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        _ => serde_json::Value::Null,
    }
}

fn field_table(args: &FieldArgs) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(key.as_str().into(), amqp_value(value));
    }
    table
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
        .collect()
}

fn transport(operation: &str) -> impl Fn(lapin::Error) -> ConveyorError + '_ {
    move |e| ConveyorError::transport(operation, e.to_string())
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(transport("ack"))
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(transport("nack"))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let content_encoding = delivery
        .properties
        .content_encoding()
        .as_ref()
        .map(|encoding| encoding.as_str().to_string());
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(headers_from_table)
        .unwrap_or_default();

    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        content_encoding,
        headers,
        Box::new(LapinAcker(delivery.acker)),
    )
    .redelivered(delivery.redelivered)
}

struct RabbitMqChannel {
    channel: Channel,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
    next_publish_tag: AtomicU64,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(transport("qos"))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport("consume"))?;

        let stream = futures::stream::unfold(consumer, |mut consumer| async move {
            match consumer.next().await {
                Some(Ok(delivery)) => Some((into_delivery(delivery), consumer)),
                Some(Err(e)) => {
                    warn!(error = %e, "RabbitMQ consumer failed");
                    None
                }
                None => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<()> {
        let delivery_mode = match publishing.delivery_mode {
            DeliveryMode::Persistent => PERSISTENT_DELIVERY_MODE,
            DeliveryMode::Transient => TRANSIENT_DELIVERY_MODE,
        };
        let mut properties = BasicProperties::default()
            .with_content_type(publishing.content_type.as_str().into())
            .with_delivery_mode(delivery_mode)
            .with_headers(field_table(&publishing.headers));
        if let Some(encoding) = &publishing.content_encoding {
            properties = properties.with_content_encoding(encoding.as_str().into());
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &publishing.body,
                properties,
            )
            .await
            .map_err(transport("publish"))?;

        let delivery_tag = self.next_publish_tag.fetch_add(1, Ordering::Relaxed);
        let confirm_tx = self.confirm_tx.clone();
        tokio::spawn(async move {
            let ack = match confirm.await {
                Ok(confirmation) => !confirmation.is_nack(),
                Err(e) => {
                    warn!(delivery_tag, error = %e, "Publisher confirmation failed");
                    false
                }
            };
            let _ = confirm_tx.send(Confirmation { delivery_tag, ack });
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(transport("close"))
    }
}

/// AMQP [`Connector`] backed by one lapin connection
pub struct RabbitMqConnector {
    connection: Connection,
    errors_tx: broadcast::Sender<ConnectionError>,
}

impl std::fmt::Debug for RabbitMqConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqConnector").finish_non_exhaustive()
    }
}

impl RabbitMqConnector {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name("conveyor".into()),
        )
        .await
        .map_err(|e| ConveyorError::transport("connect", format!("RabbitMQ connection failed: {e}")))?;

        let (errors_tx, _) = broadcast::channel(16);
        let forward = errors_tx.clone();
        connection.on_error(move |e| {
            warn!(error = %e, "RabbitMQ connection error");
            let _ = forward.send(ConnectionError::new(e.to_string()));
        });

        info!("Connected to RabbitMQ");
        Ok(Self {
            connection,
            errors_tx,
        })
    }

    pub async fn from_config(config: &BrokerConfig) -> Result<Self> {
        Self::connect(&config.url).await
    }

    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(transport("close"))
    }
}

#[async_trait]
impl Connector for RabbitMqConnector {
    async fn exchange(&self, declaration: &ExchangeDeclaration) -> Result<BoundChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(transport("create_channel"))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(transport("confirm_select"))?;

        channel
            .exchange_declare(
                &declaration.exchange_name,
                exchange_kind(&declaration.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                field_table(&declaration.exchange_args),
            )
            .await
            .map_err(transport("exchange_declare"))?;

        let queue = channel
            .queue_declare(
                &declaration.queue_name,
                QueueDeclareOptions {
                    durable: declaration.queue_durable,
                    auto_delete: declaration.queue_auto_delete,
                    ..Default::default()
                },
                field_table(&declaration.queue_args),
            )
            .await
            .map_err(transport("queue_declare"))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                &declaration.exchange_name,
                &declaration.binding_key,
                QueueBindOptions::default(),
                field_table(&declaration.binding_args),
            )
            .await
            .map_err(transport("queue_bind"))?;

        debug!(
            exchange = %declaration.exchange_name,
            queue = %queue.name(),
            binding_key = %declaration.binding_key,
            "Declared and bound queue"
        );

        let (confirm_tx, confirmations) = mpsc::unbounded_channel();
        Ok(BoundChannel {
            queue: QueueInfo {
                name: queue.name().as_str().to_string(),
            },
            channel: Box::new(RabbitMqChannel {
                channel,
                confirm_tx,
                next_publish_tag: AtomicU64::new(1),
            }),
            confirmations,
        })
    }

    fn connection_errors(&self) -> ConnectionErrorReceiver {
        self.errors_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_kinds() {
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom(name) if name == "x-delayed-message"
        ));
    }

    #[test]
    fn test_queue_args_keep_integer_ttl() {
        let mut args = FieldArgs::new();
        args.insert("x-message-ttl".to_string(), json!(1500));
        args.insert("x-dead-letter-exchange".to_string(), json!("conveyor_exchange"));

        let table = field_table(&args);
        let ttl = table.inner().get(&ShortString::from("x-message-ttl")).cloned();
        assert_eq!(ttl, Some(AMQPValue::LongLongInt(1500)));

        let headers = headers_from_table(&table);
        assert_eq!(headers.get("x-message-ttl"), Some(&json!(1500)));
        assert_eq!(
            headers.get("x-dead-letter-exchange"),
            Some(&json!("conveyor_exchange"))
        );
    }
}
