//! # Broker
//!
//! [`AmqpBroker`] composes the pieces: a [`Connector`] capability, its own
//! [`TaskRegistry`], a [`ConsumptionSession`] and a [`Publisher`]. Several
//! brokers can coexist in one process with independent registries.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::compression::Compressor;
use super::connector::{BoundChannel, Connector, DeliveryStream};
use super::consumer::{self, Concurrency, HandlerContext, TaskProcessor};
use super::publisher::{default_declaration, Publisher};
use super::registry::TaskRegistry;
use super::session::ConsumptionSession;
use super::signature::Signature;
use crate::config::{BackoffConfig, BrokerConfig, ConsumerConfig, ConveyorConfig};
use crate::error::Result;
use crate::logging::log_error;

/// How a consumption call ended
#[derive(Debug)]
pub struct ConsumeOutcome {
    /// Whether reconnecting and consuming again is appropriate
    pub retry: bool,
    pub result: Result<()>,
}

impl ConsumeOutcome {
    pub fn is_clean_stop(&self) -> bool {
        self.result.is_ok()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Consume until stopped or until the first fatal error
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: Concurrency,
        processor: Arc<dyn TaskProcessor>,
    ) -> ConsumeOutcome;

    /// Idempotent; the active loop exits at its next scheduling point
    fn stop_consuming(&self);

    async fn publish(&self, signature: Signature) -> Result<()>;

    fn is_task_registered(&self, name: &str) -> bool;
}

pub struct AmqpBroker {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    registry: Arc<TaskRegistry>,
    session: Arc<ConsumptionSession>,
    publisher: Publisher,
    compressor: Compressor,
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("exchange", &self.config.exchange)
            .field("default_queue", &self.config.default_queue)
            .field("registered_tasks", &self.registry.registered_tasks())
            .finish()
    }
}

impl AmqpBroker {
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig, backoff: &BackoffConfig) -> Self {
        let publisher = Publisher::new(connector.clone(), config.clone());
        Self {
            connector,
            config,
            registry: Arc::new(TaskRegistry::new()),
            session: Arc::new(ConsumptionSession::new(backoff)),
            publisher,
            compressor: Compressor::new(),
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &ConveyorConfig) -> Self {
        Self::new(connector, config.broker.clone(), &config.backoff)
    }

    /// Share an existing registry instead of the broker's own
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<ConsumptionSession> {
        &self.session
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Consume with the tag and concurrency from the `consumer` config section
    pub async fn start_consuming_with(
        &self,
        config: &ConsumerConfig,
        processor: Arc<dyn TaskProcessor>,
    ) -> ConsumeOutcome {
        self.start_consuming(
            &config.consumer_tag,
            Concurrency::from(config.concurrency),
            processor,
        )
        .await
    }

    /// Park `signature` in the delay queue for `delay_ms` milliseconds
    pub async fn delay(&self, signature: &Signature, delay_ms: i64) -> Result<()> {
        self.publisher
            .delay_scheduler()
            .delay(signature, delay_ms)
            .await
    }

    async fn open_deliveries(&self, consumer_tag: &str) -> Result<(BoundChannel, DeliveryStream)> {
        let bound = self
            .connector
            .exchange(&default_declaration(&self.config))
            .await?;

        let stream = async {
            bound.channel.qos(self.config.prefetch_count).await?;
            bound.channel.consume(&bound.queue.name, consumer_tag).await
        }
        .await;

        match stream {
            Ok(stream) => Ok((bound, stream)),
            Err(e) => {
                if let Err(close_err) = bound.channel.close().await {
                    warn!(consumer_tag, error = %close_err, "Failed to close channel after setup error");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: Concurrency,
        processor: Arc<dyn TaskProcessor>,
    ) -> ConsumeOutcome {
        let stop_rx = self.session.begin();
        let connection_errors = self.connector.connection_errors();

        let (bound, deliveries) = match self.open_deliveries(consumer_tag).await {
            Ok(opened) => opened,
            Err(e) => {
                log_error("broker", "start_consuming", &e.to_string(), Some(consumer_tag));
                self.session.pause_before_retry().await;
                return ConsumeOutcome {
                    retry: self.session.should_retry(),
                    result: Err(e),
                };
            }
        };
        self.session.reset_backoff();
        info!(
            consumer_tag,
            queue = %bound.queue.name,
            prefetch_count = self.config.prefetch_count,
            "Consumer registered"
        );

        let ctx = Arc::new(HandlerContext {
            consumer_tag: consumer_tag.to_string(),
            registry: self.registry.clone(),
            processor,
            compressor: self.compressor,
            drop_unregistered_tasks: self.config.drop_unregistered_tasks,
        });
        let result =
            consumer::consume(deliveries, connection_errors, concurrency, ctx, stop_rx).await;

        if let Err(e) = bound.channel.close().await {
            error!(consumer_tag, error = %e, "Failed to close consumer channel");
        }

        ConsumeOutcome {
            retry: self.session.should_retry(),
            result,
        }
    }

    fn stop_consuming(&self) {
        self.session.stop();
    }

    async fn publish(&self, signature: Signature) -> Result<()> {
        self.publisher.publish(signature).await
    }

    fn is_task_registered(&self, name: &str) -> bool {
        self.registry.is_task_registered(name)
    }
}
