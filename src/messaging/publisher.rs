//! # Publisher
//!
//! Serializes a signature, compresses it past the size threshold, and
//! publishes it persistently to the configured exchange. Signatures with a
//! future ETA go through the [`DelayScheduler`] instead. Every publish opens
//! its own channel and waits for the broker's confirmation.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::compression::Compressor;
use super::connector::{Connector, DeliveryMode, ExchangeDeclaration, FieldArgs, Publishing};
use super::delay::DelayScheduler;
use super::signature::Signature;
use crate::config::{BrokerConfig, RoutingKeyPolicy};
use crate::constants::CONTENT_TYPE_JSON;
use crate::error::{ConveyorError, Result};
use crate::logging::log_broker_operation;

/// Serialize `signature` into an outgoing message, compressing if worthwhile
pub(crate) fn encode_publishing(signature: &Signature, compressor: &Compressor) -> Result<Publishing> {
    let body = signature.to_bytes()?;
    let (body, content_encoding) = if compressor.should_compress(&body) {
        (
            compressor.compress(&body),
            Some(compressor.encoding().to_string()),
        )
    } else {
        (body, None)
    };

    Ok(Publishing {
        headers: signature.headers.clone(),
        content_type: CONTENT_TYPE_JSON.to_string(),
        content_encoding,
        body,
        delivery_mode: DeliveryMode::Persistent,
    })
}

/// Fill in an empty routing key according to `config.routing_key_policy`
pub fn adjust_routing_key(signature: &mut Signature, config: &BrokerConfig) {
    if !signature.routing_key.is_empty() {
        return;
    }
    signature.routing_key = match config.routing_key_policy {
        RoutingKeyPolicy::BindingKey if config.is_direct_exchange() => config.binding_key.clone(),
        RoutingKeyPolicy::BindingKey => config.default_queue.clone(),
        RoutingKeyPolicy::TaskName => signature.name.clone(),
    };
}

/// Declaration of the main exchange, default queue and binding
pub(crate) fn default_declaration(config: &BrokerConfig) -> ExchangeDeclaration {
    ExchangeDeclaration {
        exchange_name: config.exchange.clone(),
        exchange_type: config.exchange_type.clone(),
        queue_name: config.default_queue.clone(),
        queue_durable: true,
        queue_auto_delete: false,
        binding_key: config.binding_key.clone(),
        exchange_args: FieldArgs::new(),
        queue_args: FieldArgs::new(),
        binding_args: config.queue_binding_args.clone(),
    }
}

/// Publishes signatures through a [`Connector`]
#[derive(Clone)]
pub struct Publisher {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    compressor: Compressor,
    delay: DelayScheduler,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.config.exchange)
            .field("default_queue", &self.config.default_queue)
            .finish()
    }
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig) -> Self {
        let compressor = Compressor::new();
        let delay = DelayScheduler::new(connector.clone(), config.clone(), compressor);
        Self {
            connector,
            config,
            compressor,
            delay,
        }
    }

    pub fn delay_scheduler(&self) -> &DelayScheduler {
        &self.delay
    }

    /// Publish `signature`, deferring it when its ETA lies in the future
    pub async fn publish(&self, mut signature: Signature) -> Result<()> {
        adjust_routing_key(&mut signature, &self.config);

        if let Some(delay_ms) = signature.delay_ms_from(Utc::now()) {
            return self.delay.delay(&signature, delay_ms).await;
        }

        let publishing = encode_publishing(&signature, &self.compressor)?;
        let compressed = publishing.content_encoding.is_some();

        let mut bound = self
            .connector
            .exchange(&default_declaration(&self.config))
            .await?;

        let outcome = async {
            bound
                .channel
                .publish(&self.config.exchange, &signature.routing_key, publishing)
                .await?;

            match bound.confirmations.recv().await {
                Some(confirmation) if confirmation.ack => Ok(()),
                Some(confirmation) => Err(ConveyorError::PublishNacked {
                    delivery_tag: confirmation.delivery_tag,
                }),
                None => Err(ConveyorError::transport(
                    "publish",
                    "confirmation stream closed before the broker confirmed",
                )),
            }
        }
        .await;

        if let Err(e) = bound.channel.close().await {
            warn!(error = %e, "Failed to close publish channel");
        }

        match &outcome {
            Ok(()) => {
                debug!(task_uuid = %signature.uuid, compressed, "Publish confirmed");
                log_broker_operation(
                    "publish",
                    &self.config.exchange,
                    &signature.routing_key,
                    Some(&signature.uuid),
                    "confirmed",
                    None,
                );
            }
            Err(e) => {
                let details = e.to_string();
                log_broker_operation(
                    "publish",
                    &self.config.exchange,
                    &signature.routing_key,
                    Some(&signature.uuid),
                    "failed",
                    Some(&details),
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::exchange_types;
    use crate::messaging::signature::Arg;
    use serde_json::json;

    #[test]
    fn test_routing_key_defaults_to_binding_key_on_direct_exchange() {
        let config = BrokerConfig::default();
        let mut sig = Signature::new("add");
        adjust_routing_key(&mut sig, &config);
        assert_eq!(sig.routing_key, config.binding_key);
    }

    #[test]
    fn test_routing_key_defaults_to_queue_on_other_exchanges() {
        let config = BrokerConfig {
            exchange_type: exchange_types::TOPIC.to_string(),
            ..BrokerConfig::default()
        };
        let mut sig = Signature::new("add");
        adjust_routing_key(&mut sig, &config);
        assert_eq!(sig.routing_key, config.default_queue);
    }

    #[test]
    fn test_task_name_policy_and_explicit_keys() {
        let config = BrokerConfig {
            routing_key_policy: RoutingKeyPolicy::TaskName,
            ..BrokerConfig::default()
        };
        let mut sig = Signature::new("resize_image");
        adjust_routing_key(&mut sig, &config);
        assert_eq!(sig.routing_key, "resize_image");

        let mut explicit = Signature::new("add").with_routing_key("math");
        adjust_routing_key(&mut explicit, &config);
        assert_eq!(explicit.routing_key, "math");
    }

    #[test]
    fn test_small_bodies_are_sent_uncompressed() {
        let compressor = Compressor::new();
        let sig = Signature::new("a").with_uuid("t");
        let publishing = encode_publishing(&sig, &compressor).unwrap();
        assert!(publishing.content_encoding.is_none());
        assert_eq!(publishing.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(Signature::from_bytes(&publishing.body).unwrap(), sig);
    }

    #[test]
    fn test_large_bodies_are_compressed_and_tagged() {
        let compressor = Compressor::new();
        let sig = Signature::new("add").with_args(vec![Arg::new("string", json!("x".repeat(512)))]);
        let publishing = encode_publishing(&sig, &compressor).unwrap();
        assert_eq!(publishing.content_encoding.as_deref(), Some("lz4"));
        let restored = compressor.decompress(&publishing.body).unwrap();
        assert_eq!(Signature::from_bytes(&restored).unwrap(), sig);
    }
}
