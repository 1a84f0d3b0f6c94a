//! # Delay Scheduler
//!
//! Delayed delivery without a scheduler process: the signature is parked in
//! a consumer-less queue whose messages expire after the delay and are
//! dead-lettered back onto the main exchange with the main binding key.
//!
//! One queue exists per `(delay, exchange, binding key)`. Every publish
//! redeclares it, which restarts the queue's idle-expiry clock.

use std::sync::Arc;
use tracing::{debug, warn};

use super::compression::Compressor;
use super::connector::{Connector, ExchangeDeclaration, FieldArgs};
use super::publisher::encode_publishing;
use super::signature::Signature;
use crate::config::BrokerConfig;
use crate::constants::{queue_args, DELAY_QUEUE_PREFIX};
use crate::error::{ConveyorError, Result};
use crate::logging::log_broker_operation;

/// Deterministic delay-queue name, `delay.{ms}.{exchange}.{binding_key}`
pub fn delay_queue_name(delay_ms: i64, exchange: &str, binding_key: &str) -> String {
    format!("{DELAY_QUEUE_PREFIX}.{delay_ms}.{exchange}.{binding_key}")
}

/// Queue arguments that make expired messages re-enter normal delivery
pub fn delay_queue_args(delay_ms: i64, config: &BrokerConfig) -> FieldArgs {
    let mut args = FieldArgs::new();
    args.insert(
        queue_args::DEAD_LETTER_EXCHANGE.to_string(),
        serde_json::Value::from(config.exchange.clone()),
    );
    args.insert(
        queue_args::DEAD_LETTER_ROUTING_KEY.to_string(),
        serde_json::Value::from(config.binding_key.clone()),
    );
    args.insert(
        queue_args::MESSAGE_TTL.to_string(),
        serde_json::Value::from(delay_ms),
    );
    args.insert(
        queue_args::EXPIRES.to_string(),
        serde_json::Value::from(delay_ms.saturating_mul(2)),
    );
    args
}

/// Declaration of the delay queue for `delay_ms`; non-positive delays are rejected
pub fn delay_declaration(delay_ms: i64, config: &BrokerConfig) -> Result<ExchangeDeclaration> {
    if delay_ms <= 0 {
        return Err(ConveyorError::validation(format!(
            "delay must be positive, got {delay_ms}ms"
        )));
    }
    let queue_name = delay_queue_name(delay_ms, &config.exchange, &config.binding_key);
    Ok(ExchangeDeclaration {
        exchange_name: config.exchange.clone(),
        exchange_type: config.exchange_type.clone(),
        binding_key: queue_name.clone(),
        queue_name,
        queue_durable: true,
        queue_auto_delete: false,
        exchange_args: FieldArgs::new(),
        queue_args: delay_queue_args(delay_ms, config),
        binding_args: config.queue_binding_args.clone(),
    })
}

#[derive(Clone)]
pub struct DelayScheduler {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    compressor: Compressor,
}

impl DelayScheduler {
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig, compressor: Compressor) -> Self {
        Self {
            connector,
            config,
            compressor,
        }
    }

    /// Park `signature` for `delay_ms` milliseconds.
    ///
    /// Returns once the message is handed to the delay queue; redelivery
    /// is left to the broker.
    pub async fn delay(&self, signature: &Signature, delay_ms: i64) -> Result<()> {
        let declaration = delay_declaration(delay_ms, &self.config)?;
        let publishing = encode_publishing(signature, &self.compressor)?;

        let bound = self.connector.exchange(&declaration).await?;
        let published = bound
            .channel
            .publish(&self.config.exchange, &declaration.queue_name, publishing)
            .await;

        if let Err(e) = bound.channel.close().await {
            warn!(error = %e, queue = %declaration.queue_name, "Failed to close delay channel");
        }
        published?;

        debug!(
            task_uuid = %signature.uuid,
            queue = %declaration.queue_name,
            delay_ms,
            "Task parked in delay queue"
        );
        log_broker_operation(
            "delay",
            &self.config.exchange,
            &declaration.queue_name,
            Some(&signature.uuid),
            "published",
            None,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_queue_name_is_deterministic() {
        assert_eq!(
            delay_queue_name(1500, "conveyor_exchange", "conveyor_task"),
            "delay.1500.conveyor_exchange.conveyor_task"
        );
        assert_eq!(
            delay_queue_name(1500, "x", "k"),
            delay_queue_name(1500, "x", "k")
        );
        assert_ne!(delay_queue_name(1500, "x", "k"), delay_queue_name(1501, "x", "k"));
    }

    #[test]
    fn test_declaration_dead_letters_back_to_main_route() {
        let config = BrokerConfig::default();
        let declaration = delay_declaration(250, &config).unwrap();

        assert_eq!(declaration.queue_name, "delay.250.conveyor_exchange.conveyor_task");
        assert_eq!(declaration.binding_key, declaration.queue_name);
        assert!(declaration.queue_durable);
        assert_eq!(
            declaration.queue_args.get("x-dead-letter-exchange"),
            Some(&json!("conveyor_exchange"))
        );
        assert_eq!(
            declaration.queue_args.get("x-dead-letter-routing-key"),
            Some(&json!("conveyor_task"))
        );
        assert_eq!(declaration.queue_args.get("x-message-ttl"), Some(&json!(250)));
        assert_eq!(declaration.queue_args.get("x-expires"), Some(&json!(500)));
    }

    #[test]
    fn test_non_positive_delay_is_validation_error() {
        let config = BrokerConfig::default();
        for delay_ms in [0, -1, i64::MIN] {
            let err = delay_declaration(delay_ms, &config).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }
}
