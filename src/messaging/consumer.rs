//! # Consumption Engine
//!
//! A single coordinator selects over connection errors, handler errors,
//! new deliveries and the stop signal. Each delivery takes one slot from
//! the concurrency limiter and is handled on its own task. The first error
//! from any source ends the session; in-flight handlers are always drained
//! before the coordinator returns.

use async_trait::async_trait;
use futures::StreamExt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::compression::Compressor;
use super::connector::{ConnectionError, ConnectionErrorReceiver, DeliveryStream};
use super::delivery::Delivery;
use super::registry::TaskRegistry;
use super::session::stop_requested;
use super::signature::Signature;
use crate::error::{ConveyorError, Result};

/// Executes accepted tasks; called once per delivery, after acknowledgement
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, signature: Signature) -> anyhow::Result<()>;
}

/// Limit on concurrently running handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Bounded(NonZeroUsize),
    Unbounded,
}

impl Concurrency {
    /// Zero means unbounded
    pub fn bounded(limit: usize) -> Self {
        NonZeroUsize::new(limit).map_or(Self::Unbounded, Self::Bounded)
    }

    /// Zero or negative means unbounded
    pub fn from_limit(limit: i64) -> Self {
        if limit <= 0 {
            return Self::Unbounded;
        }
        Self::bounded(usize::try_from(limit).unwrap_or(Semaphore::MAX_PERMITS))
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Bounded(limit) => Some(limit.get()),
            Self::Unbounded => None,
        }
    }

    fn limiter(&self) -> Option<Arc<Semaphore>> {
        self.limit()
            .map(|limit| Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS))))
    }
}

impl From<i64> for Concurrency {
    fn from(limit: i64) -> Self {
        Self::from_limit(limit)
    }
}

/// Everything a handler needs to settle and dispatch one delivery
pub struct HandlerContext {
    pub consumer_tag: String,
    pub registry: Arc<TaskRegistry>,
    pub processor: Arc<dyn TaskProcessor>,
    pub compressor: Compressor,
    pub drop_unregistered_tasks: bool,
}

async fn reject(delivery: Delivery, requeue: bool) {
    let delivery_tag = delivery.delivery_tag;
    if let Err(e) = delivery.nack(requeue).await {
        warn!(delivery_tag, requeue, error = %e, "Failed to reject delivery");
    }
}

/// Decode, settle and process a single delivery
pub async fn consume_one(mut delivery: Delivery, ctx: &HandlerContext) -> Result<()> {
    if delivery.body.is_empty() {
        reject(delivery, false).await;
        return Err(ConveyorError::EmptyDelivery);
    }

    let delivery_tag = delivery.delivery_tag;
    debug!(
        consumer_tag = %ctx.consumer_tag,
        delivery_tag,
        body_len = delivery.body.len(),
        "Received new message"
    );

    let mut body = std::mem::take(&mut delivery.body);
    if ctx
        .compressor
        .is_compressed(delivery.content_encoding.as_deref())
    {
        body = match ctx.compressor.decompress(&body) {
            Ok(decompressed) => decompressed,
            Err(e) => {
                reject(delivery, false).await;
                return Err(e);
            }
        };
    }

    let signature = match Signature::from_bytes(&body) {
        Ok(signature) => signature,
        Err(e) => {
            reject(delivery, false).await;
            return Err(e.into());
        }
    };

    if !ctx.registry.is_task_registered(&signature.name) {
        let requeue = !ctx.drop_unregistered_tasks;
        reject(delivery, requeue).await;
        if requeue {
            warn!(task_name = %signature.name, delivery_tag, "Requeued unknown message");
        } else {
            warn!(task_name = %signature.name, delivery_tag, "Discarded unknown message");
        }
        return Ok(());
    }

    delivery.ack().await?;

    let task_name = signature.name.clone();
    ctx.processor
        .process(signature)
        .await
        .map_err(|e| ConveyorError::processing(task_name, e))
}

fn connection_failure(
    received: std::result::Result<ConnectionError, broadcast::error::RecvError>,
) -> ConveyorError {
    let message = match received {
        Ok(err) => err.message,
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            format!("{missed} connection errors were not observed in time")
        }
        Err(broadcast::error::RecvError::Closed) => "connection error stream closed".to_string(),
    };
    ConveyorError::transport("connection", message)
}

/// A panicked handler ends the session like any other handler error
fn handler_panic(joined: &tokio::task::JoinError) -> Option<ConveyorError> {
    joined.is_panic().then(|| {
        ConveyorError::processing("unknown", anyhow::anyhow!("handler panicked: {joined}"))
    })
}

/// Run the dispatch loop until stop, a connection error or a handler error
pub(crate) async fn consume(
    mut deliveries: DeliveryStream,
    mut connection_errors: ConnectionErrorReceiver,
    concurrency: Concurrency,
    ctx: Arc<HandlerContext>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let limiter = concurrency.limiter();
    let (error_tx, mut error_rx) = mpsc::channel::<ConveyorError>(1);
    let (quit_tx, quit_rx) = watch::channel(false);
    let mut handlers = JoinSet::new();

    info!(
        consumer_tag = %ctx.consumer_tag,
        concurrency = ?concurrency.limit(),
        "Waiting for messages"
    );

    let outcome = 'dispatch: loop {
        tokio::select! {
            received = connection_errors.recv() => {
                break 'dispatch Err(connection_failure(received));
            }
            Some(err) = error_rx.recv() => {
                break 'dispatch Err(err);
            }
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    if let Some(err) = handler_panic(&e) {
                        break 'dispatch Err(err);
                    }
                }
            }
            next = deliveries.next() => {
                let Some(delivery) = next else {
                    break 'dispatch Err(ConveyorError::transport(
                        "consume",
                        "delivery stream ended",
                    ));
                };

                let permit = match &limiter {
                    None => None,
                    Some(semaphore) => tokio::select! {
                        acquired = semaphore.clone().acquire_owned() => match acquired {
                            Ok(permit) => Some(permit),
                            Err(_) => break 'dispatch Err(ConveyorError::transport(
                                "consume",
                                "concurrency limiter closed",
                            )),
                        },
                        _ = stop_requested(&mut stop_rx) => {
                            reject(delivery, true).await;
                            break 'dispatch Ok(());
                        }
                    },
                };

                let ctx = ctx.clone();
                let error_tx = error_tx.clone();
                let mut quit_rx = quit_rx.clone();
                handlers.spawn(async move {
                    let result = consume_one(delivery, &ctx).await;
                    drop(permit);

                    if let Err(err) = result {
                        tokio::select! {
                            sent = error_tx.send(err) => {
                                if let Err(unsent) = sent {
                                    debug!(error = %unsent.0, "Coordinator gone; discarding handler error");
                                }
                            }
                            _ = stop_requested(&mut quit_rx) => {
                                debug!("Session ended; discarding handler error");
                            }
                        }
                    }
                });
            }
            _ = stop_requested(&mut stop_rx) => {
                break 'dispatch Ok(());
            }
        }
    };

    quit_tx.send_replace(true);
    let in_flight = handlers.len();
    if in_flight > 0 {
        debug!(in_flight, "Draining in-flight handlers");
    }
    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Handler task failed while draining");
        }
    }

    match &outcome {
        Ok(()) => info!(consumer_tag = %ctx.consumer_tag, "Consumption stopped"),
        Err(e) => error!(consumer_tag = %ctx.consumer_tag, error = %e, "Consumption ended with error"),
    }
    outcome
}
