#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use conveyor_core::config::{BackoffConfig, BrokerConfig, ConveyorConfig};
use conveyor_core::messaging::providers::InMemoryConnector;
use conveyor_core::messaging::{AmqpBroker, Broker, ConsumeOutcome};
use conveyor_core::{Concurrency, Signature, TaskProcessor};

/// Records every processed signature and the peak number of concurrent calls
#[derive(Default)]
pub struct RecordingProcessor {
    processed: Mutex<Vec<Signature>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    hold: Duration,
    fail_task: Option<String>,
    gate: Option<Semaphore>,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Each call sleeps for `hold` before finishing
    pub fn holding(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            ..Self::default()
        })
    }

    /// Calls for `task_name` fail after being recorded
    pub fn failing_on(task_name: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_task: Some(task_name.to_string()),
            ..Self::default()
        })
    }

    /// Calls block until [`RecordingProcessor::release`] hands out permits
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn processed(&self) -> Vec<Signature> {
        self.processed.lock().clone()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().len()
    }

    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskProcessor for RecordingProcessor {
    async fn process(&self, signature: Signature) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let failed = self.fail_task.as_deref() == Some(signature.name.as_str());
        self.processed.lock().push(signature);
        if failed {
            anyhow::bail!("task failed on purpose");
        }
        Ok(())
    }
}

pub fn test_config() -> ConveyorConfig {
    ConveyorConfig {
        backoff: BackoffConfig {
            base_ms: 10,
            max_ms: 50,
        },
        ..ConveyorConfig::default()
    }
}

pub fn broker_with(connector: &InMemoryConnector, broker: BrokerConfig) -> Arc<AmqpBroker> {
    conveyor_core::logging::init_structured_logging();
    let config = test_config();
    Arc::new(AmqpBroker::new(
        Arc::new(connector.clone()),
        broker,
        &config.backoff,
    ))
}

pub fn default_broker(connector: &InMemoryConnector) -> Arc<AmqpBroker> {
    broker_with(connector, BrokerConfig::default())
}

pub fn spawn_consumer(
    broker: &Arc<AmqpBroker>,
    concurrency: Concurrency,
    processor: Arc<RecordingProcessor>,
) -> JoinHandle<ConsumeOutcome> {
    let broker = broker.clone();
    tokio::spawn(async move {
        broker
            .start_consuming("test_worker", concurrency, processor)
            .await
    })
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Wait until a consumer has set its prefetch, i.e. finished setup
pub async fn wait_for_consumer(connector: &InMemoryConnector) {
    let ready = wait_for(|| !connector.qos_requests().is_empty(), Duration::from_secs(2)).await;
    assert!(ready, "consumer never finished setup");
}

pub async fn join_outcome(handle: JoinHandle<ConsumeOutcome>) -> ConsumeOutcome {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumption should end")
        .expect("consumer task should not panic")
}
