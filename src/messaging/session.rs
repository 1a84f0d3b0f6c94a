//! # Consumption Session
//!
//! Shared stop signal and retry hint for one broker's consumption loop,
//! plus the Fibonacci reconnect backoff that runs when setup fails.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::BackoffConfig;

/// Fibonacci delay schedule: `base × fib(n)`, capped at `max`
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    base: Duration,
    max: Duration,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            previous: 0,
            current: 1,
        }
    }

    /// Delay for the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.current;
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;

        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max)
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.current = 1;
    }
}

/// Stop signal and retry hint shared by reference inside a broker
#[derive(Debug)]
pub struct ConsumptionSession {
    retry: AtomicBool,
    stop_tx: watch::Sender<bool>,
    backoff: Mutex<FibonacciBackoff>,
}

impl ConsumptionSession {
    pub fn new(backoff: &BackoffConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            retry: AtomicBool::new(true),
            stop_tx,
            backoff: Mutex::new(FibonacciBackoff::new(backoff)),
        }
    }

    /// Arm the session for a new consumption call
    pub fn begin(&self) -> watch::Receiver<bool> {
        self.retry.store(true, Ordering::SeqCst);
        self.stop_tx.send_replace(false);
        self.stop_tx.subscribe()
    }

    /// Ask the active loop to exit; repeat calls are no-ops
    pub fn stop(&self) {
        self.retry.store(false, Ordering::SeqCst);
        let already_stopped = self.stop_tx.send_replace(true);
        if !already_stopped {
            info!("Consumption stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Whether the caller should reconnect and consume again
    pub fn should_retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Setup succeeded; the next failure starts the schedule over
    pub fn reset_backoff(&self) {
        self.backoff.lock().reset();
    }

    /// Sleep for the next backoff step unless stopped first
    pub async fn pause_before_retry(&self) {
        if !self.should_retry() {
            return;
        }
        let delay = self.backoff.lock().next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Backing off before reconnect");

        let mut stop_rx = self.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut stop_rx) => {
                debug!("Backoff interrupted by stop");
            }
        }
    }
}

/// Resolves once the watched stop flag is set; never resolves if the sender is gone
pub(crate) async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop_rx.borrow_and_update();
        if stopped {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff_config(base_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig { base_ms, max_ms }
    }

    #[test]
    fn test_fibonacci_schedule_is_capped() {
        let mut backoff = FibonacciBackoff::new(&backoff_config(10, 60));
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_stop_clears_retry_and_is_idempotent() {
        let session = ConsumptionSession::new(&BackoffConfig::default());
        let _rx = session.begin();
        assert!(session.should_retry());
        assert!(!session.is_stopped());

        session.stop();
        session.stop();
        assert!(!session.should_retry());
        assert!(session.is_stopped());

        let _rx = session.begin();
        assert!(session.should_retry());
        assert!(!session.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_wakes_waiters() {
        let session = std::sync::Arc::new(ConsumptionSession::new(&BackoffConfig::default()));
        let mut rx = session.begin();
        let waiter = tokio::spawn(async move { stop_requested(&mut rx).await });

        session.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff() {
        let session = std::sync::Arc::new(ConsumptionSession::new(&backoff_config(60_000, 60_000)));
        let _rx = session.begin();
        let sleeper = {
            let session = session.clone();
            tokio::spawn(async move { session.pause_before_retry().await })
        };
        tokio::task::yield_now().await;
        session.stop();
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("backoff should end on stop")
            .unwrap();
    }
}
