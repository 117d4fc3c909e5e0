//! Background statistics collector
//!
//! One tokio task per manager, ticking on a fixed interval until stopped.
//! The running flag is checked before each tick so a tick never starts
//! after `stop()` has begun tearing the owner down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a running collector task
pub struct Collector {
    name: &'static str,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Collector {
    /// Spawn a collector calling `tick` every `every`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, every: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let task_running = running.clone();
        let task_shutdown = shutdown.clone();
        let period = every.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_shutdown.notified() => break,
                }

                if !task_running.load(Ordering::Acquire) {
                    break;
                }

                tick().await;
            }

            tracing::debug!(collector = name, "statistics collector exited");
        });

        tracing::debug!(collector = name, interval_ms = period.as_millis() as u64, "statistics collector started");

        Self {
            name,
            running,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the task and wait for an in-flight tick to finish
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(collector = self.name, error = %e, "collector task ended abnormally");
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();

        let mut collector = Collector::spawn("test", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        collector.stop().await;
        assert!(!collector.is_running());

        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), seen);
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let mut collector = Collector::spawn("idle", Duration::from_secs(60), || async {});
        collector.stop().await;
        collector.stop().await;
        assert!(!collector.is_running());
    }
}
