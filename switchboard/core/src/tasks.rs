//! Background Maintenance Tasks
//!
//! Fixed-cadence loops (pool idle eviction, session expiry sweep) owned by
//! the component that starts them. A task runs until its owner calls
//! [`PeriodicTask::shutdown`], the tick callback asks it to stop, or the
//! handle is dropped.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a spawned periodic task
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period` on the current tokio runtime.
    ///
    /// The first invocation happens one full period after spawning. The
    /// callback returns `false` to end the loop (e.g. when the component it
    /// maintains has been dropped).
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!(task = name, "Periodic task stopped");
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        Self {
            name,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Task name (for logging)
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the loop to stop and wait for it to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "Periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_cadence_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_end_loop() {
        let task = PeriodicTask::spawn("one-shot", Duration::from_secs(1), || async { false });
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(task.is_finished());
    }
}
