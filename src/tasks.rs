//! Background work that runs on a fixed period.
//!
//! Both the session sweeper and the memory governor are [`PeriodicTask`]s:
//! a tokio task ticking on `tokio::time::interval` until stopped. Because
//! they only depend on tokio's clock, tests drive them with paused time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub struct PeriodicTask {
    name: &'static str,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start calling `tick` every `period`. The first call happens one
    /// period after spawning, not immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::start(name, period, move || {
            tick();
            std::future::ready(())
        })
    }

    /// Like [`spawn`](Self::spawn), but each `tick` runs on tokio's blocking
    /// pool. For ticks that touch the filesystem. A tick finishes before the
    /// next one is scheduled.
    pub fn spawn_blocking<F>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let tick = Arc::new(tick);
        Self::start(name, period, move || {
            let tick = tick.clone();
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || (*tick)()).await {
                    warn!(task = name, error = %e, "periodic tick failed");
                }
            }
        })
    }

    fn start<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    // Fires on stop and when the sender is dropped.
                    _ = rx.changed() => break,
                }
            }
            debug!(task = name, "periodic task stopped");
        });
        debug!(task = name, period_secs = period.as_secs_f64(), "periodic task started");
        Self {
            name,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the task and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
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
