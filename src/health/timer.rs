//! Periodic task with randomized spacing and on-demand wakeups

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs a callback every `interval`, each wait stretched or shrunk by up to
/// `jitter * interval`. [`JitterTimer::trigger`] runs it early.
pub struct JitterTimer {
    interval: Duration,
    jitter: f64,
    trigger: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

impl JitterTimer {
    pub fn new(interval: Duration, jitter: f64) -> Self {
        Self {
            interval,
            jitter: jitter.clamp(0.0, 1.0),
            trigger: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the task. Calling it again while running does nothing.
    pub fn start<F, Fut>(&self, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let trigger = self.trigger.clone();
        let interval = self.interval;
        let jitter = self.jitter;

        let handle = tokio::spawn(async move {
            loop {
                let delay = next_delay(interval, jitter);
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = trigger.notified() => debug!("Timer triggered"),
                    _ = tokio::time::sleep(delay) => {}
                }
                f().await;
            }
            debug!("Timer stopped");
        });

        *running = Some(Running { cancel, handle });
    }

    /// Stop the task, aborting a run in progress
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            running.handle.abort();
        }
    }

    /// Run the callback as soon as possible without waiting for it.
    ///
    /// No-op while stopped. Triggers arriving during a run coalesce into
    /// one extra run.
    pub fn trigger(&self) {
        if self.running.lock().is_some() {
            self.trigger.notify_one();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for JitterTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `interval` scaled by a uniform factor in `[1 - jitter, 1 + jitter]`
pub fn next_delay(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    interval.mul_f64(factor.max(0.0))
}
