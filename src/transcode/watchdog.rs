use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Kills a run once no progress sample has arrived for the configured
/// timeout. The first evaluation happens one full timeout after arming (a
/// stall cannot be older than that); afterwards the timer re-checks at
/// `clamp(timeout/2, 250ms, 2000ms)` intervals.
pub struct StallWatchdog {
    last_progress: Arc<Mutex<Instant>>,
    handle: JoinHandle<()>,
}

impl StallWatchdog {
    /// Arm the watchdog. `on_stall` runs at most once, from the timer task,
    /// and receives the configured timeout in milliseconds.
    pub fn spawn<F>(timeout_ms: u64, on_stall: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let last_progress = Arc::new(Mutex::new(Instant::now()));
        let observed = last_progress.clone();

        let timeout = Duration::from_millis(timeout_ms);
        let period = Duration::from_millis((timeout_ms / 2).clamp(250, 2000));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + timeout, period);
            loop {
                ticker.tick().await;
                let idle_for = observed.lock().unwrap().elapsed();
                if idle_for >= timeout {
                    debug!(
                        "no progress for {} ms (limit {} ms), aborting the run",
                        idle_for.as_millis(),
                        timeout_ms
                    );
                    on_stall(timeout_ms);
                    return;
                }
            }
        });

        Self {
            last_progress,
            handle,
        }
    }

    /// Record that a progress sample just arrived.
    pub fn touch(&self) {
        *self.last_progress.lock().unwrap() = Instant::now();
    }

    /// Tear the timer down without firing.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
