//! Periodic notification timer.
//!
//! While a characteristic is subscribed, a [`NotifyTimer`] re-emits its
//! current value at a fixed period.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// A repeating timer running on the tokio runtime.
///
/// The tick callback returns whether the timer should keep running; the
/// first `false` deschedules it. Cancellation is observed before every
/// tick, and callers that need a hard guarantee against a late tick guard
/// the callback body with their own state (see `Characteristic`).
pub struct NotifyTimer {
    period: Duration,
    cancelled: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotifyTimer {
    /// Start a timer whose first tick fires one `period` from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let task_cancelled = cancelled.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if task_cancelled.load(Ordering::SeqCst) {
                    break;
                }

                if !on_tick() {
                    trace!("Notify timer callback declined, descheduling");
                    break;
                }
            }

            task_cancelled.store(true, Ordering::SeqCst);
        });

        Self {
            period,
            cancelled,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Check if the timer is still scheduled.
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
            && self
                .handle
                .lock()
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for NotifyTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for NotifyTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyTimer")
            .field("period", &self.period)
            .field("active", &self.is_active())
            .finish()
    }
}
