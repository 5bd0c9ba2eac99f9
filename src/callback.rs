//! Event callbacks fed from broadcast channels.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle for a registered callback.
///
/// The callback runs on its own task until the handle is dropped,
/// [`unregister`](Self::unregister) is called, or the event source closes.
pub struct CallbackHandle {
    id: u64,
    listener: Option<JoinHandle<()>>,
}

impl CallbackHandle {
    /// Run `callback` for every event received on `rx`.
    ///
    /// Events missed because the callback fell behind are skipped.
    pub(crate) fn listen<T, F>(id: u64, mut rx: broadcast::Receiver<T>, callback: F) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Callback {} skipped {} events", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            id,
            listener: Some(listener),
        }
    }

    /// Unregister this callback now.
    pub fn unregister(mut self) {
        self.stop();
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the callback still receives events.
    pub fn is_active(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
