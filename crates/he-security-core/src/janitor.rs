//! Background sweeper shared by every engine: one task per engine, started
//! on construction, stopped via a shutdown signal the caller joins.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

pub struct Janitor {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Spawn a tick loop that calls `sweep` on the given interval until
    /// `shutdown` is called. A panicking sweep is caught and logged as
    /// `JANITOR_ERROR`; the next tick retries rather than killing the task.
    pub fn spawn<F, Fut>(interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = AssertUnwindSafe(sweep()).catch_unwind().await;
                        if outcome.is_err() {
                            error!(event = "JANITOR_ERROR", "sweep task panicked, retrying next tick");
                        }
                    }
                    _ = shutdown_rx.notified() => break,
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signal the task to stop and block until it has returned.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
