//! Cancellable "run this every N seconds" primitive.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Target = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Invokes a target immediately on start and then every `interval` until stopped.
///
/// Errors and panics of the target are logged and never end the loop.
pub struct PeriodicScheduler {
    name: String,
    interval: Duration,
    target: Target,
    running: Mutex<Option<Running>>,
}

impl PeriodicScheduler {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, target: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            target: Arc::new(move || target().boxed()),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn slot(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Starts the loop; does nothing while a previous loop is still alive.
    pub fn start(&self) {
        let mut slot = self.slot();
        if slot
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.name.clone(),
            self.interval,
            Arc::clone(&self.target),
            stop_rx,
        ));
        *slot = Some(Running { stop_tx, handle });
    }

    /// Requests the loop to end. With `join` the caller waits for the loop to exit,
    /// at most `timeout` if given. Returns whether the loop is known to have exited.
    pub async fn stop(&self, join: bool, timeout: Option<Duration>) -> bool {
        let running = {
            let mut slot = self.slot();
            let Some(running) = slot.as_ref() else {
                return true;
            };
            let _ = running.stop_tx.send(true);
            if !join {
                return running.handle.is_finished();
            }
            match slot.take() {
                Some(running) => running,
                None => return true,
            }
        };

        let Running {
            stop_tx,
            mut handle,
        } = running;
        let joined = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut handle).await.is_ok(),
            None => {
                let _ = (&mut handle).await;
                true
            }
        };
        if !joined {
            let mut slot = self.slot();
            if slot.is_none() {
                *slot = Some(Running { stop_tx, handle });
            }
        }
        joined
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.slot().as_ref() {
            let _ = running.stop_tx.send(true);
        }
    }
}

async fn run_loop(
    name: String,
    interval: Duration,
    target: Target,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!(scheduler = %name, interval_ms = interval.as_millis(), "periodic scheduler started");
    loop {
        match AssertUnwindSafe(target()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(scheduler = %name, error = ?err, "error while running periodic scheduler function");
            }
            Err(_) => {
                error!(scheduler = %name, "periodic scheduler function panicked");
            }
        }

        // A dropped sender counts as a stop request.
        let woken = tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = stop_rx.wait_for(|stop| *stop) => true,
        };
        if woken || *stop_rx.borrow() {
            debug!(scheduler = %name, "stopped poller");
            break;
        }
    }
}
