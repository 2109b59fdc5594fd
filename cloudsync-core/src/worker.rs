//! Single-consumer loop executing [`SyncTask`]s pulled from a [`TaskQueue`].
//!
//! Failures never leave [`Worker::dispatch`]: each one is classified by its
//! [`ErrorKind`] and either turned into a terminal [`TaskState`] and acknowledged, or,
//! for transient failures below the retry limit, scheduled again with a back-off delay.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::notification::{LogNotifier, Notifier};
use crate::queue::TaskQueue;
use crate::task::{ErrorKind, QueueItem, SyncTask, TaskError, TaskState};

pub const DEFAULT_WAIT_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerConfig {
    /// Pause before a not-yet-ready task is put back.
    pub wait_delay: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            wait_delay: DEFAULT_WAIT_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

pub struct Worker {
    id: usize,
    queue: Arc<dyn TaskQueue>,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(id: usize, queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        Self {
            id,
            queue,
            notifier: Arc::new(LogNotifier),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs the loop on its own tokio task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Pulls tasks until the stop token arrives.
    ///
    /// A panic anywhere in one iteration, including in queue callbacks, is logged and the
    /// loop goes on with the next item.
    pub async fn run(&self) {
        debug!(worker = self.id, "worker started");
        loop {
            let task = match self.queue.get_task().await {
                QueueItem::Stop => {
                    debug!(worker = self.id, "worker stopped");
                    break;
                }
                QueueItem::Task(task) => task,
            };

            let description = task.to_string();
            if AssertUnwindSafe(self.handle(task)).catch_unwind().await.is_err() {
                error!(worker = self.id, task = %description, "panic while handling task");
            }
        }
    }

    async fn handle(&self, task: SyncTask) {
        if task.is_deferred(OffsetDateTime::now_utc()) {
            tokio::time::sleep(self.config.wait_delay).await;
            self.queue.put_task(task);
            return;
        }

        debug!(worker = self.id, task = %task, "dispatching task");
        self.dispatch(task).await;
    }

    /// Executes one task and records its outcome.
    pub async fn dispatch(&self, mut task: SyncTask) {
        let result = if task.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            task.tries += 1;
            info!(worker = self.id, task = %task, tries = task.tries, "calling execute");
            match AssertUnwindSafe(task.execute()).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Other(anyhow::anyhow!("task panicked during execute"))),
            }
        };

        let state = match result {
            Ok(()) => {
                info!(worker = self.id, task = %task, "finished execute");
                TaskState::Successful
            }
            Err(err) => match err.kind() {
                ErrorKind::TransientRetryable if task.tries < self.config.max_retries => {
                    let delay = self.config.backoff.delay(task.tries);
                    task.execute_after = Some(OffsetDateTime::now_utc() + delay);
                    info!(
                        worker = self.id,
                        task = %task,
                        error = %err,
                        delay_secs = delay.as_secs_f64(),
                        "task could not be executed, backing off"
                    );
                    self.queue.put_task(task);
                    return;
                }
                ErrorKind::TransientRetryable => {
                    info!(worker = self.id, task = %task, error = %err, "task failed after retries");
                    TaskState::CurrentlyNotPossible
                }
                ErrorKind::PolicyViolation => {
                    info!(worker = self.id, task = %task, error = %err, "policy error");
                    self.notifier
                        .display_notification("Policy Error", &err.to_string());
                    TaskState::InvalidOperation
                }
                ErrorKind::InvalidOperation => {
                    info!(worker = self.id, task = %task, error = %err, "invalid operation");
                    TaskState::InvalidOperation
                }
                ErrorKind::VersionConflict => {
                    info!(worker = self.id, task = %task, error = %err, "version ids are not matching");
                    TaskState::VersionIdMismatch
                }
                ErrorKind::Cancelled => {
                    debug!(worker = self.id, task = %task, "task got cancelled");
                    TaskState::Cancelled
                }
                ErrorKind::AuthFailure => {
                    info!(worker = self.id, task = %task, error = %err, "service is not authenticated");
                    TaskState::InvalidAuthentication
                }
                ErrorKind::Unknown => {
                    warn!(worker = self.id, task = %task, error = ?err, "unexpected error from task");
                    TaskState::InvalidOperation
                }
            },
        };

        task.state = state;
        self.queue.ack_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AckCallback, PutTaskCallback};
    use crate::testing::{ok_task, task_with};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    /// Deque-backed queue that never blocks: an empty queue yields the stop token.
    #[derive(Default)]
    struct ListQueue {
        items: Mutex<VecDeque<QueueItem>>,
        acked: Mutex<Vec<SyncTask>>,
    }

    impl ListQueue {
        fn with(items: Vec<QueueItem>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items.into()),
                acked: Mutex::new(Vec::new()),
            })
        }

        fn take_pending_task(&self) -> Option<SyncTask> {
            let mut items = self.items.lock().unwrap();
            let position = items
                .iter()
                .position(|item| matches!(item, QueueItem::Task(_)))?;
            match items.remove(position) {
                Some(QueueItem::Task(task)) => Some(task),
                _ => None,
            }
        }

        fn pending_len(&self) -> usize {
            self.items.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TaskQueue for ListQueue {
        async fn get_task(&self) -> QueueItem {
            self.items
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(QueueItem::Stop)
        }

        fn put_item(&self, item: QueueItem) {
            self.items.lock().unwrap().push_back(item);
        }

        fn ack_task(&self, task: SyncTask) {
            self.acked.lock().unwrap().push(task);
        }

        fn add_ack_callback(&self, _callback: AckCallback) {}

        fn add_put_task_callback(&self, _callback: PutTaskCallback) {}
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn display_notification(&self, title: &str, description: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((title.to_string(), description.to_string()));
        }
    }

    fn worker_for(queue: &Arc<ListQueue>) -> Worker {
        let queue: Arc<dyn TaskQueue> = queue.clone();
        Worker::new(0, queue, WorkerConfig::default())
    }

    fn acked_states(queue: &ListQueue) -> Vec<TaskState> {
        queue.acked.lock().unwrap().iter().map(|t| t.state).collect()
    }

    #[tokio::test]
    async fn run_exits_on_stop_token() {
        let queue = ListQueue::with(vec![QueueItem::Stop, QueueItem::Task(ok_task("/A"))]);
        worker_for(&queue).run().await;
        assert!(queue.acked.lock().unwrap().is_empty());
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn failures_map_to_terminal_states() {
        let cases: [(fn() -> TaskError, TaskState); 7] = [
            (
                || TaskError::Other(anyhow::anyhow!("Boom!")),
                TaskState::InvalidOperation,
            ),
            (
                || TaskError::Unavailable {
                    storage_id: "gdrive".into(),
                },
                TaskState::InvalidOperation,
            ),
            (
                || TaskError::InvalidOperation("Boom!".into()),
                TaskState::InvalidOperation,
            ),
            (
                || TaskError::NotFound("/A".into()),
                TaskState::InvalidOperation,
            ),
            (
                || TaskError::Authentication {
                    storage_id: "gdrive".into(),
                },
                TaskState::InvalidAuthentication,
            ),
            (
                || TaskError::VersionIdMismatch { path: "/A".into() },
                TaskState::VersionIdMismatch,
            ),
            (|| TaskError::Cancelled, TaskState::Cancelled),
        ];

        for (make_error, expected) in cases {
            let (task, calls) = task_with("/A", move || Err(make_error()));
            let queue = ListQueue::with(vec![QueueItem::Task(task), QueueItem::Stop]);
            worker_for(&queue).run().await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(acked_states(&queue), vec![expected]);
            assert_eq!(queue.pending_len(), 0);
        }
    }

    #[tokio::test]
    async fn success_is_acknowledged() {
        let (task, calls) = task_with("/A", || Ok(()));
        let queue = ListQueue::with(vec![QueueItem::Task(task), QueueItem::Stop]);
        worker_for(&queue).run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acked_states(&queue), vec![TaskState::Successful]);
    }

    #[tokio::test]
    async fn policy_error_notifies_the_user() {
        let (task, _) = task_with("/A/secret.exe", || {
            Err(TaskError::Policy {
                path: "/A/secret.exe".into(),
            })
        });
        let queue = ListQueue::with(Vec::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = worker_for(&queue).with_notifier(notifier.clone());

        worker.dispatch(task).await;

        let messages = notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "Policy Error");
        assert!(messages[0].1.contains("/A/secret.exe"));
        assert_eq!(acked_states(&queue), vec![TaskState::InvalidOperation]);
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_the_worker() {
        let (task, _) = task_with("/A", || panic!("task blew up"));
        let (next, next_calls) = task_with("/B", || Ok(()));
        let queue = ListQueue::with(vec![
            QueueItem::Task(task),
            QueueItem::Task(next),
            QueueItem::Stop,
        ]);
        worker_for(&queue).run().await;

        assert_eq!(next_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            acked_states(&queue),
            vec![TaskState::InvalidOperation, TaskState::Successful]
        );
    }

    #[tokio::test]
    async fn cancelled_task_is_not_executed() {
        let (task, calls) = task_with("/A", || Ok(()));
        task.cancel();
        let queue = ListQueue::with(Vec::new());
        worker_for(&queue).dispatch(task).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let acked = queue.acked.lock().unwrap();
        assert_eq!(acked[0].state, TaskState::Cancelled);
        assert_eq!(acked[0].tries, 0);
    }

    #[tokio::test]
    async fn dispatch_increments_tries() {
        let queue = ListQueue::with(Vec::new());
        worker_for(&queue).dispatch(ok_task("/A")).await;
        assert_eq!(queue.acked.lock().unwrap()[0].tries, 1);
    }

    #[tokio::test]
    async fn deferred_task_is_requeued_without_execution() {
        let (mut task, calls) = task_with("/A", || Ok(()));
        task.execute_after = Some(OffsetDateTime::now_utc() + time::Duration::hours(1));
        let queue = ListQueue::with(vec![QueueItem::Task(task), QueueItem::Stop]);
        let worker = worker_for(&queue);

        let started = std::time::Instant::now();
        worker.run().await;
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(queue.acked.lock().unwrap().is_empty());

        let mut task = queue.take_pending_task().expect("task was put back");
        task.execute_after = Some(OffsetDateTime::now_utc() - time::Duration::seconds(1));
        queue.put_task(task);
        queue.put_item(QueueItem::Stop);
        worker.run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acked_states(&queue), vec![TaskState::Successful]);
    }

    #[tokio::test]
    async fn transient_error_is_requeued_with_backoff() {
        let (task, _) = task_with("/A", || {
            Err(TaskError::CurrentlyNotPossible {
                storage_id: "gdrive".into(),
            })
        });
        let queue = ListQueue::with(Vec::new());
        let before = OffsetDateTime::now_utc();
        worker_for(&queue).dispatch(task).await;

        assert!(queue.acked.lock().unwrap().is_empty());
        let task = queue.take_pending_task().expect("task requeued");
        assert_eq!(task.tries, 1);
        let after = task.execute_after.expect("execute_after set");
        let waited = (after - before).as_seconds_f64();
        assert!(waited >= 1.5 - 0.01, "waited {waited}");
        assert!(waited < 1.5 + 10.0 + 1.0, "waited {waited}");
    }

    #[tokio::test]
    async fn transient_error_at_retry_limit_is_acknowledged_once() {
        let (task, calls) = task_with("/A", || Err(TaskError::NoKey { path: "/A".into() }));
        let queue = ListQueue::with(Vec::new());
        let config = WorkerConfig {
            max_retries: 3,
            ..WorkerConfig::default()
        };
        let worker = Worker::new(0, queue.clone(), config);

        let mut task = Some(task);
        while let Some(mut current) = task.take() {
            current.execute_after = None;
            worker.dispatch(current).await;
            task = queue.take_pending_task();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let acked = queue.acked.lock().unwrap();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].state, TaskState::CurrentlyNotPossible);
        assert_eq!(acked[0].tries, 3);
    }
}
