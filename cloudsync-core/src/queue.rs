use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::task::{CancelFlag, QueueItem, SyncTask, TaskKey, TaskState};

/// Invoked with every task that reached a terminal state.
pub type AckCallback = Arc<dyn Fn(&SyncTask) + Send + Sync>;
/// Invoked with the path of every task pushed onto the queue.
pub type PutTaskCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Queue contract the workers consume.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Waits until an item is available and removes it.
    async fn get_task(&self) -> QueueItem;

    fn put_item(&self, item: QueueItem);

    fn put_task(&self, task: SyncTask) {
        self.put_item(QueueItem::Task(task));
    }

    /// Reports a task that reached a terminal state.
    fn ack_task(&self, task: SyncTask);

    fn add_ack_callback(&self, callback: AckCallback);

    fn add_put_task_callback(&self, callback: PutTaskCallback);
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatistics {
    pub sync_task_count: usize,
}

struct RunningTask {
    key: TaskKey,
    cancel: CancelFlag,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<QueueItem>,
    running: HashMap<u64, RunningTask>,
}

/// FIFO task queue kept in memory, tracking which tasks are currently executing.
#[derive(Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<QueueInner>,
    available: Notify,
    ack_callbacks: RwLock<Vec<AckCallback>>,
    put_task_callbacks: RwLock<Vec<PutTaskCallback>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking variant of [`TaskQueue::get_task`].
    pub fn try_get_task(&self) -> Result<QueueItem, QueueError> {
        let mut inner = self.lock();
        let item = inner.pending.pop_front().ok_or(QueueError::Empty)?;
        if let QueueItem::Task(task) = &item {
            inner.running.insert(
                task.id(),
                RunningTask {
                    key: task.key().clone(),
                    cancel: task.cancel_flag(),
                },
            );
        }
        Ok(item)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn statistics(&self) -> QueueStatistics {
        let inner = self.lock();
        let pending = inner
            .pending
            .iter()
            .filter(|item| matches!(item, QueueItem::Task(_)))
            .count();
        QueueStatistics {
            sync_task_count: pending + inner.running.len(),
        }
    }

    pub fn ack_callback_count(&self) -> usize {
        self.ack_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn put_task_callback_count(&self) -> usize {
        self.put_task_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Marks every queued and running task operating on `key` as cancelled.
    pub fn cancel_tasks_for(&self, key: &TaskKey) -> usize {
        let inner = self.lock();
        let mut cancelled = 0;
        for item in &inner.pending {
            if let QueueItem::Task(task) = item
                && task.key() == key
            {
                task.cancel();
                info!(task = %task, "cancelled pending task prior to execution");
                cancelled += 1;
            }
        }
        for (id, running) in &inner.running {
            if &running.key == key {
                running.cancel.cancel();
                info!(task_id = id, path = %key.path, "cancelled running task");
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Whether `key` (or for directories anything below it) is queued or executing.
    pub fn path_has_tasks(&self, key: &TaskKey, is_dir: bool) -> bool {
        let matches = |candidate: &TaskKey| {
            if is_dir {
                candidate.is_within(key)
            } else {
                candidate == key
            }
        };
        let inner = self.lock();
        inner.running.values().any(|running| matches(&running.key))
            || inner.pending.iter().any(|item| match item {
                QueueItem::Task(task) => matches(task.key()),
                QueueItem::Stop => false,
            })
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn get_task(&self) -> QueueItem {
        loop {
            let notified = self.available.notified();
            if let Ok(item) = self.try_get_task() {
                if matches!(item, QueueItem::Stop) {
                    debug!("got stop token");
                }
                return item;
            }
            notified.await;
        }
    }

    fn put_item(&self, item: QueueItem) {
        let path = match &item {
            QueueItem::Task(task) => {
                debug!(task = %task, "queued task");
                Some(task.path().to_string())
            }
            QueueItem::Stop => {
                debug!("queued stop token");
                None
            }
        };
        {
            let mut inner = self.lock();
            // A requeued task is no longer executing.
            if let QueueItem::Task(task) = &item {
                inner.running.remove(&task.id());
            }
            inner.pending.push_back(item);
        }
        self.available.notify_one();

        if let Some(path) = path {
            let callbacks = self
                .put_task_callbacks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in callbacks {
                callback(&path);
            }
        }
    }

    fn ack_task(&self, mut task: SyncTask) {
        if self.lock().running.remove(&task.id()).is_none() {
            warn!(task = %task, "acknowledged task was not in the running set");
        }
        if task.state == TaskState::Blocked {
            task.state = TaskState::InvalidOperation;
        }
        debug!(task = %task, state = %task.state, "acknowledged task");

        let callbacks = self
            .ack_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&task);
        }
    }

    fn add_ack_callback(&self, callback: AckCallback) {
        self.ack_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn add_put_task_callback(&self, callback: PutTaskCallback) {
        self.put_task_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}
