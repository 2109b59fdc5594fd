//! The Bademeister keeps the pool of workers running on one shared queue.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::notification::{LogNotifier, Notifier};
use crate::queue::{AckCallback, PutTaskCallback, TaskQueue};
use crate::task::QueueItem;
use crate::worker::{Worker, WorkerConfig};

pub const DEFAULT_THREAD_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Acknowledge,
    PutTask,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackKind::Acknowledge => "acknowledge",
            CallbackKind::PutTask => "put_task",
        })
    }
}

/// Queue callback that can be registered before the pool starts.
pub enum Callback {
    /// Called for every task that reached a terminal state.
    Acknowledge(AckCallback),
    /// Called with the path of every task put onto the queue.
    PutTask(PutTaskCallback),
}

impl Callback {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::Acknowledge(_) => CallbackKind::Acknowledge,
            Callback::PutTask(_) => CallbackKind::PutTask,
        }
    }
}

#[derive(Debug, Error)]
pub enum BademeisterError {
    #[error("cannot register {0} callback while the pool is running")]
    Running(CallbackKind),
}

pub struct Bademeister {
    queue: Arc<dyn TaskQueue>,
    thread_count: usize,
    worker_config: WorkerConfig,
    notifier: Arc<dyn Notifier>,
    workers: Vec<JoinHandle<()>>,
    running: bool,
}

impl Bademeister {
    pub fn new(queue: Arc<dyn TaskQueue>, thread_count: usize) -> Self {
        Self {
            queue,
            thread_count,
            worker_config: WorkerConfig::default(),
            notifier: Arc::new(LogNotifier),
            workers: Vec::new(),
            running: false,
        }
    }

    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn prepare_workers(&self) -> Vec<Worker> {
        (0..self.thread_count)
            .map(|id| {
                Worker::new(id, Arc::clone(&self.queue), self.worker_config)
                    .with_notifier(Arc::clone(&self.notifier))
            })
            .collect()
    }

    /// Creates the configured number of workers and starts them.
    pub fn start(&mut self) {
        self.workers = self
            .prepare_workers()
            .into_iter()
            .map(|worker| {
                debug!(worker = worker.id(), "starting worker");
                worker.start()
            })
            .collect();
        self.running = true;
        info!(workers = self.workers.len(), "worker pool started");
    }

    /// Queues one stop token per known worker and forgets the workers.
    ///
    /// Does not wait for the workers to exit; a worker busy with a task finishes it
    /// before it sees its token.
    pub fn stop(&mut self) -> usize {
        let count = self.workers.len();
        for _ in 0..count {
            self.queue.put_item(QueueItem::Stop);
        }
        self.workers.clear();
        self.running = false;
        info!(workers = count, "worker pool stopping");
        count
    }

    /// Adds a queue callback. Only allowed while the pool is stopped.
    pub fn register_callback(&mut self, callback: Callback) -> Result<(), BademeisterError> {
        let kind = callback.kind();
        if self.running {
            error!(kind = %kind, "tried to register callback while the pool is running");
            return Err(BademeisterError::Running(kind));
        }

        match callback {
            Callback::Acknowledge(callback) => self.queue.add_ack_callback(callback),
            Callback::PutTask(callback) => self.queue.add_put_task_callback(callback),
        }
        info!(kind = %kind, "registered callback");
        Ok(())
    }
}
