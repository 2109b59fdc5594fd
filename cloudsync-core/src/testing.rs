use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::task::{CancelFlag, SyncTask, TaskAction, TaskError, TaskKey};

/// Task action driven by a closure, counting how often it ran.
pub(crate) struct FnAction<F> {
    calls: Arc<AtomicUsize>,
    f: F,
}

#[async_trait]
impl<F> TaskAction for FnAction<F>
where
    F: FnMut() -> Result<(), TaskError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&mut self, _cancel: &CancelFlag) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)()
    }
}

pub(crate) fn task_with<F>(path: &str, f: F) -> (SyncTask, Arc<AtomicUsize>)
where
    F: FnMut() -> Result<(), TaskError> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let action = FnAction {
        calls: Arc::clone(&calls),
        f,
    };
    (
        SyncTask::new(TaskKey::new("local::remote", path), Box::new(action)),
        calls,
    )
}

pub(crate) fn ok_task(path: &str) -> SyncTask {
    task_with(path, || Ok(())).0
}
