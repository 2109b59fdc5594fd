use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome recorded on a task once a worker is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Unexecuted,
    Successful,
    CurrentlyNotPossible,
    InvalidOperation,
    InvalidAuthentication,
    VersionIdMismatch,
    Cancelled,
    Blocked,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unexecuted => "unexecuted",
            TaskState::Successful => "successful",
            TaskState::CurrentlyNotPossible => "currently_not_possible",
            TaskState::InvalidOperation => "invalid_operation",
            TaskState::InvalidAuthentication => "invalid_authentication",
            TaskState::VersionIdMismatch => "version_id_mismatch",
            TaskState::Cancelled => "cancelled",
            TaskState::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes a task execution can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientRetryable,
    PolicyViolation,
    InvalidOperation,
    VersionConflict,
    Cancelled,
    AuthFailure,
    Unknown,
}

/// Errors raised by [`TaskAction::execute`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    #[error("operation currently not possible on storage {storage_id}")]
    CurrentlyNotPossible { storage_id: String },
    #[error("no key available to decrypt {path}")]
    NoKey { path: String },
    #[error("the synchronisation of the file {path} is not allowed!")]
    Policy { path: String },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("storage {storage_id} is unavailable")]
    Unavailable { storage_id: String },
    #[error("version id of {path} does not match")]
    VersionIdMismatch { path: String },
    #[error("task was cancelled")]
    Cancelled,
    #[error("authentication failed for storage {storage_id}")]
    Authentication { storage_id: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::CurrentlyNotPossible { .. } | TaskError::NoKey { .. } => {
                ErrorKind::TransientRetryable
            }
            TaskError::Policy { .. } => ErrorKind::PolicyViolation,
            // Unavailable is terminal even though it looks transient.
            TaskError::InvalidOperation(_)
            | TaskError::NotFound(_)
            | TaskError::Unavailable { .. } => ErrorKind::InvalidOperation,
            TaskError::VersionIdMismatch { .. } => ErrorKind::VersionConflict,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::Authentication { .. } => ErrorKind::AuthFailure,
            TaskError::Other(_) => ErrorKind::Unknown,
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TaskError::NotFound(err.to_string()),
            _ => TaskError::Other(err.into()),
        }
    }
}

/// Shared, clonable cancellation marker of a task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a task operates on: a path inside one synchronization link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub link_id: String,
    pub path: String,
}

impl TaskKey {
    pub fn new(link_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            path: path.into(),
        }
    }

    /// True if `self` is `other` or lies below it.
    pub fn is_within(&self, other: &TaskKey) -> bool {
        if self.link_id != other.link_id {
            return false;
        }
        let prefix = other.path.trim_end_matches('/');
        self.path == other.path
            || prefix.is_empty()
            || self
                .path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// The side-effecting work behind a [`SyncTask`].
#[async_trait]
pub trait TaskAction: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&mut self, cancel: &CancelFlag) -> Result<(), TaskError>;
}

pub struct SyncTask {
    id: u64,
    key: TaskKey,
    pub tries: u32,
    pub execute_after: Option<OffsetDateTime>,
    pub state: TaskState,
    cancel: CancelFlag,
    action: Box<dyn TaskAction>,
}

impl SyncTask {
    pub fn new(key: TaskKey, action: Box<dyn TaskAction>) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            key,
            tries: 0,
            execute_after: None,
            state: TaskState::Unexecuted,
            cancel: CancelFlag::default(),
            action,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// A task is deferred while `execute_after` lies in the future.
    pub fn is_deferred(&self, now: OffsetDateTime) -> bool {
        self.execute_after.is_some_and(|after| after > now)
    }

    pub async fn execute(&mut self) -> Result<(), TaskError> {
        self.action.execute(&self.cancel).await
    }
}

impl fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTask")
            .field("id", &self.id)
            .field("action", &self.action.name())
            .field("link_id", &self.key.link_id)
            .field("path", &self.key.path)
            .field("tries", &self.tries)
            .field("state", &self.state)
            .field("cancelled", &self.is_cancelled())
            .field("execute_after", &self.execute_after)
            .finish()
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({}:{})", self.name(), self.id, self.key.link_id, self.key.path)
    }
}

/// Element travelling through a [`crate::queue::TaskQueue`].
#[derive(Debug)]
pub enum QueueItem {
    Task(SyncTask),
    /// Tells exactly one worker to leave its loop.
    Stop,
}
