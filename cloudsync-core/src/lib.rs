mod atomic;
mod backoff;
mod bademeister;
mod config;
mod directory;
mod notification;
mod queue;
mod root_watcher;
mod scheduler;
mod state;
mod task;
mod worker;

#[cfg(test)]
mod testing;

pub use atomic::write_atomic;
pub use backoff::Backoff;
pub use bademeister::{
    Bademeister, BademeisterError, Callback, CallbackKind, DEFAULT_THREAD_COUNT,
};
pub use config::{
    CONFIG_FILE, ClientConfig, ConfigError, ConfigFile, StorageDirectoryConfig, StorageRecord,
};
pub use directory::{
    DirectoryError, DirectoryEvent, LEGACY_MARKER_PREFIX, SynchronizationDirectoryWatcher,
    diff_entries,
};
pub use notification::{LogNotifier, Notifier};
pub use queue::{
    AckCallback, MemoryTaskQueue, PutTaskCallback, QueueError, QueueStatistics, TaskQueue,
};
pub use root_watcher::{RootChange, start_root_watcher};
pub use scheduler::PeriodicScheduler;
pub use state::{
    DURABLE_PROPERTIES, MODEL_VERSION, MODEL_VERSION_KEY, ModelCopy, ModelSource, Node,
    PropValue, SYNC_STATE_FILE, SYNC_STATE_SAVE_PERIOD, SharedModel, StateError,
    StatePersistence, decode_snapshot, encode_snapshot, load_model, persist_model, prune,
};
pub use task::{
    CancelFlag, ErrorKind, QueueItem, SyncTask, TaskAction, TaskError, TaskKey, TaskState,
};
pub use worker::{DEFAULT_MAX_RETRIES, DEFAULT_WAIT_DELAY, Worker, WorkerConfig};
