use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cloudsync_core::{
    Backoff, Bademeister, CONFIG_FILE, Callback, ConfigFile, DEFAULT_MAX_RETRIES,
    DEFAULT_THREAD_COUNT, DirectoryEvent, MemoryTaskQueue, PeriodicScheduler, RootChange,
    SYNC_STATE_FILE, SharedModel, StatePersistence, StorageDirectoryConfig, SyncTask,
    SynchronizationDirectoryWatcher, WorkerConfig, load_model, start_root_watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_SYNC_DIR_NAME: &str = "CloudSync";
const DEFAULT_CONFIG_DIR_NAME: &str = "cloudsync";
const DEFAULT_WAIT_DELAY_MS: u64 = 100;
const DEFAULT_STATE_SAVE_SECS: u64 = 60;
const DEFAULT_DIRECTORY_CHECK_SECS: u64 = 5;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub config_dir: PathBuf,
    pub sync_root: PathBuf,
    pub worker_count: usize,
    pub worker: WorkerConfig,
    pub state_save_interval: Duration,
    pub directory_check_interval: Duration,
    pub enable_root_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let config_dir = std::env::var("CLOUDSYNC_CONFIG_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_config_dir);
        let sync_root = std::env::var("CLOUDSYNC_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let worker_count =
            usize::try_from(read_u64_env("CLOUDSYNC_WORKERS", DEFAULT_THREAD_COUNT as u64))
                .unwrap_or(DEFAULT_THREAD_COUNT);
        let max_retries = u32::try_from(read_u64_env(
            "CLOUDSYNC_MAX_RETRIES",
            u64::from(DEFAULT_MAX_RETRIES),
        ))
        .unwrap_or(DEFAULT_MAX_RETRIES);
        let wait_delay =
            Duration::from_millis(read_u64_env("CLOUDSYNC_WAIT_DELAY_MS", DEFAULT_WAIT_DELAY_MS));
        let state_save_interval = Duration::from_secs(read_u64_env(
            "CLOUDSYNC_STATE_SAVE_SECS",
            DEFAULT_STATE_SAVE_SECS,
        ));
        let directory_check_interval = Duration::from_secs(read_u64_env(
            "CLOUDSYNC_DIRECTORY_CHECK_SECS",
            DEFAULT_DIRECTORY_CHECK_SECS,
        ));
        let enable_root_watcher = read_bool_env("CLOUDSYNC_ENABLE_ROOT_WATCHER", true);

        Ok(Self {
            config_dir,
            sync_root,
            worker_count,
            worker: WorkerConfig {
                wait_delay,
                max_retries,
                backoff: Backoff::default(),
            },
            state_save_interval,
            directory_check_interval,
            enable_root_watcher,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.config_dir.join(SYNC_STATE_FILE)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    storage_config: Arc<ConfigFile>,
    directory_watcher: Arc<SynchronizationDirectoryWatcher>,
    directory_events: mpsc::UnboundedReceiver<DirectoryEvent>,
    model: Arc<SharedModel>,
    queue: Arc<MemoryTaskQueue>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.config_dir)
            .await
            .with_context(|| format!("failed to create config dir at {:?}", config.config_dir))?;

        let storage_config = Arc::new(
            ConfigFile::load(config.config_file(), config.sync_root.clone())
                .context("failed to load storage configuration")?,
        );
        let sync_root = storage_config.sync_root();
        tokio::fs::create_dir_all(&sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {sync_root:?}"))?;

        let (watcher, directory_events) =
            SynchronizationDirectoryWatcher::new(storage_config.clone());
        let directory_watcher = Arc::new(watcher);
        let migrated = {
            let watcher = Arc::clone(&directory_watcher);
            tokio::task::spawn_blocking(move || watcher.migrate_old_config())
                .await
                .context("migration task failed")?
                .context("failed to migrate legacy storage markers")?
        };
        if migrated > 0 {
            info!(markers = migrated, "migrated legacy storage markers");
        }

        let state_file = config.state_file();
        let model = tokio::task::spawn_blocking(move || load_model(&state_file))
            .await
            .context("state loading task failed")?;
        info!(nodes = model.len(), version = model.model_version(), "synchronization state ready");

        Ok(Self {
            config,
            storage_config,
            directory_watcher,
            directory_events,
            model: Arc::new(SharedModel::new(model)),
            queue: Arc::new(MemoryTaskQueue::new()),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            storage_config,
            directory_watcher,
            mut directory_events,
            model,
            queue,
        } = self;
        let sync_root = storage_config.sync_root();
        info!(
            sync_root = %sync_root.display(),
            config_dir = %config.config_dir.display(),
            workers = config.worker_count,
            root_watcher = config.enable_root_watcher,
            "cloudsyncd started"
        );

        let mut pool =
            Bademeister::new(queue.clone(), config.worker_count).with_worker_config(config.worker);
        pool.register_callback(Callback::Acknowledge(Arc::new(log_finished_task)))
            .context("failed to register acknowledge callback")?;
        pool.register_callback(Callback::PutTask(Arc::new(|path: &str| {
            debug!(path, "task queued");
        })))
        .context("failed to register put_task callback")?;
        pool.start();

        let persistence = StatePersistence::with_interval(
            model.clone(),
            config.state_file(),
            config.state_save_interval,
        );
        persistence.writer().start();

        let directory_check = {
            let watcher = Arc::clone(&directory_watcher);
            PeriodicScheduler::new(
                "directory-check",
                config.directory_check_interval,
                move || {
                    let watcher = Arc::clone(&watcher);
                    async move { run_directory_check(watcher).await }
                },
            )
        };
        directory_check.start();

        let events_handle = {
            let storage_config = Arc::clone(&storage_config);
            tokio::spawn(async move {
                while let Some(event) = directory_events.recv().await {
                    if let Err(err) = apply_directory_event(&storage_config, &event) {
                        warn!(error = ?err, ?event, "failed to apply storage directory change");
                    }
                }
            })
        };

        let (root_watcher, root_handle) = if config.enable_root_watcher {
            match start_root_watcher(&sync_root) {
                Ok((watcher, rx)) => (
                    Some(watcher),
                    Some(tokio::spawn(react_to_root_changes(
                        rx,
                        Arc::clone(&directory_watcher),
                    ))),
                ),
                Err(err) => {
                    warn!(error = %err, "failed to start sync root watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        drop(root_watcher);
        if let Some(handle) = root_handle {
            handle.abort();
        }
        pool.stop();
        if !directory_check.stop(true, Some(SHUTDOWN_JOIN_TIMEOUT)).await {
            warn!("directory check did not stop in time");
        }
        if !persistence
            .writer()
            .stop(true, Some(SHUTDOWN_JOIN_TIMEOUT))
            .await
        {
            warn!("state writer did not stop in time");
        }
        persistence
            .persist()
            .await
            .context("failed to write final state snapshot")?;
        events_handle.abort();

        Ok(())
    }
}

async fn run_directory_check(watcher: Arc<SynchronizationDirectoryWatcher>) -> anyhow::Result<()> {
    let events = tokio::task::spawn_blocking(move || watcher.check()).await??;
    if !events.is_empty() {
        debug!(changes = events.len(), "storage directories changed");
    }
    Ok(())
}

async fn react_to_root_changes(
    mut rx: mpsc::UnboundedReceiver<RootChange>,
    watcher: Arc<SynchronizationDirectoryWatcher>,
) {
    while let Some(change) = rx.recv().await {
        debug!(?change, "sync root changed");
        if let Err(err) = run_directory_check(Arc::clone(&watcher)).await {
            warn!(error = ?err, "storage directory check failed");
        }
    }
}

fn log_finished_task(task: &SyncTask) {
    info!(task = %task, state = %task.state, tries = task.tries, "task finished");
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
