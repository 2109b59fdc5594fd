//! Tracks the top-level storage folders below the sync root by inode.
//!
//! Folder names are mutable, so each storage remembers the inode of its folder
//! (`local_unique_id`). [`SynchronizationDirectoryWatcher::check`] compares the live
//! listing against the configured records and reports renames and deletions made outside
//! the application.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, StorageDirectoryConfig};

/// Prefix of the hidden marker files older releases put into every storage folder.
pub const LEGACY_MARKER_PREFIX: &str = ".cloudsync_";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Deleted { local_unique_id: u64 },
    Renamed { local_unique_id: u64, new_name: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DirectoryError + '_ {
    move |source| DirectoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Renames for ids in both listings whose names differ, deletions for configured ids
/// missing on disk. Ids only present on disk are not managed and ignored.
pub fn diff_entries(
    fs_entries: &BTreeMap<u64, String>,
    config_entries: &BTreeMap<u64, String>,
) -> Vec<DirectoryEvent> {
    let mut events = Vec::new();
    for (local_unique_id, configured) in config_entries {
        match fs_entries.get(local_unique_id) {
            Some(current) if current != configured => events.push(DirectoryEvent::Renamed {
                local_unique_id: *local_unique_id,
                new_name: current.clone(),
            }),
            Some(_) => {}
            None => events.push(DirectoryEvent::Deleted {
                local_unique_id: *local_unique_id,
            }),
        }
    }
    events
}

pub struct SynchronizationDirectoryWatcher {
    config: Arc<dyn StorageDirectoryConfig>,
    events: mpsc::UnboundedSender<DirectoryEvent>,
}

impl SynchronizationDirectoryWatcher {
    pub fn new(
        config: Arc<dyn StorageDirectoryConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { config, events }, rx)
    }

    /// Current name of every top-level entry of the sync root, keyed by inode.
    pub fn get_fs_entries(&self) -> Result<BTreeMap<u64, String>, DirectoryError> {
        let root = self.config.sync_root();
        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(&root).map_err(io_error(&root))? {
            let entry = entry.map_err(io_error(&root))?;
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                // Vanished between listing and stat; the next check sees the final state.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "entry vanished during listing");
                    continue;
                }
                Err(source) => return Err(DirectoryError::Io { path, source }),
            };
            entries.insert(
                metadata.ino(),
                entry.file_name().to_string_lossy().into_owned(),
            );
        }
        Ok(entries)
    }

    /// Configured display name of every storage with a known folder identity.
    pub fn get_config_entries(&self) -> BTreeMap<u64, String> {
        self.config
            .storages()
            .into_iter()
            .filter_map(|record| {
                record
                    .local_unique_id
                    .map(|local_unique_id| (local_unique_id, record.display_name))
            })
            .collect()
    }

    /// Diffs disk against configuration and emits the resulting events.
    pub fn check(&self) -> Result<Vec<DirectoryEvent>, DirectoryError> {
        let fs_entries = self.get_fs_entries()?;
        let config_entries = self.get_config_entries();
        debug!(?config_entries, ?fs_entries, "checking storage directories");

        let events = diff_entries(&fs_entries, &config_entries);
        for event in &events {
            match event {
                DirectoryEvent::Renamed {
                    local_unique_id,
                    new_name,
                } => debug!(local_unique_id, new_name = %new_name, "sending renamed signal"),
                DirectoryEvent::Deleted { local_unique_id } => {
                    debug!(local_unique_id, "sending deleted signal")
                }
            }
            if self.events.send(event.clone()).is_err() {
                debug!("no listener for directory events");
            }
        }
        Ok(events)
    }

    /// Moves storages from hidden marker files to inode identities.
    ///
    /// Saves configuration once if anything was found, then removes every marker. Returns
    /// the number of markers consumed; once they are gone this is a no-op.
    pub fn migrate_old_config(&self) -> Result<usize, DirectoryError> {
        let root = self.config.sync_root();
        debug!(root = %root.display(), "starting migration");

        let mut markers = Vec::new();
        for entry in fs::read_dir(&root).map_err(io_error(&root))? {
            let entry = entry.map_err(io_error(&root))?;
            let folder = entry.path();
            if !folder.is_dir() {
                continue;
            }
            for sub_entry in fs::read_dir(&folder).map_err(io_error(&folder))? {
                let sub_entry = sub_entry.map_err(io_error(&folder))?;
                let name = sub_entry.file_name();
                let Some(storage_id) = name
                    .to_str()
                    .and_then(|name| name.strip_prefix(LEGACY_MARKER_PREFIX))
                    .filter(|id| !id.is_empty())
                else {
                    continue;
                };

                info!(folder = %folder.display(), storage = storage_id, "found hidden id file, migrating");
                let inode = fs::metadata(&folder).map_err(io_error(&folder))?.ino();
                if !self.config.set_local_unique_id(storage_id, inode) {
                    warn!(storage = storage_id, "marker names an unknown storage");
                }
                markers.push(sub_entry.path());
            }
        }

        if !markers.is_empty() {
            self.config.write_config()?;
        }
        for marker in &markers {
            info!(path = %marker.display(), "deleting old marker entry");
            fs::remove_file(marker).map_err(io_error(marker))?;
        }
        Ok(markers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageRecord;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    struct FakeConfig {
        root: PathBuf,
        records: Mutex<Vec<StorageRecord>>,
        writes: AtomicUsize,
    }

    impl FakeConfig {
        fn new(root: &Path, records: Vec<StorageRecord>) -> Arc<Self> {
            Arc::new(Self {
                root: root.to_path_buf(),
                records: Mutex::new(records),
                writes: AtomicUsize::new(0),
            })
        }
    }

    impl StorageDirectoryConfig for FakeConfig {
        fn sync_root(&self) -> PathBuf {
            self.root.clone()
        }

        fn storages(&self) -> Vec<StorageRecord> {
            self.records.lock().unwrap().clone()
        }

        fn set_local_unique_id(&self, storage_id: &str, local_unique_id: u64) -> bool {
            let mut records = self.records.lock().unwrap();
            match records.iter_mut().find(|record| record.id == storage_id) {
                Some(record) => {
                    record.local_unique_id = Some(local_unique_id);
                    true
                }
                None => false,
            }
        }

        fn write_config(&self) -> Result<(), ConfigError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(id: &str, name: &str, inode: Option<u64>) -> StorageRecord {
        StorageRecord {
            id: id.to_string(),
            storage_type: "dropbox".to_string(),
            display_name: name.to_string(),
            local_unique_id: inode,
        }
    }

    fn root_with(folders: &[&str]) -> TempDir {
        let dir = tempdir().unwrap();
        for folder in folders {
            fs::create_dir(dir.path().join(folder)).unwrap();
        }
        dir
    }

    fn inode(path: &Path) -> u64 {
        fs::metadata(path).unwrap().ino()
    }

    #[test]
    fn renamed_folder_yields_rename_only() {
        let fs_entries = BTreeMap::from([(42, "Dropbox2".to_string())]);
        let config_entries = BTreeMap::from([(42, "Dropbox".to_string())]);
        assert_eq!(
            diff_entries(&fs_entries, &config_entries),
            vec![DirectoryEvent::Renamed {
                local_unique_id: 42,
                new_name: "Dropbox2".into()
            }]
        );
    }

    #[test]
    fn missing_folder_yields_delete() {
        let fs_entries = BTreeMap::from([(7, "Other".to_string())]);
        let config_entries = BTreeMap::from([(42, "Dropbox".to_string())]);
        assert_eq!(
            diff_entries(&fs_entries, &config_entries),
            vec![DirectoryEvent::Deleted { local_unique_id: 42 }]
        );
    }

    #[test]
    fn unmanaged_and_unchanged_folders_are_ignored() {
        let fs_entries = BTreeMap::from([(42, "Dropbox".to_string()), (7, "Photos".to_string())]);
        let config_entries = BTreeMap::from([(42, "Dropbox".to_string())]);
        assert!(diff_entries(&fs_entries, &config_entries).is_empty());
    }

    #[tokio::test]
    async fn check_sees_renames_on_disk() {
        let dir = root_with(&["Dropbox", "Drive"]);
        let dropbox = inode(&dir.path().join("Dropbox"));
        let drive = inode(&dir.path().join("Drive"));
        let config = FakeConfig::new(
            dir.path(),
            vec![
                record("abc", "Dropbox", Some(dropbox)),
                record("def", "Drive", Some(drive)),
                record("new", "Pending", None),
            ],
        );
        let (watcher, mut rx) = SynchronizationDirectoryWatcher::new(config);

        assert!(watcher.check().unwrap().is_empty());

        fs::rename(dir.path().join("Dropbox"), dir.path().join("Dropbox2")).unwrap();
        fs::remove_dir(dir.path().join("Drive")).unwrap();
        let events = watcher.check().unwrap();

        // Events come out in inode order.
        assert_eq!(events.len(), 2);
        assert!(events.contains(&DirectoryEvent::Renamed {
            local_unique_id: dropbox,
            new_name: "Dropbox2".into()
        }));
        assert!(events.contains(&DirectoryEvent::Deleted {
            local_unique_id: drive
        }));

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received, events);
    }

    #[test]
    fn check_fails_without_sync_root() {
        let dir = tempdir().unwrap();
        let config = FakeConfig::new(&dir.path().join("missing"), Vec::new());
        let (watcher, _rx) = SynchronizationDirectoryWatcher::new(config);
        assert!(matches!(watcher.check(), Err(DirectoryError::Io { .. })));
    }

    #[test]
    fn migration_moves_marker_to_inode() {
        let dir = root_with(&["Dropbox", "Plain"]);
        let folder = dir.path().join("Dropbox");
        let marker = folder.join(format!("{LEGACY_MARKER_PREFIX}abc"));
        fs::write(&marker, b"").unwrap();
        fs::write(folder.join("notes.txt"), b"keep").unwrap();
        fs::write(dir.path().join("loose-file"), b"").unwrap();

        let config = FakeConfig::new(dir.path(), vec![record("abc", "Dropbox", None)]);
        let (watcher, _rx) = SynchronizationDirectoryWatcher::new(config.clone());

        assert_eq!(watcher.migrate_old_config().unwrap(), 1);
        assert_eq!(config.storages()[0].local_unique_id, Some(inode(&folder)));
        assert!(!marker.exists());
        assert!(folder.join("notes.txt").exists());
        assert_eq!(config.writes.load(Ordering::SeqCst), 1);

        assert_eq!(watcher.migrate_old_config().unwrap(), 0);
        assert_eq!(config.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn migration_without_markers_does_not_write() {
        let dir = root_with(&["Dropbox"]);
        let config = FakeConfig::new(dir.path(), vec![record("abc", "Dropbox", None)]);
        let (watcher, _rx) = SynchronizationDirectoryWatcher::new(config.clone());
        assert_eq!(watcher.migrate_old_config().unwrap(), 0);
        assert_eq!(config.writes.load(Ordering::SeqCst), 0);
        assert_eq!(config.storages()[0].local_unique_id, None);
    }
}
