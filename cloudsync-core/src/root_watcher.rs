//! Filesystem notifications for the top level of the sync root.
//!
//! Used to trigger an early directory check; the periodic check stays authoritative.

use std::path::Path;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootChange {
    Created { name: String },
    Removed { name: String },
    Renamed { from: Option<String>, to: Option<String> },
}

/// Watches `root` non-recursively. Dropping the returned watcher ends the stream.
pub fn start_root_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<RootChange>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in map_event(&watch_root, event) {
                let _ = tx.send(change);
            }
        }
        Err(err) => warn!(error = %err, "sync root watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<RootChange> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => {
            let names: Vec<Option<String>> = event
                .paths
                .iter()
                .map(|path| top_level_name(root, path))
                .collect();
            match (mode, names.as_slice()) {
                (RenameMode::Both, [from, to]) if from.is_some() || to.is_some() => {
                    vec![RootChange::Renamed {
                        from: from.clone(),
                        to: to.clone(),
                    }]
                }
                (RenameMode::From, [Some(from)]) => vec![RootChange::Renamed {
                    from: Some(from.clone()),
                    to: None,
                }],
                (RenameMode::To, [Some(to)]) => vec![RootChange::Renamed {
                    from: None,
                    to: Some(to.clone()),
                }],
                (_, names) => names
                    .iter()
                    .flatten()
                    .map(|name| RootChange::Renamed {
                        from: None,
                        to: Some(name.clone()),
                    })
                    .collect(),
            }
        }
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|path| top_level_name(root, path))
            .map(|name| RootChange::Created { name })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| top_level_name(root, path))
            .map(|name| RootChange::Removed { name })
            .collect(),
        _ => Vec::new(),
    }
}

/// Name of `path` if it is a direct child of `root`.
fn top_level_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?;
    if components.next().is_some() {
        return None;
    }
    Some(first.as_os_str().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_folder_rename_at_top_level() {
        let root = Path::new("/tmp/root");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/root/Dropbox", "/tmp/root/Dropbox2"],
            ),
        );
        assert_eq!(
            mapped,
            vec![RootChange::Renamed {
                from: Some("Dropbox".into()),
                to: Some("Dropbox2".into())
            }]
        );
    }

    #[test]
    fn rename_out_of_root_keeps_source() {
        let root = Path::new("/tmp/root");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/root/Dropbox", "/home/user/.Trash/Dropbox"],
            ),
        );
        assert_eq!(
            mapped,
            vec![RootChange::Renamed {
                from: Some("Dropbox".into()),
                to: None
            }]
        );
    }

    #[test]
    fn ignores_nested_and_unrelated_events() {
        let root = Path::new("/tmp/root");
        let nested = map_event(
            root,
            event(
                EventKind::Create(notify::event::CreateKind::File),
                &["/tmp/root/Dropbox/A.txt"],
            ),
        );
        assert!(nested.is_empty());

        let data = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
                &["/tmp/root/Dropbox"],
            ),
        );
        assert!(data.is_empty());
    }

    #[test]
    fn maps_create_and_remove() {
        let root = Path::new("/tmp/root");
        assert_eq!(
            map_event(
                root,
                event(
                    EventKind::Create(notify::event::CreateKind::Folder),
                    &["/tmp/root/Drive"]
                )
            ),
            vec![RootChange::Created {
                name: "Drive".into()
            }]
        );
        assert_eq!(
            map_event(
                root,
                event(
                    EventKind::Remove(notify::event::RemoveKind::Folder),
                    &["/tmp/root/Drive"]
                )
            ),
            vec![RootChange::Removed {
                name: "Drive".into()
            }]
        );
    }

    #[tokio::test]
    async fn reports_new_top_level_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (_watcher, mut rx) = start_root_watcher(&root).unwrap();

        std::fs::create_dir(root.join("Drive")).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher reported in time")
            .expect("channel open");
        assert_eq!(
            change,
            RootChange::Created {
                name: "Drive".into()
            }
        );
    }
}
