//! Synchronization state tree and its durable snapshots.
//!
//! The live tree belongs to the synchronization engine. Persistence only ever works on a
//! copy obtained through [`ModelSource::get_model_copy`], prunes it down to the durable
//! properties and writes it atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::scheduler::PeriodicScheduler;

pub const SYNC_STATE_FILE: &str = "sync_state.dat";
pub const SYNC_STATE_SAVE_PERIOD: Duration = Duration::from_secs(60);
pub const MODEL_VERSION: i64 = 1;
pub const MODEL_VERSION_KEY: &str = "model_version";
/// Property keys that survive a snapshot; everything else is runtime annotation.
pub const DURABLE_PROPERTIES: [&str; 2] = ["desired_storages", "equivalents"];

const FILE_MAGIC: &[u8; 4] = b"CSST";
const FILE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("snapshot header is invalid")]
    InvalidHeader,
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),
    #[error("model copy was dropped before it was produced")]
    CopyUnavailable,
    #[error("snapshot writer failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Set(BTreeSet<String>),
    List(Vec<PropValue>),
    Map(BTreeMap<String, PropValue>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: Option<String>,
    pub props: BTreeMap<String, PropValue>,
    children: BTreeMap<String, Node>,
}

impl Node {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn model_version(&self) -> i64 {
        match self.props.get(MODEL_VERSION_KEY) {
            Some(PropValue::Int(version)) => *version,
            _ => 0,
        }
    }

    pub fn add_child(&mut self, name: impl Into<String>) -> &mut Node {
        let name = name.into();
        self.children.entry(name.clone()).or_insert_with(|| Node {
            name: Some(name),
            ..Node::default()
        })
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.values()
    }

    /// Looks up a descendant by a slash separated path such as `/Docs/A.txt`.
    pub fn get(&self, path: &str) -> Option<&Node> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self, |node, part| node.children.get_mut(part))
    }

    /// Creates every missing node along `path` and returns the last one.
    pub fn ensure(&mut self, path: &str) -> &mut Node {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(self, |node, part| node.add_child(part))
    }

    /// Number of nodes in the subtree, including `self`.
    pub fn len(&self) -> usize {
        1 + self.children.values().map(Node::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.props.is_empty()
    }
}

/// Strips every non-durable property from all nodes below the root.
pub fn prune(model: &mut Node) {
    for child in model.children.values_mut() {
        child
            .props
            .retain(|key, _| DURABLE_PROPERTIES.contains(&key.as_str()));
        prune(child);
    }
}

pub fn encode_snapshot(model: &Node) -> Result<Vec<u8>, StateError> {
    let body = bincode::serialize(model)?;
    let mut payload = Vec::with_capacity(FILE_MAGIC.len() + 1 + body.len());
    payload.extend_from_slice(FILE_MAGIC);
    payload.push(FILE_VERSION);
    payload.extend_from_slice(&body);
    Ok(payload)
}

pub fn decode_snapshot(data: &[u8]) -> Result<Node, StateError> {
    if data.len() < FILE_MAGIC.len() + 1 || &data[..FILE_MAGIC.len()] != FILE_MAGIC {
        return Err(StateError::InvalidHeader);
    }
    let version = data[FILE_MAGIC.len()];
    if version != FILE_VERSION {
        return Err(StateError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(&data[FILE_MAGIC.len() + 1..])?)
}

/// Pending deep copy of the live tree.
pub struct ModelCopy {
    rx: oneshot::Receiver<Node>,
}

impl ModelCopy {
    /// Handle plus the sender the owner of the live tree fulfils it with.
    pub fn channel() -> (oneshot::Sender<Node>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub fn ready(model: Node) -> Self {
        let (tx, copy) = Self::channel();
        let _ = tx.send(model);
        copy
    }

    pub async fn get(self) -> Result<Node, StateError> {
        self.rx.await.map_err(|_| StateError::CopyUnavailable)
    }
}

/// Owner of a live state tree that can hand out copies of it.
pub trait ModelSource: Send + Sync {
    fn get_model_copy(&self) -> ModelCopy;
}

/// Live tree behind a lock, shared between the engine and persistence.
#[derive(Debug, Clone, Default)]
pub struct SharedModel {
    inner: Arc<RwLock<Node>>,
}

impl SharedModel {
    pub fn new(model: Node) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&Node) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ModelSource for SharedModel {
    fn get_model_copy(&self) -> ModelCopy {
        // The lock is released before the copy is handed out.
        let copy = self.read(Node::clone);
        ModelCopy::ready(copy)
    }
}

/// Takes a copy of the model, prunes it and writes it atomically to `location`.
pub async fn persist_model(source: &dyn ModelSource, location: &Path) -> Result<(), StateError> {
    debug!("requesting sync model to save");
    let mut model = source.get_model_copy().get().await?;

    debug!("cleaning model");
    prune(&mut model);
    model
        .props
        .entry(MODEL_VERSION_KEY.to_string())
        .or_insert(PropValue::Int(MODEL_VERSION));
    let nodes = model.len();
    let payload = encode_snapshot(&model)?;

    let target = location.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&target, &payload)).await??;
    info!(path = %location.display(), nodes, "wrote synchronization state model");
    Ok(())
}

/// Reads a snapshot; a missing or unreadable file yields an empty tree.
pub fn load_model(location: &Path) -> Node {
    info!(path = %location.display(), "trying to load synchronization state");
    let model = match fs::read(location) {
        Ok(data) => match decode_snapshot(&data) {
            Ok(model) => {
                info!(path = %location.display(), "loaded synchronization state");
                model
            }
            Err(err) => {
                warn!(path = %location.display(), error = %err, "can't load model, using empty model instead");
                Node::root()
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %location.display(), "can't find state file, using empty model instead");
            Node::root()
        }
        Err(err) => {
            warn!(path = %location.display(), error = %err, "can't read state file, using empty model instead");
            Node::root()
        }
    };
    debug!(version = model.model_version(), "loaded model version");
    model
}

/// Periodic writer of the engine's state tree.
pub struct StatePersistence {
    source: Arc<dyn ModelSource>,
    location: PathBuf,
    writer: PeriodicScheduler,
}

impl StatePersistence {
    pub fn new(source: Arc<dyn ModelSource>, location: impl Into<PathBuf>) -> Self {
        Self::with_interval(source, location, SYNC_STATE_SAVE_PERIOD)
    }

    pub fn with_interval(
        source: Arc<dyn ModelSource>,
        location: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        let location = location.into();
        let writer = {
            let source = Arc::clone(&source);
            let location = location.clone();
            PeriodicScheduler::new("state-writer", interval, move || {
                let source = Arc::clone(&source);
                let location = location.clone();
                async move {
                    persist_model(source.as_ref(), &location).await?;
                    Ok::<(), anyhow::Error>(())
                }
            })
        };
        Self {
            source,
            location,
            writer,
        }
    }

    pub fn writer(&self) -> &PeriodicScheduler {
        &self.writer
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub async fn persist(&self) -> Result<(), StateError> {
        persist_model(self.source.as_ref(), &self.location).await
    }

    pub fn load(location: &Path) -> Node {
        load_model(location)
    }
}
