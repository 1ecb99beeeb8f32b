//! Persistence of the last bound peripheral
//! One JSON record next to the config file, cleared on an explicit unbind.
//! The file is read once when the store opens; writes go through a background task.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::PeripheralId;
use crate::utils::ensure_directory_exists;

const IDENTITY_FILE_NAME: &str = "peripheral.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity store io error: {0}")]
    Io(#[from] io::Error),

    #[error("identity store format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("identity writer has stopped")]
    WriterStopped,
}

pub trait IdentityStore: Send {
    fn load(&self) -> Result<Option<PeripheralId>, StoreError>;

    fn save(&mut self, id: &PeripheralId) -> Result<(), StoreError>;

    fn clear(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityRecord {
    last_peripheral: Option<PeripheralId>,
}

enum PendingWrite {
    Save { id: PeripheralId, json: String },
    Clear,
}

impl std::fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Save { id, .. } => write!(f, "Save({})", id),
            Self::Clear => write!(f, "Clear"),
        }
    }
}

/// Keeps the identity in `peripheral.json`.
///
/// Reads are served from memory. Writes are applied in order by the task behind
/// [`IdentityWriter`].
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    current: Option<PeripheralId>,
    writes: mpsc::UnboundedSender<PendingWrite>,
}

/// The background writer of a [`FileIdentityStore`]. It stops once the store is dropped.
pub struct IdentityWriter {
    task: JoinHandle<()>,
}

impl IdentityWriter {
    /// Waits until every queued write has reached the disk.
    pub async fn finish(self) {
        if let Err(e) = self.task.await {
            warn!("Identity writer failed: {}", e);
        }
    }
}

impl FileIdentityStore {
    /// Reads the saved identity at `path` and starts the writer task.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, IdentityWriter), StoreError> {
        let path = path.into();
        let current = read_record(&path).await?;
        let (writes, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(path.clone(), queue));
        let store = Self {
            path,
            current,
            writes,
        };
        Ok((store, IdentityWriter { task }))
    }

    /// Store living in `dir` under the default file name.
    pub async fn in_dir(dir: &Path) -> Result<(Self, IdentityWriter), StoreError> {
        Self::open(dir.join(IDENTITY_FILE_NAME)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn queue(&self, write: PendingWrite) -> Result<(), StoreError> {
        self.writes.send(write).map_err(|_| StoreError::WriterStopped)
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<PeripheralId>, StoreError> {
        Ok(self.current.clone())
    }

    fn save(&mut self, id: &PeripheralId) -> Result<(), StoreError> {
        if self.current.as_ref() == Some(id) {
            return Ok(());
        }
        let record = IdentityRecord {
            last_peripheral: Some(id.clone()),
        };
        let json = serde_json::to_string_pretty(&record)?;
        self.queue(PendingWrite::Save { id: id.clone(), json })?;
        self.current = Some(id.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.queue(PendingWrite::Clear)?;
        self.current = None;
        Ok(())
    }
}

async fn read_record(path: &Path) -> Result<Option<PeripheralId>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let record: IdentityRecord = serde_json::from_str(&json)?;
            Ok(record.last_peripheral)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_loop(path: PathBuf, mut queue: mpsc::UnboundedReceiver<PendingWrite>) {
    while let Some(write) = queue.recv().await {
        debug!("Applying identity write {:?}", write);
        match write {
            PendingWrite::Save { id, json } => {
                if let Some(dir) = path.parent() {
                    if let Err(e) = ensure_directory_exists(dir).await {
                        warn!("Failed to save peripheral {}: {}", id, e);
                        continue;
                    }
                }
                match fs::write(&path, json).await {
                    Ok(()) => info!("Saved peripheral {} to {:?}", id, path),
                    Err(e) => warn!("Failed to save peripheral {} to {:?}: {}", id, path, e),
                }
            }
            PendingWrite::Clear => match fs::remove_file(&path).await {
                Ok(()) => info!("Cleared saved peripheral at {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to clear saved peripheral at {:?}: {}", path, e),
            },
        }
    }
    debug!("Identity writer for {:?} stopped", path);
}

/// In-memory store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    slot: Arc<Mutex<Option<PeripheralId>>>,
}

impl MemoryIdentityStore {
    pub fn with(id: PeripheralId) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(id))),
        }
    }

    pub fn current(&self) -> Option<PeripheralId> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<PeripheralId>, StoreError> {
        Ok(self.current())
    }

    fn save(&mut self, id: &PeripheralId) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}
