use super::{Index, Term};
use crate::errdata;
use crate::error::Result;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

/// A state machine snapshot, taken at the given applied index and term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last entry included in the snapshot.
    pub index: Index,
    /// The term of the last entry included in the snapshot.
    pub term: Term,
    /// The serialized state machine, see `State::capture`.
    pub data: Vec<u8>,
}

/// Durable snapshot storage. Only the newest snapshot is retained. Stores are
/// shared between the node thread (which installs snapshots from the leader
/// and sends them to followers) and the compactor thread.
pub trait SnapshotStore: Send + Sync {
    /// Durably saves a snapshot, removing older snapshots. Saving a snapshot
    /// older than the newest stored snapshot has no effect.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Loads the newest snapshot, if any.
    fn load(&self) -> Result<Option<Snapshot>>;
}

/// Stores snapshots as files in a directory, named
/// snapshot-{index:020}-{term:020}. Each file contains a big-endian CRC32
/// checksum of the data, followed by the data. Files are written to a
/// temporary file and renamed into place once flushed.
///
/// Saves and loads are serialized by a mutex, so a load never sees a snapshot
/// file that a concurrent save is about to remove.
pub struct FileSnapshots {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileSnapshots {
    /// Opens a snapshot directory, creating it if necessary. Temporary files
    /// left behind by interrupted saves are removed.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!("Removing incomplete snapshot {}", path.display());
                std::fs::remove_file(&path)?;
            }
        }
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    /// Returns the path of a snapshot file.
    fn path(&self, index: Index, term: Term) -> PathBuf {
        self.dir.join(format!("snapshot-{index:020}-{term:020}"))
    }

    /// Lists snapshot files in index order.
    fn list(&self) -> Result<Vec<(Index, Term, PathBuf)>> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((index, term)) = name.strip_prefix("snapshot-").and_then(|s| s.split_once('-'))
            else {
                continue;
            };
            let (Ok(index), Ok(term)) = (index.parse(), term.parse()) else {
                continue;
            };
            snapshots.push((index, term, entry.path()));
        }
        snapshots.sort_by_key(|(index, term, _)| (*index, *term));
        Ok(snapshots)
    }
}

impl SnapshotStore for FileSnapshots {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.lock.lock()?;
        if self.list()?.last().is_some_and(|(index, _, _)| *index >= snapshot.index) {
            debug!("Skipping save of stale snapshot at {}@{}", snapshot.index, snapshot.term);
            return Ok(());
        }

        let path = self.path(snapshot.index, snapshot.term);
        let tmp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&crc32fast::hash(&snapshot.data).to_be_bytes())?;
        file.write_all(&snapshot.data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &path)?;
        std::fs::File::open(&self.dir)?.sync_all()?;
        info!(
            "Saved snapshot at {}@{} ({} bytes)",
            snapshot.index,
            snapshot.term,
            snapshot.data.len()
        );

        for (index, _, path) in self.list()? {
            if index < snapshot.index {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let _guard = self.lock.lock()?;
        let Some((index, term, path)) = self.list()?.pop() else {
            return Ok(None);
        };
        let mut data = std::fs::read(&path)?;
        if data.len() < 4 {
            return errdata!("snapshot {} is truncated", path.display());
        }
        let checksum = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        data.drain(..4);
        if crc32fast::hash(&data) != checksum {
            return errdata!("snapshot {} checksum mismatch", path.display());
        }
        Ok(Some(Snapshot { index, term, data }))
    }
}

/// Stores the newest snapshot in memory. Used for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemorySnapshots {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshots {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut current = self.snapshot.lock()?;
        if current.as_ref().map_or(true, |s| s.index < snapshot.index) {
            *current = Some(snapshot.clone());
        }
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock()?.clone())
    }
}
