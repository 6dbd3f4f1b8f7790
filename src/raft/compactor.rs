use super::{Capture, Index, Snapshot, SnapshotStore, Term};
use crate::error::Result;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A snapshot job, sent from the node to the compactor thread.
pub struct Job {
    /// The applied index at which the state was captured.
    pub index: Index,
    /// The term of the entry at the applied index.
    pub term: Term,
    /// The captured state machine.
    pub capture: Box<dyn Capture>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("index", &self.index).field("term", &self.term).finish()
    }
}

/// The result of a snapshot job: the snapshot index and term, or an error.
pub type Done = Result<(Index, Term)>;

/// The compactor runs on a background thread. It serializes state machine
/// captures into snapshots, persists them, and reports back to the node's
/// event loop, which then truncates the log prefix via `Node::compacted`.
///
/// The node only captures the state machine at its applied index, so
/// compaction never removes unapplied entries.
pub struct Compactor {
    snapshots: Arc<dyn SnapshotStore>,
}

impl Compactor {
    /// Creates a new compactor using the given snapshot store.
    pub fn new(snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { snapshots }
    }

    /// Processes jobs until the job channel is closed.
    pub fn run(self, job_rx: Receiver<Job>, done_tx: Sender<Done>) -> Result<()> {
        while let Ok(job) = job_rx.recv() {
            let done = self.execute(job);
            if let Err(error) = &done {
                error!("Snapshot failed: {error}");
            }
            done_tx.send(done)?;
        }
        debug!("Compactor shutting down");
        Ok(())
    }

    /// Executes a single job, returning the snapshot index and term once the
    /// snapshot is durable.
    pub fn execute(&self, job: Job) -> Done {
        let Job { index, term, capture } = job;
        let data = capture.encode()?;
        self.snapshots.save(&Snapshot { index, term, data })?;
        Ok((index, term))
    }
}

/// Compaction settings and status, as tracked by the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Compaction {
    /// Whether automatic compaction is enabled.
    pub enabled: bool,
    /// The number of applied entries since the last snapshot that triggers a
    /// new snapshot.
    pub step: u64,
    /// The number of entries to retain in the log before the snapshot index,
    /// for lagging followers and log observers.
    pub keep: u64,
    /// The index of the snapshot currently being taken, if any.
    pub in_progress: Option<Index>,
    /// The index of the last durable snapshot.
    pub snapshot_index: Index,
    /// The term of the last durable snapshot.
    pub snapshot_term: Term,
}

impl Compaction {
    /// Returns true if an automatic snapshot should be taken at the given
    /// applied index.
    pub fn due(&self, applied_index: Index) -> bool {
        self.enabled
            && self.in_progress.is_none()
            && applied_index > self.snapshot_index
            && applied_index - self.snapshot_index >= self.step.max(1)
    }

    /// Returns the index up to which the log can be truncated after a snapshot
    /// at the given index, respecting the keep size and observer release
    /// hints. Observers that haven't released anything don't cap truncation.
    pub fn truncation_point(&self, index: Index, released: &BTreeMap<String, Index>) -> Index {
        let point = index.saturating_sub(self.keep);
        released.values().copied().min().map_or(point, |min| point.min(min))
    }

    /// Records a durable snapshot.
    pub fn complete(&mut self, index: Index, term: Term) {
        self.in_progress = None;
        if index > self.snapshot_index {
            info!("Snapshot at {index}@{term} is durable");
            self.snapshot_index = index;
            self.snapshot_term = term;
        }
    }
}
