use super::{NodeID, Term};
use crate::encoding::{self, bincode, Value as _};
use crate::errdata;
use crate::error::{Error, Result};
use crate::storage;

use log::warn;
use serde::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The state machine command. None (noop) commands are used during leader
    /// election to commit old entries, see section 5.4.2 in the Raft paper.
    pub command: Option<Vec<u8>>,
}

impl encoding::Value for Entry {}

/// A log storage key. Keys are encoded by hand as a prefix byte, followed by
/// the big-endian index for entries, such that entries sort in index order.
#[derive(Clone, Debug, PartialEq)]
pub enum Key {
    /// A log entry, storing the term and command.
    Entry(Index),
    /// Stores the current term and vote (if any).
    TermVote,
    /// Stores the current commit index (if any).
    CommitIndex,
    /// Stores the index and term of the last entry removed by compaction.
    Compacted,
}

impl Key {
    /// Encodes the key.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => std::iter::once(0x00).chain(index.to_be_bytes()).collect(),
            Key::TermVote => vec![0x01],
            Key::CommitIndex => vec![0x02],
            Key::Compacted => vec![0x03],
        }
    }

    /// Decodes a key.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [0x00, index @ ..] => {
                let Ok(index) = <[u8; 8]>::try_from(index) else {
                    return errdata!("invalid entry key {bytes:x?}");
                };
                Ok(Key::Entry(u64::from_be_bytes(index)))
            }
            [0x01] => Ok(Key::TermVote),
            [0x02] => Ok(Key::CommitIndex),
            [0x03] => Ok(Key::Compacted),
            _ => errdata!("invalid log key {bytes:x?}"),
        }
    }
}

/// The Raft log stores a sequence of arbitrary commands (Agency transactions)
/// that are replicated across nodes and applied sequentially to the local
/// state machine. Each entry contains an index, command, and the term in which
/// the leader proposed it. Commands may be noops (None), which are added when
/// a leader is elected (see section 5.4.2 in the Raft paper). For example:
///
/// Index | Term | Command
/// ------|------|------------------------------------------------
///   1   |   1  | None
///   2   |   1  | set /arango/Plan/Version = 1
///   3   |   1  | push /arango/Target/ToDo = {"type": "move"}
///   4   |   2  | None
///   5   |   2  | increment /arango/Plan/Version
///
/// A key/value store is used to store the log entries on disk, keyed by index,
/// along with a few other metadata keys (e.g. who we voted for in this term).
///
/// In the steady state, the log is append-only: when a client submits a
/// command, the leader appends it to its own log (via [`Log::append`]) and
/// replicates it to followers who append it to their logs (via
/// [`Log::splice`]). When an index has been replicated to a majority of nodes
/// it becomes committed, making the log immutable up to that index and
/// guaranteeing that all nodes will eventually contain it. Nodes keep track of
/// the commit index via [`Log::commit`] and apply committed commands to the
/// state machine.
///
/// However, uncommitted entries can be replaced or removed. A leader may append
/// entries to its log, but then be unable to reach consensus on them (e.g.
/// because it is unable to communicate with a majority of nodes). If a
/// different leader is elected and writes different commands to those same
/// indexes, then the uncommitted entries will be replaced with entries from the
/// new leader once the old leader (or a follower) discovers it.
///
/// Once the state machine has been snapshotted, a prefix of the log can be
/// removed via [`Log::compact`]. The index and term of the last removed entry
/// is retained, and entries at or below it are considered present and
/// committed. Followers that receive a snapshot from the leader reset their
/// log prefix via [`Log::install_snapshot`].
///
/// The Raft log has the following invariants:
///
/// * Entry indexes are contiguous after the compacted index (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries are durable (flushed to disk).
/// * Appended entries use the current term.
/// * Committed entries are never changed, and only removed by compaction.
/// * Compacted entries have been applied and snapshotted.
/// * Committed entries will eventually be replicated to all nodes.
/// * Entries with the same index/term contain the same command.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
pub struct Log {
    /// The underlying storage engine. Uses a trait object instead of generics,
    /// to allow runtime selection of the engine and avoid propagating the
    /// generic type parameters throughout Raft.
    pub(super) engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index of the last entry removed by compaction.
    compacted_index: Index,
    /// The term of the last entry removed by compaction.
    compacted_term: Term,
}

impl Log {
    /// Initializes a log using the given storage engine. Fails with
    /// Error::LogInconsistency if the stored entries have gaps.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (compacted_index, compacted_term): (Index, Term) = engine
            .get(&Key::Compacted.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));

        // Remove any entries left behind by an interrupted compaction. The
        // compacted key is written before the entries are deleted.
        let stale: Vec<Vec<u8>> = engine
            .scan_dyn(Self::key_range(..=compacted_index))
            .map(|r| r.map(|(key, _)| key))
            .collect::<Result<_>>()?;
        if !stale.is_empty() {
            warn!("Removing {} entries left behind by interrupted compaction", stale.len());
            for key in stale {
                engine.delete(&key)?;
            }
            engine.flush()?;
        }

        // Check that the entries are contiguous after the compacted index.
        let (mut last_index, mut last_term) = (compacted_index, compacted_term);
        let mut scan = engine.scan_dyn(Self::key_range(compacted_index + 1..));
        while let Some((key, value)) = scan.next().transpose()? {
            let entry = Entry::decode(&value)?;
            if Key::decode(&key)? != Key::Entry(last_index + 1) || entry.index != last_index + 1 {
                return Err(Error::LogInconsistency(format!(
                    "expected entry {} after {last_index}, found {:?}",
                    last_index + 1,
                    Key::decode(&key)?
                )));
            }
            if entry.term < last_term {
                return Err(Error::LogInconsistency(format!(
                    "term regression at entry {}",
                    entry.index
                )));
            }
            (last_index, last_term) = (entry.index, entry.term);
        }
        drop(scan);

        if commit_index > last_index {
            return Err(Error::LogInconsistency(format!(
                "commit index {commit_index} beyond last index {last_index}"
            )));
        }

        Ok(Self {
            engine,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            compacted_index,
            compacted_term,
        })
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the index and term of the last entry removed by compaction, or
    /// (0, 0) if the log has never been compacted.
    pub fn get_compacted(&self) -> (Index, Term) {
        (self.compacted_index, self.compacted_term)
    }

    /// Returns the first index still stored in the log. If the log is empty,
    /// this is the index the next entry will have.
    pub fn get_first_index(&self) -> Index {
        self.compacted_index + 1
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term. append()
    /// will use this term, and splice() can't write entries beyond it.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, vote))?)?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command to the log at the current term, and flushes it to
    /// disk, returning its index. None implies a noop command, typically after
    /// Raft leader changes.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist (or be the compacted index) and be at or after the current commit
    /// index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        assert!(index >= self.commit_index, "commit index regression {} → {index}", self.commit_index);
        if index == self.commit_index {
            return Ok(index);
        }
        let term = match self.get(index)? {
            Some(entry) => entry.term,
            None if index == self.compacted_index => self.compacted_term,
            None => panic!("commit index {index} does not exist"),
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term))?)?;
        // NB: the commit index doesn't need to be fsynced, since the entries
        // are fsynced and the commit index can be recovered from a log quorum.
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist (including
    /// compacted entries).
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        if index <= self.compacted_index {
            return Ok(None);
        }
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Compacted entries are committed, and thus present in every valid log.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        // Fast path: check against last_index. This is the common case when
        // followers process appends or heartbeats.
        if index == 0 || index > self.last_index {
            return Ok(false);
        }
        if (index, term) == (self.last_index, self.last_term) {
            return Ok(true);
        }
        if index == self.compacted_index {
            return Ok(term == self.compacted_term);
        }
        if index < self.compacted_index {
            return Ok(true);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Returns an iterator over log entries in the given index range. Compacted
    /// entries are not returned.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        Iterator::new(self.engine.scan_dyn(Self::key_range(range)))
    }

    /// Returns an iterator over entries that are ready to apply, starting after
    /// the current applied index up to the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator {
        // NB: we don't assert that commit_index >= applied_index, because the
        // local commit index is not flushed to durable storage -- if lost on
        // restart, it can be recovered from a quorum of logs.
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes it to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and the
    /// first entry must be in the range [1,last_index+1] with a term at or
    /// above the previous (base) entry's term and at or below the current term.
    /// New indexes will be appended. Overlapping indexes with the same term
    /// must be equal and will be ignored. Overlapping indexes with different
    /// terms will truncate the existing log at the first conflict and then
    /// splice the new entries. Entries at or below the compacted index are
    /// committed and ignored.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);

        // Skip compacted entries.
        let mut entries = entries.as_slice();
        while entries.first().is_some_and(|e| e.index <= self.compacted_index) {
            entries = &entries[1..];
        }
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Check that the entries connect to the existing log, and that the
        // term doesn't regress.
        let base_term = match first.index - 1 {
            base if base == self.compacted_index => Some(self.compacted_term),
            base => self.get(base)?.map(|e| e.term),
        };
        match base_term {
            Some(term) if first.term < term => {
                panic!("splice term regression {} → {}", term, first.term)
            }
            Some(_) => {}
            None => panic!("first index {} must touch existing log", first.index),
        }

        // Skip entries that are already in the log.
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            // [0] is ok, because the scan has the same size as entries.
            assert!(entry.index == entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert!(entry.command == entries[0].command, "command mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the entries that weren't already in the log, and remove the
        // tail of the old log if any. We can't write below the commit index,
        // since these entries must be immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Removes all entries up to and including the given index, which must be
    /// committed. The caller must have durably snapshotted the state machine
    /// at or after this index. Returns the new compacted index.
    pub fn compact(&mut self, index: Index) -> Result<Index> {
        if index <= self.compacted_index {
            return Ok(self.compacted_index);
        }
        assert!(index <= self.commit_index, "can't compact uncommitted index {index}");
        let Some(entry) = self.get(index)? else {
            return Err(Error::LogInconsistency(format!("compaction index {index} missing")));
        };

        // Write the compacted marker before deleting entries. If we crash
        // midway, leftover entries are removed on startup.
        self.engine.set(&Key::Compacted.encode(), bincode::serialize(&(index, entry.term))?)?;
        for i in self.compacted_index + 1..=index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.flush()?;

        self.compacted_index = index;
        self.compacted_term = entry.term;
        Ok(index)
    }

    /// Resets the log prefix to a snapshot received from the leader. If the log
    /// contains the snapshot's last entry, the following entries are retained,
    /// otherwise the entire log is discarded (see section 7 in the Raft paper).
    /// The snapshot index becomes committed.
    pub fn install_snapshot(&mut self, index: Index, term: Term) -> Result<()> {
        if index <= self.compacted_index {
            return Ok(());
        }
        let retain = self.has(index, term)?;
        let remove_to = if retain { index } else { self.last_index };

        self.engine.set(&Key::Compacted.encode(), bincode::serialize(&(index, term))?)?;
        for i in self.compacted_index + 1..=remove_to {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        if index > self.commit_index {
            self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term))?)?;
        }
        self.engine.flush()?;

        self.compacted_index = index;
        self.compacted_term = term;
        if !retain {
            self.last_index = index;
            self.last_term = term;
        }
        if index > self.commit_index {
            self.commit_index = index;
            self.commit_term = term;
        }
        Ok(())
    }

    /// Returns log engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }

    /// Converts an index range into an engine key range.
    fn key_range(
        range: impl std::ops::RangeBounds<Index>,
    ) -> (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>) {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        (from, to)
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;
    use storage::engine::test::{Emit, Operation};

    /// Creates a log with an Emit engine, returning the engine operations.
    fn setup() -> (Log, Receiver<Operation>) {
        let (op_tx, op_rx) = crossbeam::channel::unbounded();
        let log = Log::new(Box::new(Emit::new(storage::Memory::new(), op_tx))).expect("log failed");
        (log, op_rx)
    }

    /// Reopens the log on the same engine.
    fn reload(log: Log) -> Result<Log> {
        Log::new(log.engine)
    }

    fn entry(index: Index, term: Term, command: &str) -> Entry {
        let command = (!command.is_empty()).then(|| command.as_bytes().to_vec());
        Entry { index, term, command }
    }

    fn dump(log: &mut Log) -> Result<Vec<Entry>> {
        log.scan(..).collect()
    }

    #[test]
    fn key_encoding() -> Result<()> {
        assert_eq!(Key::Entry(1).encode(), vec![0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(hex::encode(Key::Entry(258).encode()), "000000000000000102");
        for key in [Key::Entry(7), Key::TermVote, Key::CommitIndex, Key::Compacted] {
            assert_eq!(Key::decode(&key.encode())?, key);
        }
        assert!(Key::decode(&[0x00, 1]).is_err());
        assert!(Key::decode(&[0x04]).is_err());
        Ok(())
    }

    #[test]
    /// set_term and append are flushed, commit is not.
    fn durability() -> Result<()> {
        let (mut log, op_rx) = setup();

        log.set_term(1, Some(2))?;
        let ops: Vec<_> = op_rx.try_iter().collect();
        assert!(matches!(ops.as_slice(), [Operation::Set { .. }, Operation::Flush]));
        assert_eq!(log.get_term(), (1, Some(2)));

        // Setting the same term and vote is a noop.
        log.set_term(1, Some(2))?;
        assert_eq!(op_rx.try_iter().count(), 0);

        assert_eq!(log.append(None)?, 1);
        assert_eq!(log.append(Some(b"foo".to_vec()))?, 2);
        let ops: Vec<_> = op_rx.try_iter().collect();
        assert_eq!(ops.iter().filter(|op| **op == Operation::Flush).count(), 2);

        assert_eq!(log.commit(2)?, 2);
        let ops: Vec<_> = op_rx.try_iter().collect();
        assert!(matches!(ops.as_slice(), [Operation::Set { .. }]));
        assert_eq!(log.get_commit_index(), (2, 1));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "can't change vote")]
    fn set_term_vote_change() {
        let (mut log, _op_rx) = setup();
        log.set_term(1, Some(1)).unwrap();
        log.set_term(1, Some(2)).unwrap();
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn set_term_regression() {
        let (mut log, _op_rx) = setup();
        log.set_term(2, None).unwrap();
        log.set_term(1, None).unwrap();
    }

    #[test]
    /// The log state survives reloading the engine.
    fn reload_state() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(2, Some(1))?;
        log.append(None)?;
        log.append(Some(b"a".to_vec()))?;
        log.commit(1)?;

        let mut log = reload(log)?;
        assert_eq!(log.get_term(), (2, Some(1)));
        assert_eq!(log.get_last_index(), (2, 2));
        assert_eq!(log.get_commit_index(), (1, 2));
        assert_eq!(dump(&mut log)?, vec![entry(1, 2, ""), entry(2, 2, "a")]);
        Ok(())
    }

    #[test]
    fn has() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None)?;
        log.append(None)?;
        log.set_term(2, None)?;
        log.append(None)?;
        log.append(None)?;

        assert!(!log.has(0, 0)?);
        assert!(log.has(1, 1)?);
        assert!(!log.has(1, 2)?);
        assert!(log.has(3, 2)?);
        assert!(!log.has(4, 2)?);
        Ok(())
    }

    #[test]
    /// Splicing appends, skips existing entries, and truncates conflicts.
    fn splice() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(3, None)?;
        assert_eq!(log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 2, "c")])?, 3);

        // Existing entries are ignored, including a prefix of the log.
        assert_eq!(log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b")])?, 3);
        assert_eq!(dump(&mut log)?.len(), 3);

        // A conflicting entry truncates the tail.
        log.commit(1)?;
        assert_eq!(log.splice(vec![entry(2, 3, "x")])?, 2);
        assert_eq!(dump(&mut log)?, vec![entry(1, 1, "a"), entry(2, 3, "x")]);
        assert_eq!(log.get_last_index(), (2, 3));

        // Empty splices are noops.
        assert_eq!(log.splice(vec![])?, 2);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "must touch existing log")]
    fn splice_gap() {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None).unwrap();
        log.splice(vec![entry(2, 1, "a")]).unwrap();
    }

    #[test]
    #[should_panic(expected = "below commit index")]
    fn splice_below_commit() {
        let (mut log, _op_rx) = setup();
        log.set_term(2, None).unwrap();
        log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b")]).unwrap();
        log.commit(2).unwrap();
        log.splice(vec![entry(2, 2, "c")]).unwrap();
    }

    #[test]
    /// Compaction removes a prefix, and compacted entries are considered
    /// present and committed.
    fn compact() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None)?;
        for command in ["a", "b", "c", "d"] {
            log.append(Some(command.as_bytes().to_vec()))?;
        }
        log.commit(3)?;

        assert_eq!(log.compact(2)?, 2);
        assert_eq!(log.get_compacted(), (2, 1));
        assert_eq!(log.get_first_index(), 3);
        assert_eq!(log.get(2)?, None);
        assert!(log.has(1, 1)?);
        assert!(log.has(2, 1)?);
        assert!(!log.has(2, 7)?);
        assert_eq!(dump(&mut log)?, vec![entry(3, 1, "c"), entry(4, 1, "d")]);

        // Compacting below the compacted index is a noop.
        assert_eq!(log.compact(1)?, 2);

        // Splicing compacted entries ignores them.
        assert_eq!(log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 1, "c")])?, 4);

        // The compacted state survives a reload.
        let mut log = reload(log)?;
        assert_eq!(log.get_compacted(), (2, 1));
        assert_eq!(log.get_last_index(), (4, 1));
        assert_eq!(dump(&mut log)?.len(), 2);

        // Compacting everything keeps the last index.
        log.commit(4)?;
        log.compact(4)?;
        let mut log = reload(log)?;
        assert_eq!(log.get_last_index(), (4, 1));
        assert_eq!(dump(&mut log)?, vec![]);
        assert_eq!(log.append(None)?, 5);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "uncommitted")]
    fn compact_uncommitted() {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None).unwrap();
        log.append(None).unwrap();
        log.compact(1).unwrap();
    }

    #[test]
    /// Entries left behind by an interrupted compaction are removed on reload.
    fn compact_interrupted() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None)?;
        log.append(None)?;
        log.append(None)?;
        log.append(None)?;
        log.engine.set(&Key::Compacted.encode(), bincode::serialize(&(2u64, 1u64))?)?;

        let mut log = reload(log)?;
        assert_eq!(log.get_compacted(), (2, 1));
        assert_eq!(dump(&mut log)?, vec![entry(3, 1, "")]);
        Ok(())
    }

    #[test]
    /// Installing a snapshot retains the log if it contains the snapshot
    /// entry, and discards it otherwise.
    fn install_snapshot() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(2, None)?;
        log.splice(vec![entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 2, "c")])?;

        log.install_snapshot(2, 1)?;
        assert_eq!(log.get_compacted(), (2, 1));
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(dump(&mut log)?, vec![entry(3, 2, "c")]);

        // A snapshot from a different lineage discards the log.
        log.set_term(3, None)?;
        log.install_snapshot(5, 3)?;
        assert_eq!(log.get_compacted(), (5, 3));
        assert_eq!(log.get_commit_index(), (5, 3));
        assert_eq!(log.get_last_index(), (5, 3));
        assert_eq!(dump(&mut log)?, vec![]);
        assert_eq!(log.append(None)?, 6);

        let log = reload(log)?;
        assert_eq!(log.get_last_index(), (6, 3));
        assert_eq!(log.get_commit_index(), (5, 3));
        Ok(())
    }

    #[test]
    /// A gap in the stored entries is a log inconsistency.
    fn gap() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None)?;
        log.append(None)?;
        log.append(None)?;
        log.append(None)?;
        log.engine.delete(&Key::Entry(2).encode())?;

        assert!(matches!(reload(log), Err(Error::LogInconsistency(_))));
        Ok(())
    }

    #[test]
    fn scan_apply() -> Result<()> {
        let (mut log, _op_rx) = setup();
        log.set_term(1, None)?;
        log.append(None)?;
        log.append(None)?;
        log.append(None)?;
        log.commit(2)?;

        let applied: Vec<_> = log.scan_apply(0).collect::<Result<_>>()?;
        assert_eq!(applied, vec![entry(1, 1, ""), entry(2, 1, "")]);
        assert_eq!(log.scan_apply(2).count(), 0);
        assert_eq!(log.scan_apply(3).count(), 0);
        Ok(())
    }
}
