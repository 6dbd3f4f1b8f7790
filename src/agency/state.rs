use super::{ClientProgress, ClientTag, Outcome, Path, Session, Transaction, Tree, Value};
use crate::encoding::{self, bincode, Value as _};
use crate::errdata;
use crate::error::{Error, Result};
use crate::raft::{self, Index, Term};

use log::debug;
use serde::{Deserialize, Serialize};

/// A write command, submitted via Raft and applied on all nodes. Each command
/// carries a single transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// The submission time in milliseconds since the Unix epoch, as seen by
    /// the submitting node. Informational only.
    pub timestamp: u64,
    /// The transaction.
    pub transaction: Transaction,
}

impl encoding::Value for Command {}

/// A read query, executed on the leader once it has confirmed its leadership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Fetches the values at the given paths, as Vec<Option<Value>>.
    Get { paths: Vec<Path> },
    /// Fetches the sessions of the given clients, as Vec<Option<Session>>.
    /// Used to resolve unknown outcomes after a timeout or abort.
    Inquire { client_ids: Vec<String> },
    /// Fetches the entire tree, as a Value.
    Dump,
}

impl encoding::Value for Query {}

/// A decoded log entry, as returned by log scans.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    /// The command timestamp, or 0 for noop entries.
    pub timestamp: u64,
    /// The client ID of a tagged transaction.
    pub client_id: Option<String>,
    /// The transaction, or None for leader noop entries.
    pub transaction: Option<Transaction>,
}

impl encoding::Value for LogEntry {}

impl TryFrom<raft::Entry> for LogEntry {
    type Error = Error;

    fn try_from(entry: raft::Entry) -> Result<Self> {
        let command = entry.command.as_deref().map(Command::decode).transpose()?;
        let (timestamp, transaction) = match command {
            Some(Command { timestamp, transaction }) => (timestamp, Some(transaction)),
            None => (0, None),
        };
        let client_id =
            transaction.as_ref().and_then(|t| t.client.as_ref()).map(|tag| tag.id.clone());
        Ok(Self { index: entry.index, term: entry.term, timestamp, client_id, transaction })
    }
}

/// The Agency state machine: the document tree and client progress, as of the
/// applied index.
///
/// Committed entries are applied strictly in index order. A tagged
/// transaction that was already applied is skipped, returning its stored
/// outcome. Otherwise the preconditions are checked against the current tree,
/// and either all operations are applied or none are. In all cases the
/// applied index advances, so rejected transactions still consume their log
/// index.
///
/// Applying performs no IO. The state is held in memory, and made durable by
/// snapshots and log replay.
#[derive(Debug, Default)]
pub struct State {
    applied_index: Index,
    tree: Tree,
    progress: ClientProgress,
}

/// A point-in-time capture of the state, which is also the snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct Capture {
    index: Index,
    tree: Tree,
    progress: ClientProgress,
}

impl raft::Capture for Capture {
    fn encode(self: Box<Self>) -> Result<Vec<u8>> {
        bincode::serialize(&*self)
    }
}

impl State {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the document tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Returns the client progress.
    pub fn progress(&self) -> &ClientProgress {
        &self.progress
    }

    /// Executes a transaction at the given index, deduplicating tagged
    /// transactions.
    fn execute(&mut self, transaction: Transaction, index: Index) -> Outcome {
        if let Some(ClientTag { id, seq }) = &transaction.client {
            if let Some(outcome) = self.progress.check(id, *seq) {
                debug!("Skipping duplicate transaction {id}/{seq} at {index}");
                return outcome;
            }
        }
        let outcome = transaction.apply(&mut self.tree, index);
        if let Some(ClientTag { id, seq }) = &transaction.client {
            self.progress.record(id, *seq, outcome.clone());
        }
        outcome
    }
}

impl raft::State for State {
    fn get_applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: raft::Entry) -> Result<Vec<u8>> {
        assert_eq!(entry.index, self.applied_index + 1, "entry index not after applied index");

        // Noops and undecodable commands still advance the applied index.
        self.applied_index = entry.index;
        let Some(command) = entry.command else {
            return Ok(Vec::new());
        };
        let command = Command::decode(&command)?;
        self.execute(command.transaction, entry.index).encode()
    }

    fn read(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        match Query::decode(&command)? {
            Query::Get { paths } => {
                paths.iter().map(|path| self.tree.get(path)).collect::<Vec<Option<Value>>>().encode()
            }
            Query::Inquire { client_ids } => client_ids
                .iter()
                .map(|id| self.progress.session(id).cloned())
                .collect::<Vec<Option<Session>>>()
                .encode(),
            Query::Dump => self.tree.dump().encode(),
        }
    }

    fn capture(&self) -> Result<Box<dyn raft::Capture>> {
        Ok(Box::new(Capture {
            index: self.applied_index,
            tree: self.tree.clone(),
            progress: self.progress.clone(),
        }))
    }

    fn restore(&mut self, index: Index, data: &[u8]) -> Result<()> {
        let capture: Capture = bincode::deserialize(data)?;
        if capture.index != index {
            return errdata!("snapshot data is at index {}, expected {index}", capture.index);
        }
        debug!("Restored state at index {index} with {} client sessions", capture.progress.len());
        *self = Self { applied_index: capture.index, tree: capture.tree, progress: capture.progress };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::raft::{Entry, State as _};
    use pretty_assertions::assert_eq;

    /// Applies a transaction as the next log entry, returning its outcome.
    fn apply(state: &mut State, transaction: Transaction) -> Result<Outcome> {
        let command = Command { timestamp: 1, transaction }.encode()?;
        let index = state.get_applied_index() + 1;
        Outcome::decode(&state.apply(Entry { index, term: 1, command: Some(command) })?)
    }

    fn get(state: &State, path: &str) -> Result<Option<Value>> {
        let response = state.read(Query::Get { paths: vec![path.into()] }.encode()?)?;
        Ok(Vec::<Option<Value>>::decode(&response)?.pop().flatten())
    }

    #[test]
    fn apply_noop() -> Result<()> {
        let mut state = State::new();
        assert_eq!(state.apply(Entry { index: 1, term: 1, command: None })?, Vec::<u8>::new());
        assert_eq!(state.get_applied_index(), 1);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "entry index not after applied index")]
    fn apply_gap() {
        let mut state = State::new();
        let _ = state.apply(Entry { index: 2, term: 1, command: None });
    }

    #[test]
    /// Undecodable commands are returned as errors, but count as applied.
    fn apply_invalid() {
        let mut state = State::new();
        let result = state.apply(Entry { index: 1, term: 1, command: Some(vec![0xff; 3]) });
        assert!(matches!(result, Err(Error::InvalidData(_))));
        assert_eq!(state.get_applied_index(), 1);
    }

    #[test]
    /// Write /a/b = 5, then read it back.
    fn set_read() -> Result<()> {
        let mut state = State::new();
        let outcome = apply(&mut state, Transaction::new().set("/a/b", 5))?;
        assert_eq!(outcome, Outcome::Applied { index: 1 });
        assert_eq!(get(&state, "/a/b")?, Some(Value::Integer(5)));
        assert_eq!(get(&state, "/a/c")?, None);
        Ok(())
    }

    #[test]
    /// Retried client transactions are applied once.
    fn dedup() -> Result<()> {
        let mut state = State::new();
        for seq in 1..=3 {
            let txn = Transaction::new().increment("/c", 1).client("client", seq);
            assert_eq!(apply(&mut state, txn)?, Outcome::Applied { index: seq });
        }
        assert_eq!(get(&state, "/c")?, Some(Value::Integer(3)));

        // A retry of seq 2 returns its original outcome, and consumes an index.
        let txn = Transaction::new().increment("/c", 1).client("client", 2);
        assert_eq!(apply(&mut state, txn)?, Outcome::Applied { index: 2 });
        assert_eq!(get(&state, "/c")?, Some(Value::Integer(3)));
        assert_eq!(state.get_applied_index(), 4);

        // Untagged transactions are never deduplicated.
        apply(&mut state, Transaction::new().increment("/c", 1))?;
        apply(&mut state, Transaction::new().increment("/c", 1))?;
        assert_eq!(get(&state, "/c")?, Some(Value::Integer(5)));
        Ok(())
    }

    #[test]
    /// A rejected transaction consumes an index, leaves the tree unchanged, and
    /// is recorded for its client.
    fn rejected() -> Result<()> {
        let mut state = State::new();
        let txn = || Transaction::new().missing("/x").set("/x", 1);
        assert_eq!(apply(&mut state, txn())?, Outcome::Applied { index: 1 });

        let before = bincode::serialize(state.tree())?;
        let outcome = apply(&mut state, txn().client("c", 1))?;
        assert_eq!(outcome, Outcome::Rejected { index: 2, path: "/x".into() });
        assert_eq!(bincode::serialize(state.tree())?, before);
        assert_eq!(state.get_applied_index(), 2);
        assert_eq!(get(&state, "/x")?, Some(Value::Integer(1)));
        assert_eq!(state.progress().check("c", 1), Some(outcome));
        Ok(())
    }

    #[test]
    fn read_queries() -> Result<()> {
        let mut state = State::new();
        apply(&mut state, Transaction::new().set("/a", 1).push("/b", "x").client("c", 7))?;

        let response = state.read(Query::Get { paths: vec!["/a".into(), "/z".into()] }.encode()?)?;
        assert_eq!(Vec::<Option<Value>>::decode(&response)?, vec![Some(Value::Integer(1)), None]);

        let response = state.read(Query::Dump.encode()?)?;
        assert_eq!(Value::decode(&response)?, Value::from_json(r#"{"a": 1, "b": ["x"]}"#)?);

        let query = Query::Inquire { client_ids: vec!["c".into(), "d".into()] };
        let sessions = Vec::<Option<Session>>::decode(&state.read(query.encode()?)?)?;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].as_ref().map(|s| s.seq), Some(7));
        assert_eq!(sessions[1], None);

        assert!(state.read(vec![0xff]).is_err());
        Ok(())
    }

    #[test]
    /// Captures are isolated from later applies, and restore the exact state.
    fn capture_restore() -> Result<()> {
        let mut state = State::new();
        apply(&mut state, Transaction::new().set("/a", 1).client("c", 1))?;
        apply(&mut state, Transaction::new().set("/b", 2))?;
        let capture = state.capture()?;
        apply(&mut state, Transaction::new().set("/a", 3).client("c", 2))?;
        let data = raft::Capture::encode(capture)?;

        let mut restored = State::new();
        assert!(matches!(restored.restore(3, &data), Err(Error::InvalidData(_))));
        restored.restore(2, &data)?;
        assert_eq!(restored.get_applied_index(), 2);
        assert_eq!(get(&restored, "/a")?, Some(Value::Integer(1)));
        assert_eq!(restored.progress().session("c").map(|s| s.seq), Some(1));

        // Replaying the remaining entry converges on the same state.
        apply(&mut restored, Transaction::new().set("/a", 3).client("c", 2))?;
        assert_eq!(restored.tree().dump(), state.tree().dump());
        assert_eq!(restored.progress(), state.progress());
        Ok(())
    }

    #[test]
    fn log_entry() -> Result<()> {
        let transaction = Transaction::new().set("/a", 1).client("c", 1);
        let command = Command { timestamp: 1700, transaction: transaction.clone() }.encode()?;
        let entry = LogEntry::try_from(Entry { index: 2, term: 1, command: Some(command) })?;
        assert_eq!(
            entry,
            LogEntry {
                index: 2,
                term: 1,
                timestamp: 1700,
                client_id: Some("c".to_string()),
                transaction: Some(transaction),
            }
        );
        let noop = LogEntry::try_from(Entry { index: 1, term: 1, command: None })?;
        assert_eq!((noop.timestamp, noop.client_id, noop.transaction), (0, None, None));
        Ok(())
    }
}
