use super::{Command, LogEntry, Outcome, Path, Query, Session, Transaction, Value};
use crate::encoding::{self, Value as _};
use crate::errdata;
use crate::error::Result;
use crate::raft::{self, Index, Ticks, TICK_INTERVAL};

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The default client request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The default long-poll timeout.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// The result of a batch write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    /// The highest log index among the results, or 0 if none has one.
    pub index: Index,
    /// The outcome of each transaction, in submission order.
    pub results: Vec<Outcome>,
}

/// Node status, along with the committed log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The Raft status.
    pub raft: raft::Status,
    /// The retained committed log entries.
    pub log: Vec<LogEntry>,
}

/// Committed log entries, as returned by log scans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entries {
    /// The first index retained in the log.
    pub first_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// The scanned entries.
    pub entries: Vec<LogEntry>,
}

impl TryFrom<raft::Entries> for Entries {
    type Error = crate::error::Error;

    fn try_from(entries: raft::Entries) -> Result<Self> {
        Ok(Self {
            first_index: entries.first_index,
            commit_index: entries.commit_index,
            entries: entries.entries.into_iter().map(LogEntry::try_from).collect::<Result<_>>()?,
        })
    }
}

/// An Agency client request, as sent over TCP. Mirrors the Agency methods.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Write { transactions: Vec<Transaction>, wait_for_sync: bool },
    Read { paths: Vec<Path> },
    Inquire { client_ids: Vec<String> },
    Dump,
    Status,
    Head { limit: u64 },
    Tail { limit: u64 },
    Slice { start: Index, stop: Index },
    Poll { first: Index, limit: u64 },
    At { index: Index },
    Release { observer: String, index: Index },
    SetCompaction { enabled: bool },
    Compact,
}

impl encoding::Value for Request {}

/// An Agency client response, as sent over TCP.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Write(WriteResult),
    Read(Vec<Option<Value>>),
    Inquire(Vec<Option<Session>>),
    Dump(Value),
    Status(Status),
    Entries(Entries),
    Release,
    Compaction(raft::Compaction),
    Compact(Index),
}

impl encoding::Value for Response {}

/// A request submitted to the node's event loop, along with a channel for
/// the response.
pub type Submission = (raft::Request, Sender<Result<raft::Response>>);

/// The Agency API of the local node. Requests are submitted to the node's
/// event loop, which answers local requests itself and forwards others to the
/// leader. Cloning the handle is cheap.
#[derive(Clone)]
pub struct Agency {
    request_tx: Sender<Submission>,
    timeout: Duration,
    poll_timeout: Duration,
}

impl Agency {
    /// Creates a new Agency handle, submitting requests via the given channel.
    pub fn new(request_tx: Sender<Submission>, timeout: Duration, poll_timeout: Duration) -> Self {
        Self { request_tx, timeout, poll_timeout }
    }

    /// Submits a request, returning a receiver for the response.
    fn submit(&self, request: raft::Request) -> Result<Receiver<Result<raft::Response>>> {
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        self.request_tx.send((request, response_tx))?;
        Ok(response_rx)
    }

    /// Executes a request, waiting up to the given timeout for a response.
    fn execute(&self, request: raft::Request, timeout: Duration) -> Result<raft::Response> {
        self.submit(request)?.recv_timeout(timeout)?
    }

    /// Writes a batch of transactions, each in its own log entry. The batch
    /// is submitted to the leader as a single request, and appended to its log
    /// in submission order at consecutive indexes. If only part of the batch
    /// commits, e.g. on a leader change, it's a prefix of the batch.
    ///
    /// With wait_for_sync, each result is the applied outcome. Otherwise the
    /// results are Outcome::Accepted as soon as the leader has appended the
    /// entries, and the applied outcome can be looked up via inquire().
    ///
    /// On Error::Timeout or Error::Abort the outcome of the batch is unknown.
    /// Clients should retry it with the same client tags. A client must not
    /// have multiple tagged batches in flight, since a later sequence number
    /// marks all earlier ones as applied.
    pub fn write(&self, transactions: Vec<Transaction>, wait_for_sync: bool) -> Result<WriteResult> {
        if transactions.is_empty() {
            return Ok(WriteResult { index: 0, results: Vec::new() });
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or_default();
        let commands = transactions
            .into_iter()
            .map(|transaction| Command { timestamp, transaction }.encode())
            .collect::<Result<Vec<_>>>()?;
        let count = commands.len();

        let results: Vec<Outcome> = match wait_for_sync {
            true => match self.execute(raft::Request::Write(commands), self.timeout)? {
                raft::Response::Write(outcomes) => {
                    outcomes.iter().map(|outcome| Outcome::decode(outcome)).collect::<Result<_>>()?
                }
                response => return errdata!("unexpected response {response:?}"),
            },
            false => match self.execute(raft::Request::Append(commands), self.timeout)? {
                raft::Response::Append(indexes) => {
                    indexes.into_iter().map(|index| Outcome::Accepted { index }).collect()
                }
                response => return errdata!("unexpected response {response:?}"),
            },
        };
        if results.len() != count {
            return errdata!("expected {count} write results, got {}", results.len());
        }
        let index = results.iter().filter_map(Outcome::index).max().unwrap_or(0);
        Ok(WriteResult { index, results })
    }

    /// Executes a read query on the leader.
    fn query(&self, query: Query) -> Result<Vec<u8>> {
        match self.execute(raft::Request::Read(query.encode()?), self.timeout)? {
            raft::Response::Read(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Reads the values at the given paths. The read is linearizable: it
    /// observes every write acknowledged before it was issued.
    pub fn read(&self, paths: Vec<Path>) -> Result<Vec<Option<Value>>> {
        Vec::decode(&self.query(Query::Get { paths })?)
    }

    /// Fetches the sessions of the given clients.
    pub fn inquire(&self, client_ids: Vec<String>) -> Result<Vec<Option<Session>>> {
        Vec::decode(&self.query(Query::Inquire { client_ids })?)
    }

    /// Fetches the entire document tree.
    pub fn dump(&self) -> Result<Value> {
        Value::decode(&self.query(Query::Dump)?)
    }

    /// Fetches the local node's status, along with its committed log as of
    /// the same point.
    pub fn status(&self) -> Result<Status> {
        match self.execute(raft::Request::Status { log: true }, self.timeout)? {
            raft::Response::Status(raft, Some(entries)) => {
                Ok(Status { raft, log: Entries::try_from(entries)?.entries })
            }
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Scans the local node's committed log.
    fn scan(&self, scan: raft::Scan, timeout: Duration) -> Result<Entries> {
        match self.execute(raft::Request::Scan(scan), timeout)? {
            raft::Response::Entries(entries) => entries.try_into(),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the first committed entries.
    pub fn head(&self, limit: u64) -> Result<Entries> {
        self.scan(raft::Scan::Head { limit }, self.timeout)
    }

    /// Returns the last committed entries.
    pub fn tail(&self, limit: u64) -> Result<Entries> {
        self.scan(raft::Scan::Tail { limit }, self.timeout)
    }

    /// Returns committed entries in the range [start, stop).
    pub fn slice(&self, start: Index, stop: Index) -> Result<Entries> {
        self.scan(raft::Scan::Slice { start, stop }, self.timeout)
    }

    /// Returns up to limit committed entries at or after first, waiting up to
    /// the poll timeout for one to be committed. Returns no entries if none
    /// was committed in time.
    pub fn poll(&self, first: Index, limit: u64) -> Result<Entries> {
        let ticks = self.poll_timeout.as_millis() / TICK_INTERVAL.as_millis();
        let timeout = Ticks::try_from(ticks.max(1)).unwrap_or(Ticks::MAX);
        debug!("Polling log from {first} for {timeout} ticks");
        self.scan(raft::Scan::Poll { first, limit, timeout }, self.poll_timeout + self.timeout)
    }

    /// Returns the committed entry at the given index, if retained.
    pub fn at(&self, index: Index) -> Result<Entries> {
        self.scan(raft::Scan::At(index), self.timeout)
    }

    /// Tells the local node that the observer no longer needs log entries up
    /// to and including the index. This caps log truncation by compaction
    /// until the observer releases a later index.
    pub fn release(&self, observer: &str, index: Index) -> Result<()> {
        let request = raft::Request::Release { observer: observer.to_string(), index };
        match self.execute(request, self.timeout)? {
            raft::Response::Release => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Enables or disables automatic compaction on the local node.
    pub fn set_compaction(&self, enabled: bool) -> Result<raft::Compaction> {
        match self.execute(raft::Request::Compaction(enabled), self.timeout)? {
            raft::Response::Compaction(compaction) => Ok(compaction),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Takes a snapshot on the local node at its applied index, returning the
    /// index. The log is truncated once the snapshot is durable.
    pub fn compact(&self) -> Result<Index> {
        match self.execute(raft::Request::Compact, self.timeout)? {
            raft::Response::Compact(index) => Ok(index),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Executes a client request received over the network.
    pub fn handle(&self, request: Request) -> Result<Response> {
        Ok(match request {
            Request::Write { transactions, wait_for_sync } => {
                Response::Write(self.write(transactions, wait_for_sync)?)
            }
            Request::Read { paths } => Response::Read(self.read(paths)?),
            Request::Inquire { client_ids } => Response::Inquire(self.inquire(client_ids)?),
            Request::Dump => Response::Dump(self.dump()?),
            Request::Status => Response::Status(self.status()?),
            Request::Head { limit } => Response::Entries(self.head(limit)?),
            Request::Tail { limit } => Response::Entries(self.tail(limit)?),
            Request::Slice { start, stop } => Response::Entries(self.slice(start, stop)?),
            Request::Poll { first, limit } => Response::Entries(self.poll(first, limit)?),
            Request::At { index } => Response::Entries(self.at(index)?),
            Request::Release { observer, index } => {
                self.release(&observer, index)?;
                Response::Release
            }
            Request::SetCompaction { enabled } => Response::Compaction(self.set_compaction(enabled)?),
            Request::Compact => Response::Compact(self.compact()?),
        })
    }
}
