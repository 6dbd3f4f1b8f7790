use super::{Compaction, Entry, Index, NodeID, Snapshot, Term, Ticks};
use crate::encoding;
use crate::error::Result;
use crate::storage;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A message envelope specifying the sender and receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The recipient.
    pub to: NodeID,
    /// The message.
    pub message: Message,
}

impl encoding::Value for Envelope {}

/// A message sent between Raft nodes. Messages are sent asynchronously (i.e.
/// they are not request/response) and may be dropped or reordered.
///
/// In practice, they are sent across a TCP connection and crossbeam channels
/// ensuring messages are not dropped or reordered as long as the connection
/// remains intact. A message and its response are sent across separate TCP
/// connections (outbound from their respective senders).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Candidates campaign for leadership by soliciting votes from peers.
    /// Votes will only be granted if the candidate's log is at least as
    /// up-to-date as the voter.
    Campaign {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },

    /// Followers may vote for a single candidate per term, but only if the
    /// candidate's log is at least as up-to-date as the follower. Candidates
    /// implicitly vote for themselves.
    CampaignResponse {
        /// If true, the follower granted the candidate a vote. A false response
        /// isn't necessary, but is emitted for clarity.
        vote: bool,
    },

    /// Leaders send periodic heartbeats to its followers. The commit index is
    /// used to advance the follower's commit index, and the read sequence
    /// number confirms leadership for pending linearizable reads.
    Heartbeat {
        /// The index of the leader's last committed log entry.
        commit_index: Index,
        /// The term of the leader's last committed log entry.
        commit_term: Term,
        /// The latest read sequence number of the leader.
        read_seq: ReadSequence,
    },

    /// Followers respond to leader heartbeats if they still consider it leader.
    HeartbeatResponse {
        /// The index of the follower's last log entry.
        last_index: Index,
        /// The term of the follower's last log entry.
        last_term: Term,
        /// The heartbeat's read sequence number.
        read_seq: ReadSequence,
    },

    /// Leaders replicate log entries to followers by appending to their logs
    /// after the given base entry. If the base entry matches the follower's
    /// log then their logs are identical up to it (see section 5.3 in the Raft
    /// paper), and the entries can be appended, possibly replacing conflicting
    /// entries. Otherwise, the append is rejected and the leader must retry an
    /// earlier base index until a common base is found.
    ///
    /// Empty appends messages (no entries) are used to probe follower logs for
    /// a common match index in the case of divergent logs or restarted nodes.
    Append {
        /// The index of the log entry to append after.
        base_index: Index,
        /// The term of the base entry.
        base_term: Term,
        /// Log entries to append. Must start at base_index + 1.
        entries: Vec<Entry>,
    },

    /// Followers accept or reject appends from the leader depending on whether
    /// the base entry matches their log. Installed snapshots are also
    /// acknowledged with an accepting response.
    AppendResponse {
        /// If true, the follower rejected the leader's entries.
        reject: bool,
        /// The index up to which the follower's log is known to match the
        /// leader's log. 0 when rejecting.
        match_index: Index,
        /// The follower's last log index. When rejecting, the leader can skip
        /// directly to it instead of probing entries one by one.
        last_index: Index,
    },

    /// Leaders send a state machine snapshot to followers that need entries
    /// that have been removed by log compaction.
    InstallSnapshot {
        /// The snapshot, taken at the leader's last snapshot index.
        snapshot: Snapshot,
    },

    /// A client request. This can be submitted to the leader, or to a follower
    /// which will forward it to its leader. If there is no leader, or the
    /// leader or term changes, the request is rejected with Error::NotLeader or
    /// aborted with Error::Abort and the client must retry.
    ClientRequest {
        /// The request ID. This is arbitrary, but must be globally unique for
        /// the duration of the request.
        id: RequestID,
        /// The request.
        request: Request,
    },

    /// A client response.
    ClientResponse {
        /// The response ID. This matches the ID of the ClientRequest.
        id: RequestID,
        /// The response, or an error.
        response: Result<Response>,
    },
}

/// A client request ID. Must be globally unique for the duration of the
/// request. For simplicity, a random UUID v4 is used.
pub type RequestID = Vec<u8>;

/// A read sequence number, used to confirm leadership for linearizable reads.
pub type ReadSequence = u64;

/// A client request, typically passed through to the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// A state machine read command, executed via `State::read`. This is not
    /// replicated, and only evaluated on the leader.
    Read(Vec<u8>),
    /// A batch of state machine write commands, executed via `State::apply`.
    /// These are replicated across all nodes, and must result in a
    /// deterministic result. The leader appends the whole batch to its log in
    /// one step, at consecutive indexes, so a committed part of the batch is
    /// always a prefix of it. The response is returned once all commands have
    /// been applied, with their results in order.
    Write(Vec<Vec<u8>>),
    /// Like Write, but responds with the log indexes as soon as the leader has
    /// appended the commands to its log.
    Append(Vec<Vec<u8>>),
    /// Requests Raft node status, along with the committed log if log is
    /// true. Both are taken at the same point. Answered by the local node.
    Status { log: bool },
    /// Scans committed log entries. Answered by the local node.
    Scan(Scan),
    /// Advisory hint that the observer no longer needs entries up to and
    /// including the index. Caps log truncation by compaction.
    Release { observer: String, index: Index },
    /// Enables or disables automatic compaction.
    Compaction(bool),
    /// Starts a compaction at the applied index, unless one is in progress.
    Compact,
}

impl Request {
    /// Returns true if the request is answered by the local node regardless of
    /// its role, rather than by the leader.
    pub fn is_local(&self) -> bool {
        !matches!(self, Request::Read(_) | Request::Write(_) | Request::Append(_))
    }
}

/// A committed log entry scan. Scans below the first retained index start at
/// the first retained index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scan {
    /// The first entries.
    Head { limit: u64 },
    /// The last committed entries.
    Tail { limit: u64 },
    /// Entries in the range [start, stop).
    Slice { start: Index, stop: Index },
    /// Entries at or after first. Waits until at least one is committed, or
    /// the timeout expires (responding with no entries).
    Poll { first: Index, limit: u64, timeout: Ticks },
    /// The entry at the given index.
    At(Index),
}

/// A client response. This will be wrapped in a Result for error handling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// A state machine read result.
    Read(Vec<u8>),
    /// State machine write results, one per command.
    Write(Vec<Vec<u8>>),
    /// The log indexes of appended commands.
    Append(Vec<Index>),
    /// A status response, with the committed log if requested.
    Status(Status, Option<Entries>),
    /// Scanned log entries.
    Entries(Entries),
    /// An acknowledged release hint.
    Release,
    /// The compaction status, after a Compaction request.
    Compaction(Compaction),
    /// The index of the snapshot being taken.
    Compact(Index),
}

/// Committed log entries returned by a scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entries {
    /// The first index retained in the log.
    pub first_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// The scanned entries.
    pub entries: Vec<Entry>,
}

/// A node role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Candidate,
    Follower,
    Leader,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleKind::Candidate => write!(f, "candidate"),
            RoleKind::Follower => write!(f, "follower"),
            RoleKind::Leader => write!(f, "leader"),
        }
    }
}

/// Raft node status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node ID.
    pub id: NodeID,
    /// The node's current role.
    pub role: RoleKind,
    /// The current leader, if known.
    pub leader: Option<NodeID>,
    /// The current term.
    pub term: Term,
    /// The commit index.
    pub commit_index: Index,
    /// The applied index.
    pub applied_index: Index,
    /// The first index retained in the log.
    pub first_index: Index,
    /// The last log index.
    pub last_index: Index,
    /// The index of the last entry removed by compaction.
    pub compacted_index: Index,
    /// The match index of all nodes, as seen by the leader. Empty on other
    /// roles.
    pub progress: BTreeMap<NodeID, Index>,
    /// The compaction status.
    pub compaction: Compaction,
    /// The log storage engine status.
    pub storage: storage::Status,
}
