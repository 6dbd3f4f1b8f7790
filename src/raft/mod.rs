//! Implements the Raft distributed consensus protocol, which replicates the
//! Agency log across a cluster of nodes.
//!
//! For details, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//! * Raft website: <https://raft.github.io>
//!
//! Raft has three main properties:
//!
//! * Fault tolerance: the system tolerates node failures as long as a majority
//!   of nodes (>50%) remain operational.
//!
//! * Linearizability (aka strong consistency): once a client write has been
//!   accepted, it is visible to all clients -- they never see outdated data.
//!
//! * Durability: a write is never lost as long as a majority of nodes remain.
//!
//! It does this by electing a single leader node which serves client requests
//! and replicates writes to other nodes. Requests are executed once they have
//! been confirmed by a strict majority of nodes (a quorum). If a leader fails,
//! a new leader is elected.
//!
//! RAFT LOG AND STATE MACHINE
//! ==========================
//!
//! Raft maintains an ordered command log containing write commands submitted
//! by clients. Once committed, the commands are applied sequentially to a local
//! state machine on each node. Raft simply passes opaque commands to an opaque
//! state machine, in our case the Agency document tree (see `agency::State`).
//!
//! The Raft log is managed by `Log` and stored locally in a `storage::Engine`.
//! The state machine interface is the `State` trait.
//!
//! LEADER ELECTION
//! ===============
//!
//! Raft nodes can be in one of three states (or roles): follower, candidate,
//! and leader, modelled as `Node::Follower`, `Node::Candidate`, and
//! `Node::Leader`.
//!
//! Raft divides time into terms, which are monotonically increasing numbers.
//! There can be at most one leader in a term. Nodes keep track of their last
//! known term and store it on disk (see `Log::set_term()`). Messages between
//! nodes are tagged with the current term (as `Envelope::term`) -- old terms
//! are ignored, and future terms cause the node to become a follower in that
//! term.
//!
//! Nodes start out as leaderless followers. If they don't hear from a leader
//! within the randomized election timeout, they become candidates, increase
//! their term, and send `Message::Campaign` to all nodes. A node grants a
//! single vote per term (stored via `Log::set_term()`), and only to candidates
//! whose log is at least as up-to-date as its own. A candidate that receives a
//! strict majority of votes becomes leader, appends a noop entry to commit
//! entries from previous terms (Raft paper section 5.4.2), and sends periodic
//! `Message::Heartbeat` to assert its leadership.
//!
//! REPLICATION AND CONSENSUS
//! =========================
//!
//! The leader appends client writes to its log and sends them to followers in
//! `Message::Append`, along with the index and term of the preceding entry
//! (the base). Followers append the entries if they have the base entry,
//! replacing any conflicting uncommitted entries, and respond with
//! `Message::AppendResponse`. If they don't have the base entry, they reject
//! the append, and include their last index so the leader can skip ahead
//! instead of probing entries one by one.
//!
//! Once a quorum has an entry from the leader's current term, the leader
//! commits it (and all entries before it) and applies it. Followers learn the
//! commit index from heartbeats.
//!
//! CLIENT REQUESTS
//! ===============
//!
//! Client requests are submitted as `Message::ClientRequest` to the local node.
//! Reads and writes are only processed on the leader, but followers will proxy
//! them to the leader (Raft thesis section 6.2). Without a known leader,
//! requests are rejected with `Error::NotLeader`. Requests are not retried
//! internally, and are aborted with `Error::Abort` on leader/term changes. The
//! outcome of an aborted write is unknown, and clients must retry it with the
//! same client ID and sequence number, which the state machine deduplicates.
//!
//! Status, log scans, release hints and compaction requests are answered by
//! the local node regardless of its role.
//!
//! Reads use the read index protocol (Raft thesis section 6.4). The leader
//! assigns each read a sequence number and records its commit index. Reads
//! are executed once a quorum has confirmed the sequence number in heartbeat
//! responses, the state machine has applied the recorded commit index, and the
//! leader has committed an entry in its own term.
//!
//! LOG COMPACTION
//! ==============
//!
//! Once enough entries have been applied, the node captures the state machine
//! (a cheap copy-on-write view) and hands it to the `Compactor` thread, which
//! serializes and persists it via a `SnapshotStore`. Once the snapshot is
//! durable, the log prefix is truncated (Raft paper section 7), retaining a
//! configurable number of entries for log observers and lagging followers.
//! Observers can further cap truncation with release hints. Followers that
//! need truncated entries are sent the snapshot via `Message::InstallSnapshot`.
//!
//! IMPLEMENTATION CAVEATS
//! ======================
//!
//! * No leases: every read requires a heartbeat round with a quorum.
//!
//! * No cluster membership changes: the cluster must be restarted with the
//!   new configuration.
//!
//! * No pre-vote or check-quorum: a partially partitioned node can disrupt the
//!   leader with spurious elections.
//!
//! * No snapshot chunking: snapshots are sent in a single message, which is
//!   fine for the small control-plane state the Agency stores.

mod compactor;
mod log;
mod message;
mod node;
mod snapshot;
mod state;

pub use compactor::{Compaction, Compactor, Done, Job};
pub use log::{Entry, Index, Key, Log};
pub use message::{
    Entries, Envelope, Message, ReadSequence, Request, RequestID, Response, RoleKind, Scan, Status,
};
pub use node::{Node, NodeID, Options, Term, Ticks};
pub use snapshot::{FileSnapshots, MemorySnapshots, Snapshot, SnapshotStore};
pub use state::{Capture, State};

/// The interval between Raft ticks, the unit of time.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// The interval between leader heartbeats in ticks.
const HEARTBEAT_INTERVAL: Ticks = 4;

/// The default election timeout range in ticks. This is randomized in this
/// interval, to avoid election ties.
const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 10..20;

/// The maximum number of entries to send in a single append message.
const MAX_APPEND_ENTRIES: usize = 100;

/// The default number of applied entries between snapshots.
const COMPACTION_STEP: u64 = 1000;

/// The default number of entries retained before the snapshot index.
const COMPACTION_KEEP: u64 = 50000;
