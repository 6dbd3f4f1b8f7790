//! The Agency: a replicated, strongly consistent document store for cluster
//! configuration and coordination.
//!
//! Clients submit write transactions, each consisting of preconditions and
//! operations on paths in a JSON document tree. Transactions are appended to
//! the Raft log, and once committed they are applied in log order on every
//! node by the `State` state machine. A transaction applies atomically: if
//! any precondition fails, none of its operations are applied.
//!
//! Reads are served by the leader once it has confirmed its leadership with a
//! quorum, so they always observe all previously acknowledged writes.
//!
//! The committed log itself is also exposed to clients, via scans and
//! long-polls, so that observers can follow every change. Observers can send
//! release hints to prevent compaction from truncating entries they haven't
//! consumed yet.
//!
//! `Agency` is the in-process API for a single node, submitting requests to
//! the node's event loop (see `Server`). `Client` provides the same API over
//! TCP.

mod api;
mod dedup;
mod state;
mod transaction;
mod tree;
mod value;

pub use api::{
    Agency, Entries, Request, Response, Status, Submission, WriteResult, POLL_TIMEOUT,
    REQUEST_TIMEOUT,
};
pub use dedup::{ClientProgress, Session, SESSION_OUTCOMES};
pub use state::{Command, LogEntry, Query, State};
pub use transaction::{ClientTag, Operation, Outcome, Precondition, Transaction};
pub use tree::Tree;
pub use value::{Path, Value};
