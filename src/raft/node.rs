use super::{
    Compaction, Done, Entries, Envelope, Index, Job, Log, Message, ReadSequence, Request,
    RequestID, Response, RoleKind, Scan, SnapshotStore, State, Status, COMPACTION_KEEP,
    COMPACTION_STEP, ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES,
};
use crate::error::{Error, Result};

use crossbeam::channel::Sender;
use itertools::Itertools as _;
use log::{debug, info, warn};
use rand::Rng as _;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// A node ID.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// A logical clock interval as number of ticks.
pub type Ticks = u8;

/// Raft node options.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// Maximum number of entries to send in a single Append message.
    pub max_append_entries: usize,
    /// Whether automatic compaction is enabled at startup.
    pub compaction: bool,
    /// The number of applied entries between snapshots.
    pub compaction_step: u64,
    /// The number of entries to retain in the log before the snapshot index.
    pub compaction_keep: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            max_append_entries: MAX_APPEND_ENTRIES,
            compaction: true,
            compaction_step: COMPACTION_STEP,
            compaction_keep: COMPACTION_KEEP,
        }
    }
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a possibly
/// different role. Outbound messages are sent via the given node_tx channel,
/// and snapshot jobs via the job_tx channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// node logic. It exists for ergonomic use across role transitions, i.e
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader if
    /// there are no peers. The latest snapshot (if any) is restored into the
    /// state machine, and committed log entries after it are applied.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        snapshots: Arc<dyn SnapshotStore>,
        node_tx: Sender<Envelope>,
        job_tx: Sender<Job>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, state, snapshots, node_tx, job_tx, opts)?;
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns the node role.
    pub fn role(&self) -> RoleKind {
        match self {
            Node::Candidate(n) => n.role.kind(),
            Node::Follower(n) => n.role.kind(),
            Node::Leader(n) => n.role.kind(),
        }
    }

    /// Processes a message from a peer or local client.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }

    /// Processes the result of a snapshot job from the compactor. Once the
    /// snapshot is durable, the log prefix is truncated.
    pub fn compacted(mut self, done: Done) -> Result<Self> {
        match &mut self {
            Node::Candidate(n) => n.compacted(done)?,
            Node::Follower(n) => n.compacted(done)?,
            Node::Leader(n) => n.compacted(done)?,
        }
        Ok(self)
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role: Clone + std::fmt::Debug + PartialEq {
    /// The role kind.
    fn kind(&self) -> RoleKind;

    /// The known leader, if any. Leaders know themselves, and return None.
    fn leader(&self) -> Option<NodeID> {
        None
    }

    /// Peer match indexes, only tracked by leaders.
    fn progress(&self) -> BTreeMap<NodeID, Index> {
        BTreeMap::new()
    }
}

/// A pending log poll, answered once an entry at or after first is committed
/// or when the timeout expires.
#[derive(Clone, Debug, PartialEq)]
struct Poll {
    from: NodeID,
    id: RequestID,
    first: Index,
    limit: u64,
    remaining: Ticks,
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states (roles)
/// are encoded as RawNode<Role>. See: http://cliffle.com/blog/rust-typestate/
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    snapshots: Arc<dyn SnapshotStore>,
    node_tx: Sender<Envelope>,
    job_tx: Sender<Job>,
    opts: Options,
    compaction: Compaction,
    /// Observer release hints, capping log truncation.
    released: BTreeMap<String, Index>,
    /// Pending log polls. These are node-local and survive role changes.
    polls: Vec<Poll>,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            log: self.log,
            state: self.state,
            snapshots: self.snapshots,
            node_tx: self.node_tx,
            job_tx: self.job_tx,
            opts: self.opts,
            compaction: self.compaction,
            released: self.released,
            polls: self.polls,
            role,
        }
    }

    /// Applies any pending, committed entries to the state machine. The command
    /// responses are discarded, use maybe_apply_with() instead to access them.
    fn maybe_apply(&mut self) -> Result<()> {
        Self::maybe_apply_with(&mut self.log, self.state.as_mut(), |_, _| Ok(()))?;
        self.applied()
    }

    /// Like maybe_apply(), but calls the given closure with the result of every
    /// applied command. Not a method, so that the closure can mutate the node.
    /// Non-deterministic errors are propagated and halt the node.
    fn maybe_apply_with<F>(log: &mut Log, state: &mut dyn State, mut on_apply: F) -> Result<()>
    where
        F: FnMut(Index, Result<Vec<u8>>) -> Result<()>,
    {
        let mut scan = log.scan_apply(state.get_applied_index());
        while let Some(entry) = scan.next().transpose()? {
            let index = entry.index;
            debug!("Applying {entry:?}");
            match state.apply(entry) {
                Err(error) if !error.is_deterministic() => return Err(error),
                result => on_apply(index, result)?,
            }
        }
        Ok(())
    }

    /// Handles newly committed and applied entries: answers pending polls and
    /// takes a snapshot if due.
    fn applied(&mut self) -> Result<()> {
        self.maybe_poll()?;
        self.maybe_compact()
    }

    /// Returns the size of the cluster.
    fn cluster_size(&self) -> u8 {
        self.peers.len() as u8 + 1
    }

    /// Returns the quorum size of the cluster.
    fn quorum_size(&self) -> u8 {
        quorum_size(self.cluster_size())
    }

    /// Returns the quorum value of the given unsorted slice, in descending
    /// order. The slice must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, values: Vec<T>) -> T {
        assert!(values.len() == self.cluster_size() as usize, "values must match cluster size");
        quorum_value(values)
    }

    /// Sends a message.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.iter().copied().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Asserts common node invariants.
    fn assert_node(&self) {
        debug_assert_eq!(self.term, self.log.get_term().0, "term does not match log");
        debug_assert!(
            self.state.get_applied_index() <= self.log.get_commit_index().0,
            "applied index above commit index"
        );
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        // Messages must be addressed to the local node.
        assert_eq!(msg.to, self.id, "message to other node");

        // Senders must be known.
        assert!(
            msg.from == self.id || self.peers.contains(&msg.from),
            "unknown sender {}",
            msg.from
        );
    }

    /// Answers a request that any role serves locally.
    fn step_local(&mut self, from: NodeID, id: RequestID, request: Request) -> Result<()> {
        let response = match request {
            Request::Status { log } => self.status_with_log(log),
            Request::Scan(Scan::Poll { first, limit, timeout })
                if timeout > 0 && first > self.log.get_commit_index().0 =>
            {
                self.polls.push(Poll { from, id, first, limit, remaining: timeout });
                return Ok(());
            }
            Request::Scan(scan) => self.scan(scan).map(Response::Entries),
            Request::Release { observer, index } => {
                debug!("Observer {observer} released log through {index}");
                self.released.insert(observer, index);
                self.maybe_truncate()?;
                Ok(Response::Release)
            }
            Request::Compaction(enabled) => {
                info!("{} automatic compaction", if enabled { "Enabling" } else { "Disabling" });
                self.compaction.enabled = enabled;
                self.maybe_compact()?;
                Ok(Response::Compaction(self.compaction.clone()))
            }
            Request::Compact => self.request_compact().map(Response::Compact),
            Request::Read(_) | Request::Write(_) | Request::Append(_) => {
                panic!("leader request {request:?} handled locally")
            }
        };
        self.send(from, Message::ClientResponse { id, response })
    }

    /// Returns the node status, along with the committed log if requested.
    fn status_with_log(&mut self, log: bool) -> Result<Response> {
        let entries = match log {
            true => Some(self.scan(Scan::Head { limit: u64::MAX })?),
            false => None,
        };
        Ok(Response::Status(self.status()?, entries))
    }

    /// Returns the node status.
    fn status(&mut self) -> Result<Status> {
        let (last_index, _) = self.log.get_last_index();
        let mut progress = self.role.progress();
        let leader = match self.role.kind() {
            RoleKind::Leader => {
                progress.insert(self.id, last_index);
                Some(self.id)
            }
            _ => self.role.leader(),
        };
        Ok(Status {
            id: self.id,
            role: self.role.kind(),
            leader,
            term: self.term,
            commit_index: self.log.get_commit_index().0,
            applied_index: self.state.get_applied_index(),
            first_index: self.log.get_first_index(),
            last_index,
            compacted_index: self.log.get_compacted().0,
            progress,
            compaction: self.compaction.clone(),
            storage: self.log.status()?,
        })
    }

    /// Executes a log scan.
    fn scan(&mut self, scan: Scan) -> Result<Entries> {
        match scan {
            Scan::Head { limit } => self.scan_committed(0, Index::MAX, limit),
            Scan::Tail { limit } => {
                let start = (self.log.get_commit_index().0 + 1).saturating_sub(limit);
                self.scan_committed(start, Index::MAX, limit)
            }
            Scan::Slice { start, stop } => self.scan_committed(start, stop, u64::MAX),
            Scan::At(index) => self.scan_committed(index, index.saturating_add(1), 1),
            Scan::Poll { first, limit, .. } => self.scan_committed(first, Index::MAX, limit),
        }
    }

    /// Scans up to limit committed entries in the range [start, stop). The
    /// start is clamped to the first retained index.
    fn scan_committed(&mut self, start: Index, stop: Index, limit: u64) -> Result<Entries> {
        let first_index = self.log.get_first_index();
        let commit_index = self.log.get_commit_index().0;
        let start = start.max(first_index);
        let stop = stop.min(commit_index + 1);
        let mut entries = Vec::new();
        if start < stop && limit > 0 {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            entries = self.log.scan(start..stop).take(limit).collect::<Result<_>>()?;
        }
        Ok(Entries { first_index, commit_index, entries })
    }

    /// Answers pending polls that have committed entries.
    fn maybe_poll(&mut self) -> Result<()> {
        let commit_index = self.log.get_commit_index().0;
        if !self.polls.iter().any(|p| p.first <= commit_index) {
            return Ok(());
        }
        let (ready, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.polls).into_iter().partition(|p| p.first <= commit_index);
        self.polls = pending;
        for poll in ready {
            let response = self.scan_committed(poll.first, Index::MAX, poll.limit);
            self.send(
                poll.from,
                Message::ClientResponse { id: poll.id, response: response.map(Response::Entries) },
            )?;
        }
        Ok(())
    }

    /// Advances poll timeouts, answering expired polls with no entries.
    fn tick_polls(&mut self) -> Result<()> {
        if self.polls.is_empty() {
            return Ok(());
        }
        for poll in &mut self.polls {
            poll.remaining = poll.remaining.saturating_sub(1);
        }
        let (expired, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.polls).into_iter().partition(|p| p.remaining == 0);
        self.polls = pending;
        for poll in expired {
            let response = self.scan_committed(poll.first, poll.first, 0);
            self.send(
                poll.from,
                Message::ClientResponse { id: poll.id, response: response.map(Response::Entries) },
            )?;
        }
        Ok(())
    }

    /// Takes a snapshot if one is due.
    fn maybe_compact(&mut self) -> Result<()> {
        if self.compaction.due(self.state.get_applied_index()) {
            self.snapshot()?;
        }
        Ok(())
    }

    /// Handles a manual compaction request. If nothing was applied since the
    /// last snapshot, returns its index without taking a new one.
    fn request_compact(&mut self) -> Result<Index> {
        if self.compaction.in_progress.is_some() {
            return Err(Error::CompactionInProgress);
        }
        if self.state.get_applied_index() <= self.compaction.snapshot_index {
            return Ok(self.compaction.snapshot_index);
        }
        self.snapshot()
    }

    /// Captures the state machine at the applied index and hands it to the
    /// compactor, returning the snapshot index.
    fn snapshot(&mut self) -> Result<Index> {
        let index = self.state.get_applied_index();
        let (compacted_index, compacted_term) = self.log.get_compacted();
        let term = match self.log.get(index)? {
            Some(entry) => entry.term,
            None if index == compacted_index => compacted_term,
            None => return Err(Error::LogInconsistency(format!("applied entry {index} missing"))),
        };
        info!("Taking snapshot at {index}@{term}");
        let capture = self.state.capture()?;
        self.job_tx.send(Job { index, term, capture })?;
        self.compaction.in_progress = Some(index);
        Ok(index)
    }

    /// Records a finished snapshot job and truncates the log.
    fn compacted(&mut self, done: Done) -> Result<()> {
        match done {
            Ok((index, term)) => {
                self.compaction.complete(index, term);
                self.maybe_truncate()
            }
            Err(error) => {
                warn!("Snapshot failed, retrying on next apply: {error}");
                self.compaction.in_progress = None;
                Ok(())
            }
        }
    }

    /// Truncates the log prefix covered by the last snapshot, as far as the
    /// keep size and release hints allow.
    fn maybe_truncate(&mut self) -> Result<()> {
        let point = self.compaction.truncation_point(self.compaction.snapshot_index, &self.released);
        if point > self.log.get_compacted().0 {
            info!("Truncating log through index {point}");
            self.log.compact(point)?;
        }
        Ok(())
    }
}

/// A candidate is campaigning to become a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Votes received (including ourself).
    votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {
    fn kind(&self) -> RoleKind {
        RoleKind::Candidate
    }
}

impl RawNode<Candidate> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();

        assert_ne!(self.term, 0, "candidates can't have term 0");
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for self");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");

        assert!(
            self.role.election_duration < self.role.election_timeout,
            "election timeout passed"
        );
    }

    /// Transitions the candidate to a follower. We either lost the election and
    /// follow the winner, or we discovered a new term in which case we step
    /// into it as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<NodeID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            let voted_for = Some(self.id); // by definition
            Ok(self.into_role(Follower::new(Some(leader), voted_for, election_timeout)))
        } else {
            // We found a new term, but we don't necessarily know who the leader
            // is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            Ok(self.into_role(Follower::new(None, None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.peers.clone();
        let (last_index, _) = self.log.get_last_index();
        let mut node = self.into_role(Leader::new(peers, last_index));

        // Propose an empty command when assuming leadership, to disambiguate
        // previous entries in the log. See section 8 in the Raft paper.
        //
        // We do this prior to the heartbeat, to avoid a wasted replication
        // roundtrip if the heartbeat response indicates the peer is behind.
        node.propose(vec![None])?;
        node.maybe_commit_and_apply()?;
        node.heartbeat()?;

        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is a Heartbeat or
        // Append from the leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_follower(msg.term, None)?.step(msg);
        }

        match msg.message {
            // Don't grant votes for other candidates who also campaign.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // If we received a vote, record it. If the vote gives us quorum,
            // assume leadership.
            Message::CampaignResponse { vote: true } => {
                self.role.votes.insert(msg.from);
                if self.role.votes.len() as u8 >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get a vote. :(
            Message::CampaignResponse { vote: false } => {}

            // If we receive a heartbeat, entries or a snapshot in this term, we
            // lost the election and have a new leader. Follow it and step the
            // message.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::InstallSnapshot { .. } => {
                return self.into_follower(msg.term, Some(msg.from))?.step(msg);
            }

            // Answer local requests, and reject leader requests: we don't know
            // who the leader is.
            Message::ClientRequest { id, request } if request.is_local() => {
                self.step_local(msg.from, id, request)?
            }
            Message::ClientRequest { id, .. } => {
                let response = Err(Error::NotLeader);
                self.send(msg.from, Message::ClientResponse { id, response })?
            }

            // We're not a leader in this term, nor are we forwarding requests,
            // so we shouldn't see these.
            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::ClientResponse { .. } => panic!("received unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();
        self.tick_polls()?;

        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaign for leadership by increasing the term, voting for ourself, and
    /// soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.term = term;
        self.log.set_term(term, Some(self.id))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::Campaign { last_index, last_term })?;
        Ok(())
    }
}

// A follower replicates state from a leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
    /// The node we voted for in the current term, if any.
    voted_for: Option<NodeID>,
    // Local client requests that have been forwarded to the leader. These are
    // aborted on leader/term changes.
    forwarded: HashSet<RequestID>,
}

impl Follower {
    /// Creates a new follower role.
    fn new(leader: Option<NodeID>, voted_for: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, voted_for, leader_seen: 0, election_timeout, forwarded: HashSet::new() }
    }
}

impl Role for Follower {
    fn kind(&self) -> RoleKind {
        RoleKind::Follower
    }

    fn leader(&self) -> Option<NodeID> {
        self.leader
    }
}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower. The latest snapshot is
    /// restored if the state machine is behind it, and a snapshot that was
    /// saved but not yet installed in the log (e.g. due to a crash) is
    /// installed.
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        mut log: Log,
        mut state: Box<dyn State>,
        snapshots: Arc<dyn SnapshotStore>,
        node_tx: Sender<Envelope>,
        job_tx: Sender<Job>,
        opts: Options,
    ) -> Result<Self> {
        let mut compaction = Compaction {
            enabled: opts.compaction,
            step: opts.compaction_step,
            keep: opts.compaction_keep,
            in_progress: None,
            snapshot_index: 0,
            snapshot_term: 0,
        };
        if let Some(snapshot) = snapshots.load()? {
            let (index, term) = (snapshot.index, snapshot.term);
            if index > state.get_applied_index() {
                info!("Restoring state machine from snapshot at {index}@{term}");
                state.restore(index, &snapshot.data)?;
            }
            if index > log.get_compacted().0 && !log.has(index, term)? {
                info!("Installing snapshot at {index}@{term} in log");
                log.install_snapshot(index, term)?;
            }
            (compaction.snapshot_index, compaction.snapshot_term) = (index, term);
        }

        let applied_index = state.get_applied_index();
        let (compacted_index, _) = log.get_compacted();
        if applied_index < compacted_index {
            return Err(Error::LogInconsistency(format!(
                "applied index {applied_index} below compacted index {compacted_index}"
            )));
        }
        // The commit index isn't fsynced, but the applied state implies it.
        if applied_index > log.get_commit_index().0 {
            log.commit(applied_index)?;
        }

        let (term, voted_for) = log.get_term();
        let role = Follower::new(None, voted_for, 0);
        let mut node = Self {
            id,
            peers,
            term,
            log,
            state,
            snapshots,
            node_tx,
            job_tx,
            opts,
            compaction,
            released: BTreeMap::new(),
            polls: Vec::new(),
            role,
        };
        node.role.election_timeout = node.gen_election_timeout();

        // Replay committed entries after the snapshot.
        node.maybe_apply()?;
        Ok(node)
    }

    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();

        if let Some(leader) = self.role.leader {
            assert_ne!(leader, self.id, "can't follow self");
            assert!(self.peers.contains(&leader), "leader not in peers");
            assert_ne!(self.term, 0, "followers with leaders can't have term 0");
        } else {
            assert!(self.role.forwarded.is_empty(), "leaderless follower has forwarded requests");
        }

        // NB: We allow voted_for not in peers, since this can happen when
        // removing nodes from the cluster via a cold restart. We also allow
        // voted_for self, which can happen if we lose an election.

        debug_assert_eq!(self.role.voted_for, self.log.get_term().1, "vote does not match log");
        assert!(self.role.leader_seen < self.role.election_timeout, "election timeout passed");
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Abort any forwarded requests. These must be retried with new leader.
        self.abort_forwarded()?;

        // Apply any pending log entries, so that we're caught up if we win.
        self.maybe_apply()?;

        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into either a leaderless follower in a new
    /// term (e.g. if someone holds a new election) or a follower of a leader
    /// in the current term once someone wins the election.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        // Abort any forwarded requests. These must be retried with new leader.
        self.abort_forwarded()?;

        if let Some(leader) = leader {
            // We found a leader in the current term.
            assert_eq!(self.role.leader, None, "already have leader in term");
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Following leader {leader} in term {term}");
            self.role =
                Follower::new(Some(leader), self.role.voted_for, self.role.election_timeout);
        } else {
            // We found a new term, but we don't necessarily know who the leader
            // is yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.log.set_term(term, None)?;
            self.role = Follower::new(None, None, self.gen_election_timeout());
        }
        Ok(self)
    }

    /// Follows the sender if we don't have a leader in this term yet, and
    /// asserts that there is only one leader.
    fn follow(mut self, from: NodeID, term: Term) -> Result<Self> {
        match self.role.leader {
            Some(leader) => assert_eq!(from, leader, "multiple leaders in term"),
            None => self = self.into_follower(Some(from), term)?,
        }
        Ok(self)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is a Heartbeat or
        // Append from the leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_follower(None, msg.term)?.step(msg);
        }

        // Record when we last saw a message from the leader (if any).
        if self.is_leader(msg.from) {
            self.role.leader_seen = 0
        }

        match msg.message {
            // The leader will send periodic heartbeats. If we don't have a
            // leader in this term yet, follow it. If the commit_index advances,
            // apply state transitions.
            Message::Heartbeat { commit_index, commit_term, read_seq } => {
                self = self.follow(msg.from, msg.term)?;

                // Respond to the heartbeat.
                let (last_index, last_term) = self.log.get_last_index();
                self.send(
                    msg.from,
                    Message::HeartbeatResponse { last_index, last_term, read_seq },
                )?;

                // Advance commit index and apply entries.
                if commit_index > self.log.get_commit_index().0
                    && self.log.has(commit_index, commit_term)?
                {
                    self.log.commit(commit_index)?;
                    self.maybe_apply()?;
                }
            }

            // Replicate entries from the leader. If we don't have a leader in
            // this term yet, follow it.
            Message::Append { base_index, base_term, entries } => {
                self = self.follow(msg.from, msg.term)?;

                // Append the entries, if possible. The match index is the last
                // entry known to match the leader's log, which may be below
                // our last index if we have a stale tail.
                let reject = base_index > 0 && !self.log.has(base_index, base_term)?;
                let mut match_index = 0;
                if !reject {
                    match_index = base_index + entries.len() as Index;
                    self.log.splice(entries)?;
                }
                let (last_index, _) = self.log.get_last_index();
                self.send(msg.from, Message::AppendResponse { reject, match_index, last_index })?;
            }

            // The leader sends a snapshot when we need compacted entries.
            // Restore it, persist it, and reset our log prefix. Snapshots at or
            // below our commit index are already covered by our log.
            Message::InstallSnapshot { snapshot } => {
                self = self.follow(msg.from, msg.term)?;

                let (index, term) = (snapshot.index, snapshot.term);
                if index > self.log.get_commit_index().0 {
                    info!("Installing snapshot at {index}@{term} from leader {}", msg.from);
                    self.state.restore(index, &snapshot.data)?;
                    self.snapshots.save(&snapshot)?;
                    self.log.install_snapshot(index, term)?;
                    if index > self.compaction.snapshot_index {
                        self.compaction.snapshot_index = index;
                        self.compaction.snapshot_term = term;
                    }
                    self.maybe_poll()?;
                }
                let (last_index, _) = self.log.get_last_index();
                self.send(
                    msg.from,
                    Message::AppendResponse { reject: false, match_index: index, last_index },
                )?;
            }

            // A candidate in this term is requesting our vote.
            Message::Campaign { last_index, last_term } => {
                // Don't vote if we already voted for someone else in this term.
                if let Some(voted_for) = self.role.voted_for {
                    if msg.from != voted_for {
                        self.send(msg.from, Message::CampaignResponse { vote: false })?;
                        return Ok(self.into());
                    }
                }

                // Don't vote if our log is newer than the candidate's log.
                let (log_index, log_term) = self.log.get_last_index();
                if log_term > last_term || log_term == last_term && log_index > last_index {
                    self.send(msg.from, Message::CampaignResponse { vote: false })?;
                    return Ok(self.into());
                }

                // Grant the vote.
                info!("Voting for {} in term {} election", msg.from, self.term);
                self.send(msg.from, Message::CampaignResponse { vote: true })?;
                self.log.set_term(self.term, Some(msg.from))?;
                self.role.voted_for = Some(msg.from);
            }

            // We may receive a vote after we lost an election and followed a
            // different leader. Ignore it.
            Message::CampaignResponse { .. } => {}

            // Answer local requests ourselves.
            Message::ClientRequest { id, request } if request.is_local() => {
                self.step_local(msg.from, id, request)?
            }

            // Forward leader requests to the leader, or reject them if there
            // is none (the client must retry).
            Message::ClientRequest { id, request } => {
                assert_eq!(msg.from, self.id, "client request from other node");

                if let Some(leader) = self.role.leader {
                    debug!("Forwarding request {id:x?} to leader {leader}");
                    self.role.forwarded.insert(id.clone());
                    self.send(leader, Message::ClientRequest { id, request })?
                } else {
                    self.send(
                        msg.from,
                        Message::ClientResponse { id, response: Err(Error::NotLeader) },
                    )?
                }
            }

            // Returns client responses for forwarded requests. Unknown
            // responses belong to requests that were already aborted.
            Message::ClientResponse { id, response } => {
                assert!(self.is_leader(msg.from), "client response from non-leader");

                if self.role.forwarded.remove(&id) {
                    self.send(self.id, Message::ClientResponse { id, response })?;
                }
            }

            // We're not a leader nor candidate in this term, so we shoudn't see these.
            Message::HeartbeatResponse { .. } | Message::AppendResponse { .. } => {
                panic!("received unexpected message {msg:?}")
            }
        };
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();
        self.tick_polls()?;

        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }

    /// Aborts all forwarded requests.
    fn abort_forwarded(&mut self) -> Result<()> {
        // Sort the IDs for test determinism.
        for id in std::mem::take(&mut self.role.forwarded).into_iter().sorted() {
            debug!("Aborting forwarded request {id:x?}");
            self.send(self.id, Message::ClientResponse { id, response: Err(Error::Abort) })?;
        }
        Ok(())
    }

    /// Checks if an address is the current leader.
    fn is_leader(&self, from: NodeID) -> bool {
        self.role.leader == Some(from)
    }
}

/// Peer replication progress.
#[derive(Clone, Debug, PartialEq)]
struct Progress {
    /// The next index to replicate to the peer.
    next: Index,
    /// The last index where the peer's log is known to match the leader's.
    match_index: Index,
    /// The last read sequence number confirmed by the peer.
    read_seq: ReadSequence,
}

/// A pending client write request, covering a batch of consecutive entries.
#[derive(Clone, Debug, PartialEq)]
struct Write {
    /// The node which submitted the write.
    from: NodeID,
    /// The write request ID.
    id: RequestID,
    /// The index of the first entry in the batch.
    first: Index,
    /// The results of the entries applied so far.
    results: Vec<Result<Vec<u8>>>,
}

/// A pending client read request.
#[derive(Clone, Debug, PartialEq)]
struct Read {
    /// The sequence number of this read.
    seq: ReadSequence,
    /// The node which submitted the read.
    from: NodeID,
    /// The read request ID.
    id: RequestID,
    /// The read command.
    command: Vec<u8>,
    /// The commit index when the read was received. The read can't execute
    /// until this has been applied.
    commit_index: Index,
}

// A leader serves requests and replicates the log to followers.
#[derive(Clone, Debug, PartialEq)]
pub struct Leader {
    /// Peer replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Keeps track of pending write requests, keyed by the log index of their
    /// last entry. These are added when the batch is proposed and appended to
    /// the leader's log, and removed when its last command is applied to the
    /// state machine, sending the command results to the waiting client.
    ///
    /// If the leader loses leadership, all pending write requests are aborted
    /// by returning Error::Abort.
    writes: BTreeMap<Index, Write>,
    /// Keeps track of pending read requests. To guarantee linearizability, read
    /// requests are assigned a sequence number and registered here when
    /// received, but only executed once a quorum of nodes have confirmed the
    /// current leader by responding to heartbeats with the sequence number.
    ///
    /// If we lose leadership before the command is processed, all pending read
    /// requests are aborted by returning Error::Abort.
    reads: VecDeque<Read>,
    /// The read sequence number used for the last read. Incremented for every
    /// read command, and reset when we lose leadership (thus only valid for
    /// this term).
    read_seq: ReadSequence,
    /// Number of ticks since last periodic heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    /// Creates a new leader role.
    fn new(peers: HashSet<NodeID>, last_index: Index) -> Self {
        let next = last_index + 1;
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next, match_index: 0, read_seq: 0 }))
            .collect();
        Self {
            progress,
            writes: BTreeMap::new(),
            reads: VecDeque::new(),
            read_seq: 0,
            since_heartbeat: 0,
        }
    }
}

impl Role for Leader {
    fn kind(&self) -> RoleKind {
        RoleKind::Leader
    }

    fn progress(&self) -> BTreeMap<NodeID, Index> {
        self.progress.iter().map(|(id, p)| (*id, p.match_index)).collect()
    }
}

impl RawNode<Leader> {
    /// Asserts internal invariants.
    fn assert(&self) {
        self.assert_node();

        assert_ne!(self.term, 0, "leaders can't have term 0");
        debug_assert_eq!(Some(self.id), self.log.get_term().1, "log vote does not match self");
    }

    /// Transitions the leader into a follower. This can only happen if we
    /// discover a new term, so we become a leaderless follower. Subsequently
    /// stepping the received message may discover the leader, if there is one.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "can only become follower in later term");

        info!("Discovered new term {term}");

        // Cancel in-flight requests. The responses are sent in our old term.
        for write in
            std::mem::take(&mut self.role.writes).into_values().sorted_by_key(|w| w.id.clone())
        {
            self.send(
                write.from,
                Message::ClientResponse { id: write.id, response: Err(Error::Abort) },
            )?;
        }
        for read in std::mem::take(&mut self.role.reads).into_iter().sorted_by_key(|r| r.id.clone())
        {
            self.send(
                read.from,
                Message::ClientResponse { id: read.id, response: Err(Error::Abort) },
            )?;
        }

        self.term = term;
        self.log.set_term(term, None)?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, None, election_timeout)))
    }

    /// Returns a peer's progress.
    fn progress_mut(&mut self, peer: NodeID) -> &mut Progress {
        match self.role.progress.get_mut(&peer) {
            Some(progress) => progress,
            None => panic!("unknown peer {peer}"),
        }
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert();
        self.assert_step(&msg);

        // Drop messages from past terms.
        if msg.term < self.term {
            debug!("Dropping message from past term ({msg:?})");
            return Ok(self.into());
        }

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is a Heartbeat or
        // Append from the leader, stepping it will follow the leader.
        if msg.term > self.term {
            return self.into_follower(msg.term)?.step(msg);
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::Heartbeat { .. } | Message::Append { .. } | Message::InstallSnapshot { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term);
            }

            // A follower received one of our heartbeats and confirms that we
            // are its leader. If its log is incomplete, append entries. If the
            // peer's read sequence number increased, process any pending reads.
            Message::HeartbeatResponse { last_index, last_term, read_seq } => {
                assert!(read_seq <= self.role.read_seq, "future read sequence number");

                let progress = self.progress_mut(msg.from);
                if read_seq > progress.read_seq {
                    progress.read_seq = read_seq;
                    self.maybe_read()?;
                }

                if last_index < self.log.get_last_index().0
                    || !self.log.has(last_index, last_term)?
                {
                    self.send_log(msg.from)?;
                }
            }

            // A follower appended log entries (or installed a snapshot) we sent
            // it. Record its progress and attempt to commit new entries. If
            // it's still behind, keep sending.
            Message::AppendResponse { reject: false, match_index, last_index: _ } => {
                assert!(
                    match_index <= self.log.get_last_index().0,
                    "follower matched entries after last index"
                );

                let progress = self.progress_mut(msg.from);
                progress.next = progress.next.max(match_index + 1);
                if match_index > progress.match_index {
                    progress.match_index = match_index;
                    self.maybe_commit_and_apply()?;
                }
                if match_index < self.log.get_last_index().0 {
                    self.send_log(msg.from)?;
                }
            }

            // A follower rejected log entries we sent it, because it does not
            // have the base index in its log. Retry from an earlier base, using
            // the follower's last index to skip ahead, but never at or below
            // its known match index.
            Message::AppendResponse { reject: true, match_index: _, last_index } => {
                let progress = self.progress_mut(msg.from);
                progress.next =
                    (progress.next - 1).min(last_index + 1).max(progress.match_index + 1).max(1);
                self.send_log(msg.from)?;
            }

            // A client submitted a read command. To ensure linearizability, we
            // must confirm that we are still the leader by sending a heartbeat
            // with the read's sequence number and wait for confirmation from a
            // quorum before executing the read.
            Message::ClientRequest { id, request: Request::Read(command) } => {
                self.role.read_seq += 1;
                let (commit_index, _) = self.log.get_commit_index();
                self.role.reads.push_back(Read {
                    seq: self.role.read_seq,
                    from: msg.from,
                    id,
                    command,
                    commit_index,
                });
                if self.peers.is_empty() {
                    self.maybe_read()?;
                }
                self.heartbeat()?;
            }

            // A client submitted a batch of write commands. Propose them, and
            // track the batch until it's applied and the response is returned
            // to the client.
            Message::ClientRequest { id, request: Request::Write(commands) } => {
                let indexes = self.propose(commands.into_iter().map(Some).collect())?;
                match (indexes.first(), indexes.last()) {
                    (Some(&first), Some(&last)) => {
                        let write = Write { from: msg.from, id, first, results: Vec::new() };
                        self.role.writes.insert(last, write);
                    }
                    _ => {
                        let response = Ok(Response::Write(Vec::new()));
                        self.send(msg.from, Message::ClientResponse { id, response })?;
                    }
                }
                if self.peers.is_empty() {
                    self.maybe_commit_and_apply()?;
                }
            }

            // A client submitted commands without waiting for them to apply.
            // Respond with their indexes once they're in our log.
            Message::ClientRequest { id, request: Request::Append(commands) } => {
                let indexes = self.propose(commands.into_iter().map(Some).collect())?;
                let response = Ok(Response::Append(indexes));
                self.send(msg.from, Message::ClientResponse { id, response })?;
                if self.peers.is_empty() {
                    self.maybe_commit_and_apply()?;
                }
            }

            Message::ClientRequest { id, request } => self.step_local(msg.from, id, request)?,

            // Don't grant other votes in this term.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?
            }

            // Votes can come in after we won the election, ignore them.
            Message::CampaignResponse { .. } => {}

            // Leaders never proxy client requests, so we don't expect to see
            // responses from other nodes.
            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }

        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.assert();
        self.tick_polls()?;

        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Broadcasts a heartbeat to all peers.
    fn heartbeat(&mut self) -> Result<()> {
        let (commit_index, commit_term) = self.log.get_commit_index();
        let read_seq = self.role.read_seq;
        self.broadcast(Message::Heartbeat { commit_index, commit_term, read_seq })?;
        // NB: We don't reset self.since_heartbeat here, because we want to send
        // periodic heartbeats regardless of any on-demand heartbeats.
        Ok(())
    }

    /// Proposes commands for consensus by appending them to our log at
    /// consecutive indexes and replicating them to peers. If successful, they
    /// will eventually be committed and applied to the state machine. Returns
    /// the log indexes of the commands.
    fn propose(&mut self, commands: Vec<Option<Vec<u8>>>) -> Result<Vec<Index>> {
        let indexes: Vec<Index> =
            commands.into_iter().map(|command| self.log.append(command)).collect::<Result<_>>()?;
        for peer in self.peers.iter().copied().sorted() {
            self.send_log(peer)?;
        }
        Ok(indexes)
    }

    /// Commits any new log entries that have been replicated to a quorum, and
    /// applies them to the state machine.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // Determine the new commit index.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.get_last_index().0))
                .collect(),
        );

        // If the commit index doesn't advance, do nothing. We don't assert on
        // this, since the quorum value may regress e.g. following a restart or
        // leader change where followers are initialized with match index 0.
        let mut commit_index = self.log.get_commit_index().0;
        if quorum_index <= commit_index {
            return Ok(commit_index);
        }

        // We can only safely commit an entry from our own term (see figure 8 in
        // Raft paper).
        commit_index = match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term => quorum_index,
            Some(_) => return Ok(commit_index),
            None => panic!("commit index {quorum_index} missing"),
        };

        // Commit the new entries.
        self.log.commit(commit_index)?;

        // Apply entries and respond to client writers once their whole batch
        // has been applied.
        let mut done = Vec::new();
        let writes = &mut self.role.writes;
        Self::maybe_apply_with(&mut self.log, self.state.as_mut(), |index, result| {
            let Some((&last, write)) = writes.range_mut(index..).next() else {
                return Ok(());
            };
            if index < write.first {
                return Ok(());
            }
            write.results.push(result);
            if index == last {
                done.extend(writes.remove(&last));
            }
            Ok(())
        })?;
        for write in done {
            let response = write.results.into_iter().collect::<Result<_>>().map(Response::Write);
            self.send(write.from, Message::ClientResponse { id: write.id, response })?;
        }

        self.maybe_read()?;
        self.applied()?;
        Ok(commit_index)
    }

    /// Executes any pending read requests that are now ready after quorum
    /// confirmation of their sequence number. Reads are only served once we've
    /// committed an entry in our own term, since the commit index may not
    /// include all entries committed by previous leaders until then.
    fn maybe_read(&mut self) -> Result<()> {
        if self.role.reads.is_empty() {
            return Ok(());
        }
        if self.log.get_commit_index().1 < self.term {
            return Ok(());
        }

        // Determine the maximum read sequence confirmed by quorum.
        let read_seq = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.read_seq)
                .chain(std::iter::once(self.role.read_seq))
                .collect(),
        );
        let applied_index = self.state.get_applied_index();

        // Execute the ready reads.
        while let Some(read) = self.role.reads.pop_front() {
            if read.seq > read_seq || read.commit_index > applied_index {
                self.role.reads.push_front(read);
                break;
            }
            let result = self.state.read(read.command);
            self.send(
                read.from,
                Message::ClientResponse { id: read.id, response: result.map(Response::Read) },
            )?;
        }

        Ok(())
    }

    /// Sends pending log entries to a peer, at most max_append_entries at a
    /// time. If the peer needs entries that were removed by compaction, the
    /// latest snapshot is sent instead.
    fn send_log(&mut self, peer: NodeID) -> Result<()> {
        let next = self.progress_mut(peer).next;
        let base_index = next - 1;
        let (compacted_index, compacted_term) = self.log.get_compacted();

        if base_index < compacted_index {
            let Some(snapshot) = self.snapshots.load()? else {
                return Err(Error::LogInconsistency(format!(
                    "no snapshot for log compacted through {compacted_index}"
                )));
            };
            info!("Sending snapshot at {}@{} to {peer}", snapshot.index, snapshot.term);
            self.progress_mut(peer).next = snapshot.index + 1;
            return self.send(peer, Message::InstallSnapshot { snapshot });
        }

        let base_term = match base_index {
            0 => 0,
            index if index == compacted_index => compacted_term,
            index => match self.log.get(index)? {
                Some(entry) => entry.term,
                None => panic!("missing base entry {index}"),
            },
        };

        let entries: Vec<_> = self
            .log
            .scan(next..)
            .take(self.opts.max_append_entries)
            .collect::<Result<_>>()?;
        debug!("Replicating {} entries at base {base_index} to {peer}", entries.len());
        self.send(peer, Message::Append { base_index, base_term, entries })
    }
}

/// Returns the size of a quorum (strict majority), given a total size.
fn quorum_size(size: u8) -> u8 {
    size / 2 + 1
}

/// Returns the quorum (median) value of the given unsorted slice, in descending
/// order. The slice cannot be empty.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    assert!(!values.is_empty(), "no values provided");
    let index = quorum_size(values.len() as u8) as usize - 1;
    *values.select_nth_unstable_by(index, |a, b: &T| a.cmp(b).reverse()).1
}
