use agency::error::{Error, Result};
use agency::raft::{self, NodeID, RoleKind};
use agency::{storage, Agency, Client, Server};

use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The client request timeout used in tests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The long-poll timeout used in tests.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// The maximum time to wait for a leader to be elected.
const ELECTION_WAIT: Duration = Duration::from_secs(10);

/// A node in a test cluster.
pub struct TestNode {
    pub agency: Agency,
    pub client_addr: SocketAddr,
}

/// A local test cluster, with nodes communicating over TCP on localhost. Node
/// threads run until the test process exits.
pub struct TestCluster {
    pub nodes: BTreeMap<NodeID, TestNode>,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    /// Starts a cluster with the given number of nodes and options, using
    /// BitCask storage in a temporary directory.
    pub fn run(size: u8, opts: raft::Options) -> Result<Self> {
        Self::start(size, opts, false)
    }

    /// Starts a single-node cluster with in-memory storage.
    pub fn single(opts: raft::Options) -> Result<Self> {
        Self::start(1, opts, true)
    }

    fn start(size: u8, opts: raft::Options, memory: bool) -> Result<Self> {
        let dir = tempfile::tempdir()?;

        // Bind all listeners up front, to learn the peer addresses.
        let mut listeners = BTreeMap::new();
        for id in 1..=size {
            let raft_listener = TcpListener::bind("127.0.0.1:0")?;
            let client_listener = TcpListener::bind("127.0.0.1:0")?;
            listeners.insert(id, (raft_listener, client_listener));
        }
        let raft_addrs: HashMap<NodeID, String> = listeners
            .iter()
            .map(|(id, (raft, _))| Ok((*id, raft.local_addr()?.to_string())))
            .collect::<Result<_>>()?;

        let mut nodes = BTreeMap::new();
        for (id, (raft_listener, client_listener)) in listeners {
            let path = dir.path().join(format!("agency{id}"));
            let (engine, snapshots): (Box<dyn storage::Engine>, Arc<dyn raft::SnapshotStore>) =
                match memory {
                    true => (Box::new(storage::Memory::new()), Arc::new(raft::MemorySnapshots::new())),
                    false => (
                        Box::new(storage::BitCask::new(path.join("log"))?),
                        Arc::new(raft::FileSnapshots::new(path.join("snapshots"))?),
                    ),
                };
            let log = raft::Log::new(engine)?;
            let peers = raft_addrs.iter().filter(|(p, _)| **p != id).map(|(p, a)| (*p, a.clone()));
            let server = Server::new(id, peers.collect(), log, snapshots, opts.clone())?
                .with_timeouts(REQUEST_TIMEOUT, POLL_TIMEOUT);
            let node = TestNode { agency: server.agency(), client_addr: client_listener.local_addr()? };
            std::thread::spawn(move || server.serve(raft_listener, client_listener));
            nodes.insert(id, node);
        }
        Ok(Self { nodes, _dir: dir })
    }

    /// Returns a node's in-process Agency handle.
    pub fn agency(&self, id: NodeID) -> &Agency {
        &self.nodes[&id].agency
    }

    /// Connects a TCP client to a node.
    pub fn connect(&self, id: NodeID) -> Result<Client> {
        Client::connect(self.nodes[&id].client_addr)
    }

    /// Waits for a leader to be elected and known by all nodes, returning it.
    pub fn leader(&self) -> Result<NodeID> {
        let deadline = Instant::now() + ELECTION_WAIT;
        while Instant::now() < deadline {
            let mut leaders = Vec::new();
            for (id, node) in &self.nodes {
                let status = node.agency.status()?.raft;
                match status.role {
                    RoleKind::Leader => leaders.push(*id),
                    _ => leaders.extend(status.leader),
                }
            }
            leaders.sort();
            leaders.dedup();
            if leaders.len() == 1 && self.all_know(leaders[0])? {
                return Ok(leaders[0]);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(Error::Timeout)
    }

    /// Returns true if all nodes know the given leader.
    fn all_know(&self, leader: NodeID) -> Result<bool> {
        for (id, node) in &self.nodes {
            let status = node.agency.status()?.raft;
            if *id != leader && status.leader != Some(leader) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Waits until all nodes have applied at least the given index.
    pub fn wait_applied(&self, index: raft::Index) -> Result<()> {
        let deadline = Instant::now() + ELECTION_WAIT;
        for node in self.nodes.values() {
            while node.agency.status()?.raft.applied_index < index {
                if Instant::now() > deadline {
                    return Err(Error::Timeout);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        Ok(())
    }
}

/// Raft options for tests, with automatic compaction disabled.
pub fn opts() -> raft::Options {
    raft::Options { compaction: false, ..raft::Options::default() }
}
