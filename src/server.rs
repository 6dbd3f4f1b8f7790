use crate::agency::{self, Agency, Request, Submission};
use crate::encoding::Value as _;
use crate::errdata;
use crate::error::Result;
use crate::raft::{self, Envelope, Message, NodeID};

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The outbound message buffer size per peer. Messages are dropped when the
/// buffer is full, and Raft recovers by retrying.
const PEER_BUFFER: usize = 1000;

/// The interval between peer reconnection attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// An Agency server. Runs a Raft node with the Agency state machine, and
/// serves Raft peers and Agency clients over TCP.
///
/// The node is owned by a single event loop thread, which processes ticks,
/// peer messages, client requests and compactor results serially. Peer
/// connections, client sessions and the compactor run on separate threads,
/// and communicate with the event loop via channels.
pub struct Server {
    node: raft::Node,
    peers: HashMap<NodeID, String>,
    node_rx: Receiver<Envelope>,
    job_rx: Receiver<raft::Job>,
    compactor: raft::Compactor,
    request_tx: Sender<Submission>,
    request_rx: Receiver<Submission>,
    timeout: Duration,
    poll_timeout: Duration,
}

impl Server {
    /// Creates a new server. The peers map contains the Raft addresses of the
    /// other nodes in the cluster. The latest snapshot is restored, and the
    /// committed log is applied.
    pub fn new(
        id: NodeID,
        peers: HashMap<NodeID, String>,
        log: raft::Log,
        snapshots: Arc<dyn raft::SnapshotStore>,
        opts: raft::Options,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (job_tx, job_rx) = crossbeam::channel::unbounded();
        let (request_tx, request_rx) = crossbeam::channel::unbounded();
        let node = raft::Node::new(
            id,
            peers.keys().copied().collect(),
            log,
            Box::new(agency::State::new()),
            snapshots.clone(),
            node_tx,
            job_tx,
            opts,
        )?;
        Ok(Self {
            node,
            peers,
            node_rx,
            job_rx,
            compactor: raft::Compactor::new(snapshots),
            request_tx,
            request_rx,
            timeout: agency::REQUEST_TIMEOUT,
            poll_timeout: agency::POLL_TIMEOUT,
        })
    }

    /// Sets the client request and long-poll timeouts.
    pub fn with_timeouts(mut self, timeout: Duration, poll_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.poll_timeout = poll_timeout;
        self
    }

    /// Returns an in-process Agency handle for the node. Requests are only
    /// processed once the server is serving.
    pub fn agency(&self) -> Agency {
        Agency::new(self.request_tx.clone(), self.timeout, self.poll_timeout)
    }

    /// Serves Raft peers and Agency clients on the given listeners. Only
    /// returns if the node halts on a fatal error.
    pub fn serve(self, raft_listener: TcpListener, client_listener: TcpListener) -> Result<()> {
        let raft_addr = raft_listener.local_addr()?;
        let client_addr = client_listener.local_addr()?;
        info!("Node {} serving Raft on {raft_addr} and clients on {client_addr}", self.node.id());

        let (tcp_in_tx, tcp_in_rx) = crossbeam::channel::unbounded();
        let (tcp_out_tx, tcp_out_rx) = crossbeam::channel::unbounded();
        let (done_tx, done_rx) = crossbeam::channel::unbounded();
        let agency = self.agency();
        // Clients give up on requests after this, polls being the longest.
        let max_wait = self.timeout + self.poll_timeout;
        let Self { node, peers, node_rx, job_rx, compactor, request_rx, .. } = self;

        std::thread::spawn(move || Self::tcp_receive(raft_listener, tcp_in_tx));
        std::thread::spawn(move || Self::tcp_send(peers, tcp_out_rx));
        std::thread::spawn(move || Self::serve_clients(client_listener, agency));
        std::thread::spawn(move || {
            if let Err(err) = compactor.run(job_rx, done_tx) {
                error!("Compactor failed: {err}");
            }
        });

        let result =
            Self::eventloop(node, node_rx, request_rx, tcp_in_rx, tcp_out_tx, done_rx, max_wait);
        if let Err(err) = &result {
            error!("Node halted: {err}");
        }
        result
    }

    /// Runs the node event loop. Pending client requests are dropped after
    /// max_wait, by which time the client has given up on them.
    fn eventloop(
        mut node: raft::Node,
        node_rx: Receiver<Envelope>,
        request_rx: Receiver<Submission>,
        tcp_rx: Receiver<Envelope>,
        tcp_tx: Sender<Envelope>,
        done_rx: Receiver<raft::Done>,
        max_wait: Duration,
    ) -> Result<()> {
        let ticker = crossbeam::channel::tick(raft::TICK_INTERVAL);
        let mut requests = PendingRequests::new(max_wait);
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    node = node.tick()?;
                    requests.expire(Instant::now());
                }

                recv(tcp_rx) -> msg => node = node.step(msg?)?,

                recv(done_rx) -> done => node = node.compacted(done?)?,

                // Responses to local clients are addressed to the node itself.
                recv(node_rx) -> msg => {
                    let msg = msg?;
                    if msg.to != node.id() {
                        tcp_tx.send(msg)?;
                        continue;
                    }
                    match msg.message {
                        // The client may have timed out and gone away.
                        Message::ClientResponse { id, response } => requests.respond(&id, response),
                        message => return errdata!("unexpected local message {message:?}"),
                    }
                }

                recv(request_rx) -> submission => {
                    let (request, response_tx) = submission?;
                    let id = Uuid::new_v4().as_bytes().to_vec();
                    requests.insert(id.clone(), response_tx, Instant::now());
                    let (node_id, term) = (node.id(), node.term());
                    node = node.step(Envelope {
                        from: node_id,
                        to: node_id,
                        term,
                        message: Message::ClientRequest { id, request },
                    })?;
                }
            }
        }
    }

    /// Receives inbound messages from peers via TCP.
    fn tcp_receive(listener: TcpListener, in_tx: Sender<Envelope>) {
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Raft peer connection failed: {err}");
                    continue;
                }
            };
            let in_tx = in_tx.clone();
            s.spawn(move || {
                debug!("Raft peer {peer} connected");
                match Self::tcp_receive_peer(socket, in_tx) {
                    Ok(()) => debug!("Raft peer {peer} disconnected"),
                    Err(err) => error!("Raft peer {peer} error: {err}"),
                }
            });
        });
    }

    /// Receives inbound messages from a peer via TCP.
    fn tcp_receive_peer(socket: TcpStream, in_tx: Sender<Envelope>) -> Result<()> {
        let mut socket = BufReader::new(socket);
        while let Some(message) = Envelope::maybe_decode_from(&mut socket)? {
            in_tx.send(message)?;
        }
        Ok(())
    }

    /// Sends outbound messages to peers via TCP.
    fn tcp_send(peers: HashMap<NodeID, String>, out_rx: Receiver<Envelope>) {
        std::thread::scope(move |s| {
            let mut peer_txs: HashMap<NodeID, Sender<Envelope>> = HashMap::new();
            for (id, addr) in peers {
                let (tx, rx) = crossbeam::channel::bounded::<Envelope>(PEER_BUFFER);
                peer_txs.insert(id, tx);
                s.spawn(move || Self::tcp_send_peer(addr, rx));
            }

            while let Ok(message) = out_rx.recv() {
                let Some(tx) = peer_txs.get(&message.to) else {
                    error!("Outbound message for unknown peer {}", message.to);
                    continue;
                };
                if tx.try_send(message).is_err() {
                    error!("Full send buffer for peer, discarding message");
                }
            }
        });
    }

    /// Sends outbound messages to a peer, continuously reconnecting.
    fn tcp_send_peer(addr: String, out_rx: Receiver<Envelope>) {
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("Connected to Raft peer {addr}");
                    match Self::tcp_send_peer_session(socket, &out_rx) {
                        Ok(()) => break,
                        Err(err) => error!("Failed sending to Raft peer {addr}: {err}"),
                    }
                }
                Err(err) => error!("Failed connecting to Raft peer {addr}: {err}"),
            }
            std::thread::sleep(RECONNECT_INTERVAL);
        }
        debug!("Disconnected from Raft peer {addr}");
    }

    /// Sends outbound messages to a peer via a TCP session. Buffered messages
    /// are flushed once the outbound queue is drained.
    fn tcp_send_peer_session(socket: TcpStream, out_rx: &Receiver<Envelope>) -> Result<()> {
        let mut socket = BufWriter::new(socket);
        while let Ok(message) = out_rx.recv() {
            message.encode_into(&mut socket)?;
            while let Ok(message) = out_rx.try_recv() {
                message.encode_into(&mut socket)?;
            }
            socket.flush()?;
        }
        Ok(())
    }

    /// Serves Agency clients via TCP, with a thread per session.
    fn serve_clients(listener: TcpListener, agency: Agency) {
        std::thread::scope(|s| loop {
            let (socket, peer) = match listener.accept() {
                Ok(r) => r,
                Err(err) => {
                    error!("Client connection failed: {err}");
                    continue;
                }
            };
            let agency = agency.clone();
            s.spawn(move || {
                debug!("Client {peer} connected");
                match Self::client_session(socket, agency) {
                    Ok(()) => debug!("Client {peer} disconnected"),
                    Err(err) => error!("Client {peer} error: {err}"),
                }
            });
        });
    }

    /// Processes client requests until the client disconnects. Each request
    /// is answered with an encoded Result<Response>.
    fn client_session(socket: TcpStream, agency: Agency) -> Result<()> {
        let mut reader = BufReader::new(socket.try_clone()?);
        let mut writer = BufWriter::new(socket);
        while let Some(request) = Request::maybe_decode_from(&mut reader)? {
            debug!("Received client request {request:?}");
            let response = agency.handle(request);
            response.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }
}

/// Client requests awaiting a response from the node, with their submission
/// times.
struct PendingRequests {
    requests: HashMap<raft::RequestID, (Instant, Sender<Result<raft::Response>>)>,
    max_wait: Duration,
}

impl PendingRequests {
    fn new(max_wait: Duration) -> Self {
        Self { requests: HashMap::new(), max_wait }
    }

    fn insert(
        &mut self,
        id: raft::RequestID,
        response_tx: Sender<Result<raft::Response>>,
        now: Instant,
    ) {
        self.requests.insert(id, (now, response_tx));
    }

    /// Sends a response to the waiting client, if it's still pending. The
    /// client may have timed out and gone away.
    fn respond(&mut self, id: &raft::RequestID, response: Result<raft::Response>) {
        if let Some((_, response_tx)) = self.requests.remove(id) {
            response_tx.send(response).ok();
        }
    }

    /// Drops requests submitted more than max_wait before now.
    fn expire(&mut self, now: Instant) {
        let (before, max_wait) = (self.len(), self.max_wait);
        self.requests.retain(|_, (submitted, _)| now.duration_since(*submitted) <= max_wait);
        if self.len() < before {
            debug!("Dropped {} expired client requests", before - self.len());
        }
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}
