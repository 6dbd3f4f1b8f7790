use crate::agency::{
    Entries, Path, Request, Response, Session, Status, Transaction, Value, WriteResult,
};
use crate::encoding::Value as _;
use crate::errdata;
use crate::error::Result;
use crate::raft::{Compaction, Index};

use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpStream, ToSocketAddrs};

/// An Agency client, connected to a single node over TCP. The node forwards
/// reads and writes to the current leader. Log scans, status and compaction
/// requests are answered by the connected node itself.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// Connects to an Agency node's client address.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr)?;
        let reader = BufReader::new(socket.try_clone()?);
        let writer = BufWriter::new(socket);
        Ok(Self { reader, writer })
    }

    /// Sends a request and waits for the response.
    fn call(&mut self, request: Request) -> Result<Response> {
        request.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        Result::decode_from(&mut self.reader)?
    }

    /// Writes a batch of transactions, see `Agency::write`.
    pub fn write(&mut self, transactions: Vec<Transaction>, wait_for_sync: bool) -> Result<WriteResult> {
        match self.call(Request::Write { transactions, wait_for_sync })? {
            Response::Write(result) => Ok(result),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Reads the values at the given paths.
    pub fn read(&mut self, paths: Vec<Path>) -> Result<Vec<Option<Value>>> {
        match self.call(Request::Read { paths })? {
            Response::Read(values) => Ok(values),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches the sessions of the given clients.
    pub fn inquire(&mut self, client_ids: Vec<String>) -> Result<Vec<Option<Session>>> {
        match self.call(Request::Inquire { client_ids })? {
            Response::Inquire(sessions) => Ok(sessions),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches the entire document tree.
    pub fn dump(&mut self) -> Result<Value> {
        match self.call(Request::Dump)? {
            Response::Dump(value) => Ok(value),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches the node status.
    pub fn status(&mut self) -> Result<Status> {
        match self.call(Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Executes a log scan.
    fn scan(&mut self, request: Request) -> Result<Entries> {
        match self.call(request)? {
            Response::Entries(entries) => Ok(entries),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    pub fn head(&mut self, limit: u64) -> Result<Entries> {
        self.scan(Request::Head { limit })
    }

    pub fn tail(&mut self, limit: u64) -> Result<Entries> {
        self.scan(Request::Tail { limit })
    }

    pub fn slice(&mut self, start: Index, stop: Index) -> Result<Entries> {
        self.scan(Request::Slice { start, stop })
    }

    pub fn poll(&mut self, first: Index, limit: u64) -> Result<Entries> {
        self.scan(Request::Poll { first, limit })
    }

    pub fn at(&mut self, index: Index) -> Result<Entries> {
        self.scan(Request::At { index })
    }

    /// Sends a release hint for the observer.
    pub fn release(&mut self, observer: &str, index: Index) -> Result<()> {
        match self.call(Request::Release { observer: observer.to_string(), index })? {
            Response::Release => Ok(()),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Enables or disables automatic compaction on the node.
    pub fn set_compaction(&mut self, enabled: bool) -> Result<Compaction> {
        match self.call(Request::SetCompaction { enabled })? {
            Response::Compaction(compaction) => Ok(compaction),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Takes a snapshot on the node, returning its index.
    pub fn compact(&mut self) -> Result<Index> {
        match self.call(Request::Compact)? {
            Response::Compact(index) => Ok(index),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}
