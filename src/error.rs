use serde::{Deserialize, Serialize};

/// Agency errors. All except IO errors are propagated to clients, so they
/// must be serializable and cloneable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted because the leader changed while it was in
    /// flight. Its outcome is unknown, and it must be retried with the same
    /// client ID and sequence number.
    Abort,
    /// There is no known leader to serve the request, e.g. during an
    /// election. The request was not submitted and can be retried.
    NotLeader,
    /// The client gave up waiting for a response. The outcome is unknown, and
    /// the request must be retried with the same client ID and sequence number.
    Timeout,
    /// A transaction precondition did not hold at the given path.
    PreconditionFailed(String),
    /// The log is internally inconsistent, e.g. an index gap or a corrupt
    /// record. The node must halt and resync from a healthy peer.
    LogInconsistency(String),
    /// A snapshot is already being taken.
    CompactionInProgress,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically bad paths or operands.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::NotLeader => write!(f, "no known leader"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::PreconditionFailed(path) => write!(f, "precondition failed at {path}"),
            Error::LogInconsistency(msg) => write!(f, "log inconsistency: {msg}"),
            Error::CompactionInProgress => write!(f, "compaction already in progress"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl Error {
    /// Returns whether the error is considered deterministic. Raft state
    /// machine application needs to know whether a command failure is
    /// deterministic on the input command -- if it is, the command can be
    /// considered applied and the error returned to the client, but otherwise
    /// the state machine must panic to prevent replica divergence.
    pub fn is_deterministic(&self) -> bool {
        match self {
            // Aborts and timeouts don't happen during apply.
            Error::Abort | Error::NotLeader | Error::Timeout => true,
            Error::PreconditionFailed(_) => true,
            Error::CompactionInProgress => true,
            Error::InvalidData(_) | Error::InvalidInput(_) => true,
            // Storage corruption is local to the node.
            Error::LogInconsistency(_) => false,
            Error::IO(_) => false,
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An Agency Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(err: crossbeam::channel::RecvTimeoutError) -> Self {
        match err {
            crossbeam::channel::RecvTimeoutError::Timeout => Error::Timeout,
            crossbeam::channel::RecvTimeoutError::Disconnected => Error::IO(err.to_string()),
        }
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::TrySendError<T>> for Error {
    fn from(err: crossbeam::channel::TrySendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
