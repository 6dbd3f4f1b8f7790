//! Key/value storage engines for the Raft log.
//!
//! * `BitCask`: a durable log-structured engine with checksummed records.
//! * `Memory`: an in-memory B-tree, for tests and ephemeral nodes.

mod bitcask;
pub mod engine;
mod memory;

pub use bitcask::BitCask;
pub use engine::{Engine, ScanIterator, Status};
pub use memory::Memory;
