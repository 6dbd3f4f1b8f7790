#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::unneeded_field_pattern)]

pub mod agency;
pub mod client;
pub mod encoding;
pub mod error;
pub mod raft;
pub mod server;
pub mod storage;

pub use agency::Agency;
pub use client::Client;
pub use error::{Error, Result};
pub use server::Server;
