//! The Agency server. Takes configuration from a config file (default
//! config/agency.yaml) or corresponding AGENCY_ environment variables.

#![warn(clippy::all)]

use agency::errinput;
use agency::error::Result;
use agency::raft::{self, NodeID};
use agency::storage;
use agency::Server;

use clap::Parser as _;
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

/// The Agency server configuration.
#[derive(Debug, Deserialize)]
struct Config {
    id: NodeID,
    peers: HashMap<String, String>,
    listen_raft: String,
    listen_client: String,
    log_level: String,
    data_dir: String,
    storage: String,
    compact_threshold: f64,
    compact_min_bytes: u64,
    compaction: bool,
    compaction_step: u64,
    compaction_keep: u64,
    request_timeout_ms: u64,
    poll_timeout_ms: u64,
}

impl Config {
    /// Loads the configuration from the given file, if it exists, and
    /// environment variables prefixed with AGENCY_.
    fn load(file: &str) -> Result<Self> {
        let defaults = raft::Options::default();
        Ok(config::Config::builder()
            .set_default("id", 1)?
            .set_default("listen_raft", "0.0.0.0:9701")?
            .set_default("listen_client", "0.0.0.0:9601")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("storage", "bitcask")?
            .set_default("compact_threshold", 0.2)?
            .set_default("compact_min_bytes", 1_000_000)?
            .set_default("compaction", defaults.compaction)?
            .set_default("compaction_step", defaults.compaction_step)?
            .set_default("compaction_keep", defaults.compaction_keep)?
            .set_default("request_timeout_ms", 5000)?
            .set_default("poll_timeout_ms", 5000)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("AGENCY"))
            .build()?
            .try_deserialize()?)
    }

    /// Parses the peer map, keyed by node ID.
    fn peers(&self) -> Result<HashMap<NodeID, String>> {
        let mut peers = HashMap::new();
        for (id, addr) in &self.peers {
            let id = id.parse::<NodeID>()?;
            if id == self.id {
                return errinput!("node {id} can't be its own peer");
            }
            peers.insert(id, addr.clone());
        }
        Ok(peers)
    }
}

/// The Agency server command.
#[derive(clap::Parser)]
#[command(about = "Starts an Agency server.", version, propagate_version = true)]
struct Command {
    /// The configuration file path.
    #[arg(short = 'c', long, default_value = "config/agency.yaml")]
    config: String,
}

impl Command {
    /// Runs the Agency server.
    fn run(self) -> Result<()> {
        let cfg = Config::load(&self.config)?;

        // Initialize logging.
        let loglevel = cfg.log_level.parse()?;
        let mut logconfig = simplelog::ConfigBuilder::new();
        if loglevel != simplelog::LevelFilter::Debug {
            logconfig.add_filter_allow_str("agency");
        }
        simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

        // Initialize the Raft log storage engine and snapshot store.
        let path = Path::new(&cfg.data_dir);
        let (engine, snapshots): (Box<dyn storage::Engine>, Arc<dyn raft::SnapshotStore>) =
            match cfg.storage.as_str() {
                "bitcask" => {
                    let engine = storage::BitCask::new_compact(
                        path.join("log"),
                        cfg.compact_threshold,
                        cfg.compact_min_bytes,
                    )?;
                    let snapshots = raft::FileSnapshots::new(path.join("snapshots"))?;
                    (Box::new(engine), Arc::new(snapshots))
                }
                "memory" => (Box::new(storage::Memory::new()), Arc::new(raft::MemorySnapshots::new())),
                name => return errinput!("invalid storage engine {name}"),
            };
        let log = raft::Log::new(engine)?;
        info!("Opened {} storage in {}", cfg.storage, cfg.data_dir);

        let opts = raft::Options {
            compaction: cfg.compaction,
            compaction_step: cfg.compaction_step,
            compaction_keep: cfg.compaction_keep,
            ..raft::Options::default()
        };
        let server = Server::new(cfg.id, cfg.peers()?, log, snapshots, opts)?.with_timeouts(
            Duration::from_millis(cfg.request_timeout_ms),
            Duration::from_millis(cfg.poll_timeout_ms),
        );

        let raft_listener = std::net::TcpListener::bind(&cfg.listen_raft)?;
        let client_listener = std::net::TcpListener::bind(&cfg.listen_client)?;
        server.serve(raft_listener, client_listener)
    }
}
