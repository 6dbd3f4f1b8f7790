//! agencyctl is a command-line client for the Agency. It connects to a node's
//! client address and executes a single command, printing the result.

#![warn(clippy::all)]

use agency::agency::{Entries, LogEntry, Path, Transaction, Value};
use agency::error::Result;
use agency::raft::Index;
use agency::Client;

use clap::Parser as _;
use itertools::Itertools as _;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

/// The agencyctl command.
#[derive(clap::Parser)]
#[command(about = "An Agency command-line client.", version, propagate_version = true)]
struct Command {
    /// Host to connect to.
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,
    /// Client port to connect to.
    #[arg(short = 'p', long, default_value = "9601")]
    port: u16,
    #[command(subcommand)]
    action: Action,
}

#[derive(clap::Subcommand)]
enum Action {
    /// Reads the values at the given paths, as JSON.
    Read { paths: Vec<Path> },
    /// Sets a path to a JSON value.
    Set {
        path: Path,
        value: String,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Deletes a path.
    Delete {
        path: Path,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Increments a numeric path.
    Increment {
        path: Path,
        #[arg(long, default_value = "1")]
        by: i64,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Appends a JSON value to an array path.
    Push {
        path: Path,
        value: String,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Displays node status.
    Status,
    /// Displays committed log entries. Defaults to the last 10.
    Log {
        /// Shows the first entries.
        #[arg(long, conflicts_with_all = ["tail", "from"])]
        head: Option<u64>,
        /// Shows the last entries.
        #[arg(long, conflicts_with = "from")]
        tail: Option<u64>,
        /// Shows entries starting at the index, waiting for one if needed.
        #[arg(long)]
        from: Option<Index>,
        /// The maximum number of entries to show with --from.
        #[arg(long, default_value = "10")]
        limit: u64,
    },
    /// Displays client sessions, with their recent outcomes.
    Inquire { client_ids: Vec<String> },
    /// Takes a snapshot and truncates the log.
    Compact,
}

/// Options shared by write commands.
#[derive(clap::Args)]
struct WriteArgs {
    /// Requires the path to equal this JSON value.
    #[arg(long = "if-equals", value_name = "JSON")]
    equals: Option<String>,
    /// Requires the path to be missing.
    #[arg(long = "if-missing", conflicts_with = "equals")]
    missing: bool,
    /// A client ID, for deduplicating retries. Requires --seq.
    #[arg(long, requires = "seq")]
    client: Option<String>,
    /// The client sequence number.
    #[arg(long, requires = "client")]
    seq: Option<u64>,
    /// Returns once the leader has appended the write, without waiting for
    /// it to be applied.
    #[arg(long)]
    no_wait: bool,
}

impl Command {
    /// Runs the command.
    fn run(self) -> Result<()> {
        let mut client = Client::connect((self.host.as_str(), self.port))?;
        match self.action {
            Action::Read { paths } => {
                for (path, value) in paths.iter().zip(client.read(paths.clone())?) {
                    println!("{path} {}", value.unwrap_or_default());
                }
            }
            Action::Set { path, value, write } => {
                let value = Value::from_json(&value)?;
                Self::write(&mut client, Transaction::new().set(&path, value), &path, write)?
            }
            Action::Delete { path, write } => {
                Self::write(&mut client, Transaction::new().delete(&path), &path, write)?
            }
            Action::Increment { path, by, write } => {
                Self::write(&mut client, Transaction::new().increment(&path, by), &path, write)?
            }
            Action::Push { path, value, write } => {
                let value = Value::from_json(&value)?;
                Self::write(&mut client, Transaction::new().push(&path, value), &path, write)?
            }
            Action::Status => {
                let status = client.status()?.raft;
                println!("Node:      {} ({})", status.id, status.role);
                println!("Term:      {}", status.term);
                println!("Leader:    {}", status.leader.map_or("none".into(), |l| l.to_string()));
                println!("Committed: {}", status.commit_index);
                println!("Applied:   {}", status.applied_index);
                println!("Log:       {}..={}", status.first_index, status.last_index);
                println!(
                    "Snapshot:  {} (compaction {})",
                    status.compaction.snapshot_index,
                    if status.compaction.enabled { "enabled" } else { "disabled" }
                );
                if !status.progress.is_empty() {
                    let mut progress = status.progress.iter().map(|(id, m)| format!("{id}:{m}"));
                    println!("Progress:  {}", progress.join(" "));
                }
                println!(
                    "Storage:   {} keys, {} MB garbage of {} MB ({})",
                    status.storage.keys,
                    status.storage.garbage_disk_size / 1024 / 1024,
                    status.storage.total_disk_size / 1024 / 1024,
                    status.storage.name,
                );
            }
            Action::Log { head, tail, from, limit } => {
                let entries = match (head, tail, from) {
                    (Some(head), _, _) => client.head(head)?,
                    (_, Some(tail), _) => client.tail(tail)?,
                    (_, _, Some(from)) => client.poll(from, limit)?,
                    (None, None, None) => client.tail(10)?,
                };
                Self::print_entries(entries);
            }
            Action::Inquire { client_ids } => {
                for (id, session) in client_ids.iter().zip(client.inquire(client_ids.clone())?) {
                    let Some(session) = session else {
                        println!("{id}: no session");
                        continue;
                    };
                    println!("{id}: seq {}", session.seq);
                    for (seq, outcome) in session.outcomes {
                        println!("  {seq}: {outcome:?}");
                    }
                }
            }
            Action::Compact => println!("Compacting at {}", client.compact()?),
        }
        Ok(())
    }

    /// Writes a transaction, with the preconditions and client tag given by
    /// the arguments.
    fn write(client: &mut Client, mut txn: Transaction, path: &Path, args: WriteArgs) -> Result<()> {
        if let Some(equals) = args.equals {
            txn = txn.equals(path, Value::from_json(&equals)?);
        }
        if args.missing {
            txn = txn.missing(path);
        }
        if let (Some(client_id), Some(seq)) = (args.client, args.seq) {
            txn = txn.client(client_id, seq);
        }
        for outcome in client.write(vec![txn], !args.no_wait)?.results {
            match outcome.into_result()? {
                Some(index) => println!("Ok at {index}"),
                None => println!("Duplicate"),
            }
        }
        Ok(())
    }

    /// Prints log entries.
    fn print_entries(entries: Entries) {
        println!("Log {}..={}", entries.first_index, entries.commit_index);
        for LogEntry { index, term, timestamp, client_id, transaction } in entries.entries {
            let Some(transaction) = transaction else {
                println!("{index}@{term} noop");
                continue;
            };
            let client = client_id.map(|id| format!(" client={id}")).unwrap_or_default();
            let operations =
                transaction.operations.iter().map(|(path, op)| format!("{path} {op:?}")).join(", ");
            println!("{index}@{term} t={timestamp}{client} {operations}");
        }
    }
}
