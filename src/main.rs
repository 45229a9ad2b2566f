//! shmkv CLI
//!
//! Attach to a named store and run one operation against it. Several
//! invocations running at once act as independent client processes.

use clap::{Args, Parser, Subcommand};
use shmkv::config::{DEFAULT_CAPACITY, DEFAULT_KEY_SIZE, DEFAULT_SHARDS, DEFAULT_VALUE_SIZE};
use shmkv::{KvStore, StoreConfig};
use std::io::{self, Write};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shmkv")]
#[command(author, version, about = "Sharded key-value store in shared memory", long_about = None)]
struct Cli {
    /// Store name
    #[arg(short, long, env = "SHMKV_STORE", default_value = "shmkv")]
    name: String,

    #[command(flatten)]
    geometry: Geometry,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Store geometry; every process sharing a store must agree on it
#[derive(Args)]
struct Geometry {
    /// Number of shards
    #[arg(long, default_value_t = DEFAULT_SHARDS)]
    shards: u32,

    /// Entries per shard
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u32,

    /// Key width in bytes
    #[arg(long, default_value_t = DEFAULT_KEY_SIZE)]
    key_size: u32,

    /// Value width in bytes
    #[arg(long, default_value_t = DEFAULT_VALUE_SIZE)]
    value_size: u32,
}

impl From<&Geometry> for StoreConfig {
    fn from(g: &Geometry) -> Self {
        StoreConfig {
            shards: g.shards,
            capacity: g.capacity,
            key_size: g.key_size,
            value_size: g.value_size,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write one entry
    Put { key: String, value: String },

    /// Print the first matching value; exits with 1 on a miss
    Get { key: String },

    /// Print every matching value, one per line
    GetAll { key: String },

    /// Show per-shard fill and cursors
    Stats {
        /// Include shards that have never been written
        #[arg(long)]
        all: bool,
    },

    /// Remove the store's semaphores and segment
    Destroy,

    /// Write `count` entries under one key, valued PREFIX-000000 onwards
    Fill {
        key: String,

        #[arg(long, default_value = "v")]
        prefix: String,

        #[arg(long, default_value_t = 100)]
        count: u32,
    },

    /// Write `count` self-checking entries whose key is the CRC-32 of the value
    Churn {
        /// Distinguishes the values of concurrent writers
        #[arg(long)]
        tag: String,

        #[arg(long, default_value_t = 100)]
        count: u32,
    },
}

/// Key of a self-checking entry: the value's CRC-32 in hex
fn checked_key(value: &str) -> String {
    format!("{:08x}", crc32fast::hash(value.as_bytes()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "shmkv failed");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = StoreConfig::from(&cli.geometry);
    let attach = || KvStore::attach(&cli.name, config);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Put { key, value } => {
            attach()?.put(key.as_bytes(), value.as_bytes())?;
        }

        Commands::Get { key } => match attach()?.get(key.as_bytes())? {
            Some(value) => writeln!(stdout, "{}", String::from_utf8_lossy(&value))?,
            None => {
                tracing::info!(key = %key, "Not found");
                return Ok(ExitCode::from(1));
            }
        },

        Commands::GetAll { key } => {
            for value in attach()?.get_all(key.as_bytes())? {
                writeln!(stdout, "{}", String::from_utf8_lossy(&value))?;
            }
        }

        Commands::Stats { all } => {
            let store = attach()?;
            writeln!(stdout, "{:>6} {:>8} {:>8} {:>8}", "shard", "fill", "write", "read")?;
            for shard in store.stats()? {
                if all || shard.fill > 0 {
                    writeln!(
                        stdout,
                        "{:>6} {:>8} {:>8} {:>8}",
                        shard.shard, shard.fill, shard.write_cursor, shard.read_cursor
                    )?;
                }
            }
        }

        // Removal works by name, so a store with an unknown geometry can go too
        Commands::Destroy => {
            shmkv::destroy(&cli.name)?;
            tracing::info!(name = %cli.name, "Store destroyed");
        }

        Commands::Fill { key, prefix, count } => {
            let store = attach()?;
            for i in 0..count {
                let value = format!("{}-{:06}", prefix, i);
                store.put(key.as_bytes(), value.as_bytes())?;
            }
            tracing::debug!(key = %key, count = count, "Filled");
        }

        Commands::Churn { tag, count } => {
            let store = attach()?;
            for i in 0..count {
                let value = format!("{}-{:06}", tag, i);
                store.put(checked_key(&value).as_bytes(), value.as_bytes())?;
            }
            tracing::debug!(tag = %tag, count = count, "Churned");
        }
    }

    Ok(ExitCode::SUCCESS)
}
