//! PageHash CLI
//!
//! Command-line access to one string-keyed hash table in a data directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pagehash::codec::StringSerializer;
use pagehash::hashindex::METADATA_FILE_EXTENSION;
use pagehash::{
    Config, FilePageCache, LocalHashTable, NoopAtomicOperation, PageCache, Result,
    Xxh3HashFunction,
};
use tracing_subscriber::{fmt, EnvFilter};

type StringTable = LocalHashTable<String, String, FilePageCache>;

/// PageHash CLI
#[derive(Parser, Debug)]
#[command(name = "pagehash-cli")]
#[command(about = "Inspect and edit a durable extendible hash table")]
#[command(version)]
struct Args {
    /// Data directory holding the table files
    #[arg(short, long, default_value = "./pagehash_data")]
    data_dir: PathBuf,

    /// Table name (file stem)
    #[arg(short, long, default_value = "default")]
    name: String,

    /// Page size in bytes for a new table
    #[arg(long, default_value = "65536")]
    page_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty table
    Create,

    /// Store a value under a key
    Put {
        key: String,
        value: String,
    },

    /// Print the value of a key
    Get {
        key: String,
    },

    /// Remove a key
    Remove {
        key: String,
    },

    /// Print the record count
    Size,

    /// Print the entry with the smallest hash code
    First,

    /// Print the entry with the largest hash code
    Last,

    /// Verify the table and print its shape
    Stats,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pagehash=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Command failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .page_size(args.page_size)
        .build();
    let cache = Arc::new(FilePageCache::new(config.clone())?);
    let op = NoopAtomicOperation;

    let table = if matches!(args.command, Commands::Create) {
        StringTable::create(
            &args.name,
            Arc::clone(&cache),
            &config,
            Arc::new(StringSerializer),
            Arc::new(StringSerializer),
            Arc::new(Xxh3HashFunction::<String, _>::new(StringSerializer)),
            &op,
        )?
    } else {
        if !cache.exists(&format!("{}{}", args.name, METADATA_FILE_EXTENSION)) {
            tracing::warn!("Table {} not found in {}", args.name, args.data_dir.display());
        }
        StringTable::open(
            &args.name,
            Arc::clone(&cache),
            &config,
            Arc::new(StringSerializer),
            Arc::new(StringSerializer),
            Arc::new(Xxh3HashFunction::<String, _>::new(StringSerializer)),
        )?
    };

    match &args.command {
        Commands::Create => println!("created {}", table.name()),
        Commands::Put { key, value } => {
            table.put(&op, Some(key), value.clone())?;
            println!("OK");
        }
        Commands::Get { key } => match table.get(Some(key))? {
            Some(value) => println!("{value}"),
            None => println!("(nil)"),
        },
        Commands::Remove { key } => match table.remove(&op, Some(key))? {
            Some(value) => println!("removed {value}"),
            None => println!("(nil)"),
        },
        Commands::Size => println!("{}", table.size()?),
        Commands::First => match table.first_entry()? {
            Some(entry) => println!("{:#018x} {} {}", entry.hash_code, entry.key, entry.value),
            None => println!("(empty)"),
        },
        Commands::Last => match table.last_entry()? {
            Some(entry) => println!("{:#018x} {} {}", entry.hash_code, entry.key, entry.value),
            None => println!("(empty)"),
        },
        Commands::Stats => {
            let stats = table.check_invariants()?;
            println!("entries:          {}", stats.entries);
            println!("null entry:       {}", stats.null_entry);
            println!("buckets:          {}", stats.buckets);
            println!("max bucket depth: {}", stats.max_bucket_depth);
            println!("directory nodes:  {}", stats.directory_nodes);
        }
    }

    table.close()
}
