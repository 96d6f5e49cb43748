//! PorkDB Command-Line Tool
//!
//! Reads and writes a local PorkDB directory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use porkdb::data::StreamingDataLookup;
use porkdb::index::HashTableIndexLookup;
use porkdb::{Backend, Compression, Config, DbMap, DigestHasher, KeyHasher, Store};
use tracing_subscriber::{fmt, EnvFilter};

/// PorkDB CLI
#[derive(Parser, Debug)]
#[command(name = "pdb")]
#[command(about = "Embedded file-backed key-value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./porkdb_data")]
    data_dir: String,

    /// Storage layout
    #[arg(short, long, value_enum, default_value = "tree")]
    backend: BackendArg,

    /// Open file / lock budget
    #[arg(long, default_value = "128")]
    max_open_files: usize,

    /// Deflate level for stored values (0 = off)
    #[arg(long, default_value = "0")]
    deflate: u32,

    /// Key digest length in bytes
    #[arg(long, default_value = "16")]
    hash_length: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    /// One file per key hash prefix
    Tree,
    /// Single archive file
    Archive,
    /// Radix tree index plus sectored data file
    Map,
    /// Bucketed hash table index plus contiguous data runs
    Hashmap,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value
    Put {
        key: String,
        value: String,
    },

    /// Print a value
    Get {
        key: String,
    },

    /// Delete a key
    Remove {
        key: String,
    },

    /// List stored entries (map: entry count only)
    List,

    /// Run a multi-threaded put/get load
    Bench {
        /// Worker threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Keys written and read by each thread
        #[arg(short = 'n', long, default_value = "10000")]
        ops: usize,

        /// Value size in bytes
        #[arg(short, long, default_value = "128")]
        value_size: usize,
    },
}

type HashMapDb = DbMap<str, HashTableIndexLookup<str>, StreamingDataLookup>;

/// Any facade behind one interface
enum Db {
    Store(Store<str>),
    Map(DbMap<str>),
    HashMap(HashMapDb),
}

impl Db {
    fn open(args: &Args) -> porkdb::Result<Self> {
        let compression = match args.deflate {
            0 => Compression::None,
            level => Compression::Deflate(level),
        };
        let backend = match args.backend {
            BackendArg::Archive => Backend::Archive,
            _ => Backend::Tree,
        };
        let config = Config::builder()
            .data_dir(&args.data_dir)
            .backend(backend)
            .max_open_files(args.max_open_files)
            .hash_length(args.hash_length)
            .compression(compression)
            .build();
        config.validate()?;
        let hasher: Arc<dyn KeyHasher<str>> = Arc::new(DigestHasher::from_config(&config)?);

        match args.backend {
            BackendArg::Tree | BackendArg::Archive => Ok(Db::Store(Store::open(&config, hasher)?)),
            BackendArg::Map => Ok(Db::Map(DbMap::open(&config, hasher)?)),
            BackendArg::Hashmap => {
                let index = HashTableIndexLookup::new(config.table_bits, config.pointer_bytes)?;
                let data = StreamingDataLookup::new(config.data_sector_size)?;
                Ok(Db::HashMap(DbMap::open_with(&config, hasher, index, data)?))
            }
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> porkdb::Result<()> {
        match self {
            Db::Store(store) => store.put(key, value),
            Db::Map(map) => map.insert(key, value),
            Db::HashMap(map) => map.insert(key, value),
        }
    }

    fn get(&self, key: &str) -> porkdb::Result<Option<Vec<u8>>> {
        match self {
            Db::Store(store) => store.get(key),
            Db::Map(map) => map.get(key),
            Db::HashMap(map) => map.get(key),
        }
    }

    fn remove(&self, key: &str) -> porkdb::Result<bool> {
        match self {
            Db::Store(store) => store.remove(key),
            Db::Map(map) => map.remove(key).map(|old| old.is_some()),
            Db::HashMap(map) => map.remove(key).map(|old| old.is_some()),
        }
    }

    fn close(&self) -> porkdb::Result<()> {
        match self {
            Db::Store(store) => store.shutdown(),
            Db::Map(map) => map.close(),
            Db::HashMap(map) => map.close(),
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,porkdb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::debug!("PorkDB v{}", porkdb::VERSION);

    let db = match Db::open(&args) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open {}: {}", args.data_dir, e);
            std::process::exit(1);
        }
    };

    let result = run(&db, &args.command);
    let closed = db.close();

    if let Err(e) = result.and(closed) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(db: &Db, command: &Commands) -> porkdb::Result<()> {
    match command {
        Commands::Put { key, value } => {
            db.put(key, value.as_bytes())?;
            println!("OK");
        }
        Commands::Get { key } => match db.get(key)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Remove { key } => {
            println!("{}", if db.remove(key)? { "1" } else { "0" });
        }
        Commands::List => match db {
            Db::Store(store) => store.for_each(|hash, value| {
                println!("{}\t{}", hex::encode(hash), String::from_utf8_lossy(&value));
                Ok(())
            })?,
            Db::Map(map) => println!("{} entries", map.len()),
            Db::HashMap(map) => println!("{} entries", map.len()),
        },
        Commands::Bench {
            threads,
            ops,
            value_size,
        } => bench(db, *threads, *ops, *value_size)?,
    }
    Ok(())
}

/// Each thread writes then reads back its own key range
fn bench(db: &Db, threads: usize, ops: usize, value_size: usize) -> porkdb::Result<()> {
    let value: Vec<u8> = (0..value_size).map(|i| (i % 251) as u8).collect();
    let mismatches = AtomicU64::new(0);
    let start = Instant::now();

    let joined = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let value = value.as_slice();
                let mismatches = &mismatches;
                s.spawn(move |_| -> porkdb::Result<()> {
                    for i in 0..ops {
                        db.put(&format!("bench-{}-{}", t, i), value)?;
                    }
                    for i in 0..ops {
                        if db.get(&format!("bench-{}-{}", t, i))?.as_deref() != Some(value) {
                            mismatches.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    });

    let Ok(results) = joined else {
        tracing::error!("bench scope panicked");
        std::process::exit(1);
    };
    for result in results {
        match result {
            Ok(outcome) => outcome?,
            Err(_) => {
                tracing::error!("bench worker panicked");
                std::process::exit(1);
            }
        }
    }

    let elapsed = start.elapsed();
    let total = (threads * ops * 2) as f64;
    println!(
        "{} ops in {:.2?} ({:.0} ops/s), {} mismatches",
        threads * ops * 2,
        elapsed,
        total / elapsed.as_secs_f64(),
        mismatches.load(Ordering::Relaxed)
    );
    Ok(())
}
