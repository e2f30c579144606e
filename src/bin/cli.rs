use clap::{Parser, Subcommand};
use shm_bloom_rs::{
    BloomFilterOps, BloomFilterStats, BulkBloomFilterOps, FilterConfig, Key,
    SharedMemoryBloomFilter, common::bytes2hr,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the backing file
    #[arg(short, long, global = true, default_value = "bloom.shm")]
    path: PathBuf,

    /// Capacity used if the file has to be created
    #[arg(short, long, global = true)]
    capacity: Option<u64>,

    /// Error rate used if the file has to be created
    #[arg(short, long, global = true)]
    error_rate: Option<f64>,

    /// Hold an exclusive file lock around every write
    #[arg(long, global = true)]
    serialize_writers: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backing file, or attach if it is already initialized
    Create,

    /// Add keys to the filter
    Add {
        /// Keys to add
        #[arg(required = true)]
        keys: Vec<String>,

        /// Treat keys as integers
        #[arg(short, long)]
        int: bool,
    },

    /// Check whether keys are in the filter
    Check {
        /// Keys to check
        #[arg(required = true)]
        keys: Vec<String>,

        /// Treat keys as integers
        #[arg(short, long)]
        int: bool,
    },

    /// Display information about the filter
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear every bit and reset the count
    Clear,
}

fn parse_keys(raw: &[String], int: bool) -> Result<Vec<Key>, String> {
    raw.iter()
        .map(|s| {
            if int {
                s.parse::<i128>()
                    .map(Key::Int)
                    .map_err(|e| format!("'{s}' is not an integer: {e}"))
            } else {
                Ok(Key::Text(s.clone()))
            }
        })
        .collect()
}

fn display_key(key: &Key) -> String {
    match key {
        Key::Int(v) => v.to_string(),
        Key::Text(s) => s.clone(),
        Key::Bytes(b) => format!("{b:?}"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = FilterConfig::from_env()?;
    if let Some(capacity) = cli.capacity {
        config.capacity = capacity;
    }
    if let Some(error_rate) = cli.error_rate {
        config.error_rate = error_rate;
    }
    config.serialize_writers = cli.serialize_writers;

    let filter = SharedMemoryBloomFilter::open(&cli.path, config)?;

    match &cli.command {
        Commands::Create => {
            println!(
                "{} filter at {} ({} bits, {} hashes, capacity {})",
                match filter.region().origin() {
                    shm_bloom_rs::RegionOrigin::Created => "Created",
                    shm_bloom_rs::RegionOrigin::Attached => "Attached to",
                },
                cli.path.display(),
                filter.bit_length(),
                filter.hash_count(),
                filter.capacity()
            );
        }
        Commands::Add { keys, int } => {
            let keys = parse_keys(keys, *int)?;
            let resets = filter.add_bulk(&keys)?;
            for (key, reset) in keys.iter().zip(resets) {
                if reset {
                    println!("Filter reset before adding '{}'", display_key(key));
                }
            }
            println!("Added {} key(s), count is {}", keys.len(), filter.len()?);
        }
        Commands::Check { keys, int } => {
            let keys = parse_keys(keys, *int)?;
            for (key, present) in keys.iter().zip(filter.contains_bulk(&keys)?) {
                println!(
                    "{}: {}",
                    display_key(key),
                    if present { "present" } else { "absent" }
                );
            }
        }
        Commands::Info { json } => {
            let info = filter.info()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Path: {}", cli.path.display());
                println!("Size: {}", bytes2hr(info.size_bytes));
                println!("Capacity: {}", info.capacity);
                println!("Count: {}", info.count);
                println!("Bit length: {}", info.bit_length);
                println!("Hash count: {}", info.hash_count);
                println!(
                    "Set bits: {} ({:.2}%)",
                    info.population,
                    info.fill_ratio * 100.0
                );
                println!(
                    "False positive rate: {:.6} now, {:.6} at capacity",
                    info.estimated_false_positive_rate,
                    info.design_false_positive_rate
                );
            }
        }
        Commands::Clear => {
            filter.clear()?;
            println!("Filter cleared");
        }
    }

    Ok(())
}
