//! Locality CLI
//!
//! Command-line interface for locality index operations:
//! - Import key segments
//! - Build the index over the coarse segments
//! - Query rows, buckets and lookups
//! - Inspect the loaded artifact

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use locality_index::config::{generate_default_config, Config};
use locality_index::index::{CancelFlag, LocalityIndex, LocalityStats};
use locality_index::storage::{write_segment, KeySegment, SegmentSet, StepRange};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "locality")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Locality index for segmented history stores")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a key segment for a step range from a file of keys
    Import {
        /// File with one key per line (hex, or decimal with --u64)
        path: PathBuf,
        /// First step covered
        #[arg(long)]
        from: u64,
        /// End step (exclusive)
        #[arg(long)]
        to: u64,
        /// Keys are decimal integers, stored as 8-byte big-endian
        #[arg(long = "u64")]
        as_u64: bool,
    },

    /// Build the locality index if it is missing or stale
    Build,

    /// Nearest buckets at or after an op number for a key
    Lookup {
        /// Key (hex, or decimal with --u64)
        key: String,
        /// Op number to search from
        #[arg(long, default_value = "0")]
        from_op: u64,
        /// Key is a decimal integer
        #[arg(long = "u64")]
        as_u64: bool,
    },

    /// Buckets of one row
    Row { row: u64 },

    /// First two buckets of a row at or after a bucket
    First2 { row: u64, bucket: u64 },

    /// Scan keys with their buckets
    Iterate {
        /// Leave out buckets starting after this op number
        #[arg(long)]
        max_tx: Option<u64>,
        /// Stop after this many keys
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show loaded artifact statistics
    Stats,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config);

    match cli.command {
        Commands::Import {
            path,
            from,
            to,
            as_u64,
        } => {
            let range = StepRange::new(from, to);
            if range.is_empty() {
                bail!("empty step range {}", range);
            }

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading keys from {:?}", path))?;
            let mut keys = Vec::new();
            for (i, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                keys.push(parse_key(line, as_u64).with_context(|| format!("line {}", i + 1))?);
            }
            keys.sort();
            keys.dedup();

            let dir = config.segments_dir();
            let file = dir.join(KeySegment::file_name(&config.index.filename_base, range));
            let segment = write_segment(&file, range, &keys)?;
            println!(
                "Wrote {} keys to {:?} ({} blocks)",
                segment.key_count(),
                file,
                segment.blocks.len()
            );
        }

        Commands::Build => {
            let index = Arc::new(LocalityIndex::open(config.locality_config()?)?);
            let segments = SegmentSet::load_dir(&config.segments_dir())?;

            let cancel = CancelFlag::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling build");
                    ctrl_c.cancel();
                }
            });

            let built = index
                .build_missed_indices_async(segments, cancel)
                .await?;
            let report = BuildReport {
                built,
                stats: index.stats(),
            };
            print_value(&cli.format, &report, || {
                println!("{}", report.status());
                if let Some(stats) = &report.stats {
                    println!("{}", stats);
                }
            })?;
        }

        Commands::Lookup {
            key,
            from_op,
            as_u64,
        } => {
            let index = LocalityIndex::open(config.locality_config()?)?;
            let segments = SegmentSet::load_dir(&config.segments_dir())?;
            let ctx = index.make_context(&segments);
            if ctx.is_stale() {
                tracing::warn!("Locality index is stale, run `locality build`");
            }

            let key = parse_key(&key, as_u64)?;
            let hit = index.lookup_idx_files(&ctx, &key, from_op)?;
            print_value(&cli.format, &hit, || {
                if hit.has_v1 {
                    println!("v1: {}", hit.v1);
                    println!("v2: {}{}", hit.v2, if hit.has_v2 { "" } else { " (fallback)" });
                } else {
                    println!("No coarse hit");
                }
                println!("next from op: {}", hit.next_from_op_num);
            })?;
        }

        Commands::Row { row } => {
            let index = LocalityIndex::open(config.locality_config()?)?;
            let ctx = index.make_context(&SegmentSet::default());
            let buckets = ctx.at(row)?;
            let key = ctx.rows().map(|r| r.key_at(row)).transpose()?.map(hex::encode);

            #[derive(Serialize)]
            struct RowOut {
                row: u64,
                key: Option<String>,
                buckets: Vec<u64>,
            }
            let out = RowOut { row, key, buckets };
            print_value(&cli.format, &out, || {
                println!("{:<8} {:<34} {}", "Row", "Key", "Buckets");
                println!("{}", "-".repeat(60));
                println!(
                    "{:<8} {:<34} {:?}",
                    out.row,
                    out.key.as_deref().unwrap_or("-"),
                    out.buckets
                );
            })?;
        }

        Commands::First2 { row, bucket } => {
            let index = LocalityIndex::open(config.locality_config()?)?;
            let ctx = index.make_context(&SegmentSet::default());
            let hit = ctx.first2_at(row, bucket)?;
            print_value(&cli.format, &hit, || {
                let show = |has: bool, v: u64| if has { v.to_string() } else { "-".into() };
                println!("first:  {}", show(hit.has_first, hit.first));
                println!("second: {}", show(hit.has_second, hit.second));
            })?;
        }

        Commands::Iterate { max_tx, limit } => {
            let index = LocalityIndex::open(config.locality_config()?)?;
            let segments = SegmentSet::load_dir(&config.segments_dir())?;
            let ctx = index.make_context(&segments);

            #[derive(Serialize)]
            struct Entry {
                key: String,
                buckets: Vec<u64>,
            }
            let mut entries = Vec::new();
            for item in ctx
                .iterate_keys_locality(max_tx.unwrap_or(u64::MAX))?
                .take(limit.unwrap_or(usize::MAX))
            {
                let (key, buckets) = item?;
                entries.push(Entry {
                    key: hex::encode(key),
                    buckets,
                });
            }

            print_value(&cli.format, &entries, || {
                if entries.is_empty() {
                    println!("No keys");
                    return;
                }
                println!("{:<34} {}", "Key", "Buckets");
                println!("{}", "-".repeat(50));
                for entry in &entries {
                    println!("{:<34} {:?}", entry.key, entry.buckets);
                }
            })?;
        }

        Commands::Stats => {
            let index = LocalityIndex::open(config.locality_config()?)?;
            let segments = SegmentSet::load_dir(&config.segments_dir())?;
            match index.stats() {
                Some(stats) => print_value(&cli.format, &stats, || {
                    println!("Locality index {}", config.index.filename_base);
                    println!();
                    println!("  Keys:         {}", stats.key_count);
                    println!("  Buckets:      {}", stats.bits_per_row);
                    println!("  Steps:        {}", stats.step_range);
                    println!("  Rows file:    {} bytes", stats.rows_bytes);
                    println!("  Bitmap file:  {} bytes", stats.bitmap_bytes);
                    println!("  Current:      {}", index.is_current(&segments));
                })?,
                None => println!("No locality index built yet"),
            }
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

/// Outcome of `locality build`
#[derive(Serialize)]
struct BuildReport {
    built: bool,
    stats: Option<LocalityStats>,
}

impl BuildReport {
    fn status(&self) -> &'static str {
        match (self.built, &self.stats) {
            (true, _) => "Built locality index",
            (false, Some(_)) => "Locality index is current",
            (false, None) => "No coarse segments to index",
        }
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("locality_index={}", config.logging.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_key(s: &str, as_u64: bool) -> anyhow::Result<Vec<u8>> {
    if as_u64 {
        let n: u64 = s.parse().with_context(|| format!("invalid integer key {:?}", s))?;
        return Ok(n.to_be_bytes().to_vec());
    }
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(hex_str).with_context(|| format!("invalid hex key {:?}", s))
}

fn print_value<T: Serialize>(format: &str, value: &T, table: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(value)?),
        "table" => table(),
        other => bail!("unknown output format {:?}", other),
    }
    Ok(())
}
