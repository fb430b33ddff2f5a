//! tsmdb CLI
//!
//! Inspect WAL segments and TSM files, delete measurement ranges and run the
//! storage engine with background flushing and compaction.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsmdb_core::predicate::{ExprPredicate, Node, Predicate};
use tsmdb_core::storage::{Engine, EngineConfig};
use tsmdb_core::tsm::{parse_file_name, TsmFile, TsmReader};
use tsmdb_core::wal::{SegmentReader, WalEntry};
use tsmdb_core::{
    unescape_measurement, DataPoint, FieldValue, Point, SeriesKey, Timestamp, FIELD_TAG_KEY,
    MAX_TIME, MIN_TIME,
};

#[derive(Parser)]
#[command(name = "tsmdb")]
#[command(about = "tsmdb - time-series storage engine tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// JSON configuration file; overrides --data-dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "tsmdb_core=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the records of WAL segments
    Wal {
        /// Segment files
        #[arg(required = true)]
        segments: Vec<PathBuf>,

        /// Print every key of write records
        #[arg(long)]
        keys: bool,
    },

    /// Print the contents of TSM files
    Tsm {
        /// TSM files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print every key
        #[arg(long)]
        keys: bool,
    },

    /// Write one point
    Write {
        /// Measurement name
        measurement: String,

        /// Tags as key=value
        #[arg(short, long)]
        tag: Vec<String>,

        /// Float fields as name=value
        #[arg(short, long, required = true)]
        field: Vec<String>,

        /// Timestamp in nanoseconds; defaults to now
        #[arg(long)]
        time: Option<Timestamp>,
    },

    /// Delete a time range of a measurement
    Delete {
        /// Measurement name
        measurement: String,

        /// Start of the range (inclusive, nanoseconds)
        #[arg(long)]
        start: Option<Timestamp>,

        /// End of the range (inclusive, nanoseconds)
        #[arg(long)]
        end: Option<Timestamp>,

        /// Only delete series with this tag, as key=value (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,

        /// Only delete this field
        #[arg(long)]
        field: Option<String>,
    },

    /// Print engine statistics as JSON
    Stats,

    /// Run the engine with background flushing and compaction until Ctrl-C
    Run,
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k, v)),
        _ => bail!("expected key=value, got {:?}", raw),
    }
}

fn delete_predicate(tags: &[String], field: Option<&str>) -> Result<Option<ExprPredicate>> {
    let mut nodes = Vec::new();
    for raw in tags {
        let (k, v) = split_pair(raw)?;
        nodes.push(Node::tag_eq(k, v));
    }
    if let Some(field) = field {
        nodes.push(Node::tag_eq(FIELD_TAG_KEY, field));
    }

    let node = match nodes.len() {
        0 => return Ok(None),
        1 => nodes.remove(0),
        _ => Node::and(nodes),
    };
    Ok(Some(ExprPredicate::new(node)?))
}

fn inspect_wal(segments: &[PathBuf], show_keys: bool) -> Result<()> {
    for path in segments {
        let mut reader = SegmentReader::open(path)
            .with_context(|| format!("opening segment {}", path.display()))?;
        println!("{} ({} bytes)", path.display(), reader.len());

        let mut records = 0usize;
        for next in reader.by_ref() {
            match next {
                Ok(WalEntry::Write { values }) => {
                    let count: usize = values.values().map(Vec::len).sum();
                    println!("  write: {} keys, {} values", values.len(), count);
                    if show_keys {
                        for key in values.keys() {
                            println!("    {}", String::from_utf8_lossy(key));
                        }
                    }
                }
                Ok(WalEntry::DeleteRange { keys, min, max }) => {
                    println!("  delete-range: {} keys [{}, {}]", keys.len(), min, max);
                }
                Ok(WalEntry::DeleteBucketRange {
                    name,
                    min,
                    max,
                    predicate,
                }) => {
                    let name = unescape_measurement(&name)
                        .unwrap_or_else(|_| String::from_utf8_lossy(&name).into_owned());
                    println!(
                        "  delete-bucket-range: {} [{}, {}]{}",
                        name,
                        min,
                        max,
                        if predicate.is_some() { " with predicate" } else { "" }
                    );
                }
                Err(e) if e.is_corruption() => println!("  corrupt tail: {}", e),
                Err(e) => println!("  {}", e),
            }
            records += 1;
        }
        println!("  {} records, valid up to offset {}", records, reader.offset());
    }
    Ok(())
}

fn inspect_tsm(files: &[PathBuf], show_keys: bool) -> Result<()> {
    for path in files {
        let (generation, sequence) = parse_file_name(path).unwrap_or((0, 0));
        let file = TsmReader::open(path, generation)
            .with_context(|| format!("opening TSM file {}", path.display()))?
            .with_sequence(sequence);

        println!(
            "{} (generation {}, sequence {}, {} bytes)",
            path.display(),
            generation,
            sequence,
            file.size()
        );
        println!("  keys: {}", file.key_count());
        if let Some(range) = file.time_range() {
            println!("  time range: [{}, {}]", range.start, range.end);
        }
        println!("  tombstones: {}", file.has_tombstones());

        if show_keys {
            for key in file.keys() {
                let count = file.read(&key)?.len();
                println!("    {} ({} values)", String::from_utf8_lossy(&key), count);
            }
        }
    }
    Ok(())
}

async fn run(engine: Arc<Engine>) -> Result<()> {
    let cancel = CancellationToken::new();
    let background = engine.spawn_background(cancel.clone());
    info!(data_dir = ?engine.config().data_dir, "tsmdb running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    if let Err(e) = background.await {
        warn!(error = %e, "background task ended abnormally");
    }

    tokio::task::spawn_blocking(move || engine.close()).await??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::new(&cli.data_dir),
    };

    match cli.command {
        Commands::Wal { segments, keys } => inspect_wal(&segments, keys),
        Commands::Tsm { files, keys } => inspect_tsm(&files, keys),
        Commands::Write {
            measurement,
            tag,
            field,
            time,
        } => {
            let mut key = SeriesKey::new(measurement);
            for raw in &tag {
                let (k, v) = split_pair(raw)?;
                key = key.with_tag(k, v);
            }
            let timestamp = time.unwrap_or_else(|| {
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            });
            let mut data = DataPoint {
                timestamp,
                fields: Default::default(),
            };
            for raw in &field {
                let (name, value) = split_pair(raw)?;
                let value: f64 = value
                    .parse()
                    .with_context(|| format!("field {} is not a number", name))?;
                data.fields.insert(name, FieldValue::Float(value));
            }

            let engine = Engine::open(config)?;
            engine.write_points(&[Point::new(key, data)])?;
            engine.close()?;
            Ok(())
        }
        Commands::Delete {
            measurement,
            start,
            end,
            tag,
            field,
        } => {
            let predicate = delete_predicate(&tag, field.as_deref())?;
            let engine = Engine::open(config)?;
            let summary = engine.delete_prefix_range(
                &measurement,
                start.unwrap_or(MIN_TIME),
                end.unwrap_or(MAX_TIME),
                predicate.as_ref().map(|p| p as &dyn Predicate),
                &CancellationToken::new(),
            )?;
            engine.close()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Stats => {
            let engine = Engine::open(config)?;
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
            engine.close()?;
            Ok(())
        }
        Commands::Run => run(Arc::new(Engine::open(config)?)).await,
    }
}
