//! vtrie CLI - Command line interface for a versioned Merkle state store
//!
//! Every mutating command commits one version. Output is JSON on stdout;
//! logs go to stderr (set RUST_LOG to see them).

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use vtrie::{
    Backend, GcOptions, GcStrategyKind, Hash, HashFunction, ProofKind, RetentionPolicy, StateDb,
    TrieConfig,
};

#[derive(Parser)]
#[command(name = "vtrie")]
#[command(about = "A versioned, Merkle-authenticated key-value store")]
#[command(version)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, default_value = "state.vtrie")]
    database: PathBuf,

    /// Storage backend
    #[arg(long, default_value = "file")]
    backend: BackendKind,

    /// Keyspace namespace (overrides the config file)
    #[arg(long)]
    namespace: Option<String>,

    /// Config file (default: ~/.config/vtrie/config.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    /// Keys and values are hex encoded
    #[arg(long)]
    hex: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum BackendKind {
    File,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new database
    Init,

    /// Set a key
    Put {
        key: String,
        value: String,
        /// Version to commit (default: latest + 1)
        #[arg(long)]
        version: Option<u64>,
    },

    /// Delete a key
    Delete {
        key: String,
        /// Version to commit (default: latest + 1)
        #[arg(long)]
        version: Option<u64>,
    },

    /// Read a key
    Get {
        key: String,
        /// Version to read (default: latest)
        #[arg(long)]
        version: Option<u64>,
    },

    /// Show the root hash of a version
    Root {
        #[arg(long)]
        version: Option<u64>,
    },

    /// List committed versions
    Versions,

    /// Produce an inclusion or exclusion proof for a key
    Prove {
        key: String,
        #[arg(long)]
        version: Option<u64>,
    },

    /// Verify a proof against a root hash
    Verify {
        key: String,
        /// Root hash (hex)
        #[arg(long)]
        root: String,
        /// Proof wire bytes (hex)
        #[arg(long)]
        proof: String,
        /// Claimed value; omit with --absent
        #[arg(long)]
        value: Option<String>,
        /// Claim the key is absent
        #[arg(long)]
        absent: bool,
    },

    /// Reclaim nodes no retained version can reach
    Gc {
        /// mark_sweep or incremental (default: from config)
        #[arg(long)]
        strategy: Option<GcStrategyKind>,
        /// Keep the newest N versions
        #[arg(long, conflicts_with_all = ["keep_from", "keep_all"])]
        keep_latest: Option<u64>,
        /// Keep every version readable at or after this one
        #[arg(long, conflicts_with = "keep_all")]
        keep_from: Option<u64>,
        #[arg(long)]
        keep_all: bool,
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Rewrite the database file without superseded records
    Compact,

    /// Show record counts
    Stats,

    /// Synthetic load: batched writes with periodic proofs
    Load {
        /// Total records to write
        #[arg(long, default_value = "10000")]
        records: usize,
        /// Records per committed version
        #[arg(long, default_value = "100")]
        batch_size: usize,
        /// Bytes per value
        #[arg(long, default_value = "64")]
        value_size: usize,
        /// Prove and verify one key every N versions (0 disables)
        #[arg(long, default_value = "10")]
        proof_every: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = open_db(&cli)?;

    match &cli.command {
        Commands::Init => {
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Opened database at {}", cli.database.display()),
                    "namespace": db.config().namespace,
                    "latest_version": db.latest_version()?
                }),
            );
        }

        Commands::Put {
            key,
            value,
            version,
        } => {
            let outcome = db.insert(&decode(&cli, key)?, &decode(&cli, value)?, *version)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "version": outcome.version,
                    "root": outcome.root_hash.to_hex(),
                    "nodes_written": outcome.nodes_written,
                    "stale_marked": outcome.stale_marked
                }),
            );
        }

        Commands::Delete { key, version } => {
            let outcome = db.delete(&decode(&cli, key)?, *version)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "version": outcome.version,
                    "root": outcome.root_hash.to_hex(),
                    "deleted": outcome.values_deleted > 0
                }),
            );
        }

        Commands::Get { key, version } => {
            let value = db.get(&decode(&cli, key)?, *version)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "key": key,
                    "version": version.or(db.latest_version()?),
                    "found": value.is_some(),
                    "value": value.map(|v| encode(&cli, &v))
                }),
            );
        }

        Commands::Root { version } => {
            let root = db.root_hash(*version)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "version": version.or(db.latest_version()?),
                    "root": root.map(|h| h.to_hex())
                }),
            );
        }

        Commands::Versions => {
            let items: Vec<_> = db
                .versions()?
                .into_iter()
                .map(|(version, root)| {
                    serde_json::json!({
                        "version": version,
                        "root": root.to_hex()
                    })
                })
                .collect();
            output(
                &cli.format,
                &serde_json::json!({
                    "count": items.len(),
                    "versions": items
                }),
            );
        }

        Commands::Prove { key, version } => {
            let bundle = db
                .prove(&decode(&cli, key)?, *version)?
                .ok_or_else(|| anyhow!("No committed version at or below the requested one"))?;
            output(
                &cli.format,
                &serde_json::json!({
                    "key": key,
                    "version": bundle.version,
                    "root": bundle.root_hash.to_hex(),
                    "kind": bundle.kind,
                    "included": bundle.kind == ProofKind::Inclusion,
                    "value": bundle.value.as_deref().map(|v| encode(&cli, v)),
                    "proof": hex::encode(&bundle.wire)
                }),
            );
        }

        Commands::Verify {
            key,
            root,
            proof,
            value,
            absent,
        } => {
            let root = Hash::from_hex(root).map_err(|_| anyhow!("Invalid root hash: {}", root))?;
            let wire = hex::decode(proof).context("Proof must be hex")?;
            let value = value.as_ref().map(|v| decode(&cli, v)).transpose()?;
            let valid = db.verify(&root, &decode(&cli, key)?, value.as_deref(), !*absent, &wire);
            output(
                &cli.format,
                &serde_json::json!({
                    "key": key,
                    "root": root.to_hex(),
                    "claim": if *absent { "absent" } else { "present" },
                    "valid": valid
                }),
            );
            if !valid {
                std::process::exit(1);
            }
        }

        Commands::Gc {
            strategy,
            keep_latest,
            keep_from,
            keep_all,
            dry_run,
            batch_size,
        } => {
            let gc = &db.config().gc;
            let policy = match (keep_latest, keep_from, keep_all) {
                (Some(n), _, _) => RetentionPolicy::KeepLatest(*n),
                (_, Some(v), _) => RetentionPolicy::KeepFrom(*v),
                (_, _, true) => RetentionPolicy::KeepAll,
                _ => gc.retention,
            };
            let options = GcOptions {
                dry_run: *dry_run,
                batch_size: batch_size.unwrap_or(gc.batch_size),
                ..db.config().gc_options()
            };
            let report = db.gc_with(strategy.unwrap_or(gc.strategy), &policy, &options)?;
            output(&cli.format, &serde_json::to_value(&report)?);
        }

        Commands::Compact => match db.compact()? {
            Some(stats) => output(&cli.format, &serde_json::to_value(stats)?),
            None => output(
                &cli.format,
                &serde_json::json!({
                    "status": "skipped",
                    "message": "Compaction applies to the file backend only"
                }),
            ),
        },

        Commands::Stats => {
            let stats = db.stats()?;
            output(&cli.format, &serde_json::to_value(&stats)?);
        }

        Commands::Load {
            records,
            batch_size,
            value_size,
            proof_every,
        } => {
            let report = run_load(&db, *records, *batch_size, *value_size, *proof_every)?;
            output(&cli.format, &report);
        }
    }

    Ok(())
}

fn open_db(cli: &Cli) -> anyhow::Result<StateDb> {
    let mut config = TrieConfig::load_or_default(cli.config.as_deref())?;
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    let backend = match cli.backend {
        BackendKind::File => Backend::File(cli.database.clone()),
        BackendKind::Sqlite => sqlite_backend(cli.database.clone())?,
    };
    Ok(StateDb::open(backend, config)?)
}

#[cfg(feature = "sqlite")]
fn sqlite_backend(path: PathBuf) -> anyhow::Result<Backend> {
    Ok(Backend::Sqlite(path))
}

#[cfg(not(feature = "sqlite"))]
fn sqlite_backend(_path: PathBuf) -> anyhow::Result<Backend> {
    Err(anyhow!("Built without the sqlite feature"))
}

fn decode(cli: &Cli, text: &str) -> anyhow::Result<Vec<u8>> {
    if cli.hex {
        hex::decode(text).with_context(|| format!("Not valid hex: {}", text))
    } else {
        Ok(text.as_bytes().to_vec())
    }
}

fn encode(cli: &Cli, bytes: &[u8]) -> String {
    if cli.hex {
        hex::encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn run_load(
    db: &StateDb,
    records: usize,
    batch_size: usize,
    value_size: usize,
    proof_every: usize,
) -> anyhow::Result<serde_json::Value> {
    let batch_size = batch_size.max(1);
    let hasher = db.trie().hasher().clone();
    let start = Instant::now();
    let mut written = 0usize;
    let mut versions = 0usize;
    let mut proofs = 0usize;
    let mut nodes = 0usize;

    while written < records {
        let count = batch_size.min(records - written);
        let updates: Vec<(Vec<u8>, Option<Vec<u8>>)> = (written..written + count)
            .map(|i| {
                let key = format!("load-{:08}", i).into_bytes();
                let value = filler(hasher.as_ref(), &key, value_size);
                (key, Some(value))
            })
            .collect();
        let sample = updates.last().map(|(k, v)| (k.clone(), v.clone()));
        let outcome = db.apply(None, updates)?;
        written += count;
        versions += 1;
        nodes += outcome.nodes_written;

        if proof_every > 0 && versions % proof_every == 0 {
            if let Some((key, Some(value))) = sample {
                let bundle = db
                    .prove(&key, Some(outcome.version))?
                    .ok_or_else(|| anyhow!("Missing root for version {}", outcome.version))?;
                if !db.verify(&bundle.root_hash, &key, Some(value.as_slice()), true, &bundle.wire) {
                    return Err(anyhow!("Proof failed to verify at version {}", outcome.version));
                }
                proofs += 1;
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    Ok(serde_json::json!({
        "records": written,
        "versions": versions,
        "nodes_written": nodes,
        "proofs_verified": proofs,
        "elapsed_secs": elapsed,
        "records_per_sec": if elapsed > 0.0 { written as f64 / elapsed } else { 0.0 },
        "root": db.root_hash(None)?.map(|h| h.to_hex())
    }))
}

/// Deterministic value bytes derived from the key
fn filler(hasher: &dyn HashFunction, key: &[u8], len: usize) -> Vec<u8> {
    let seed = hasher.digest(key);
    seed.as_bytes().iter().copied().cycle().take(len).collect()
}

fn output(format: &OutputFormat, value: &serde_json::Value) {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string(value),
        OutputFormat::Text => serde_json::to_string_pretty(value),
    };
    println!("{}", rendered.unwrap_or_default());
}
