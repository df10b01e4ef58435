use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use coffer_redb::RedbBucket;
use coffer_store::{format_listing, Blob, Bucket, CachingBucket};
use coffer_types::ContentKey;
use colored::Colorize;
use serde_json::json;
use tracing::{info, warn};

use crate::cli::*;
use crate::config::CofferConfig;

/// An opened bucket plus the database that backs it.
pub struct Store {
    config: CofferConfig,
    disk: Arc<RedbBucket>,
    bucket: Arc<dyn Bucket>,
    cached: Option<Arc<CachingBucket>>,
}

impl Store {
    pub fn open(config: CofferConfig) -> anyhow::Result<Self> {
        let options = config.redb_options()?;
        let disk = Arc::new(
            RedbBucket::open(&config.database, options)
                .with_context(|| format!("opening {}", config.database.display()))?,
        );
        let backend: Arc<dyn Bucket> = disk.clone();
        let (bucket, cached) = match &config.cache {
            Some(cache) => {
                let cached = Arc::new(
                    CachingBucket::builder(backend)
                        .config(cache.clone())
                        .build()?,
                );
                let bucket: Arc<dyn Bucket> = cached.clone();
                (bucket, Some(cached))
            }
            None => (backend, None),
        };
        Ok(Self {
            config,
            disk,
            bucket,
            cached,
        })
    }

    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    /// Close the bucket stack, then the database. A failing outer layer is
    /// logged and does not keep the database open.
    pub fn close(&self) -> anyhow::Result<()> {
        if let Err(e) = self.bucket.close() {
            warn!(error = %e, "closing bucket failed");
        }
        self.disk.close()?;
        Ok(())
    }
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = CofferConfig::resolve(&cli.store)?;
    let store = Store::open(config)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = execute(&store, cli.command, cli.format, &mut out);
    store.close()?;
    result
}

pub fn execute(
    store: &Store,
    command: Command,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Command::Put(args) => cmd_put(store, args, format, out),
        Command::Get(args) => cmd_get(store, args, format, out),
        Command::Contains(args) => cmd_contains(store, args, format, out),
        Command::Zip(args) => cmd_zip(store, args, format, out),
        Command::Stat => cmd_stat(store, format, out),
    }
}

fn cmd_put(
    store: &Store,
    args: PutArgs,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    for path in &args.files {
        fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    }
    let blobs: Vec<Blob> = args.files.iter().map(Blob::from_file).collect();
    let keys = store.bucket.put_many(blobs)?;
    info!(files = keys.len(), bucket = %store.config.bucket, "stored files");

    match format {
        OutputFormat::Text => {
            for (key, path) in keys.iter().zip(&args.files) {
                writeln!(out, "{}  {}", key, path.display().to_string().dimmed())?;
            }
        }
        OutputFormat::Json => {
            let rows: Vec<_> = keys
                .iter()
                .zip(&args.files)
                .map(|(key, path)| json!({ "key": key.to_hex(), "path": path.display().to_string() }))
                .collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        }
    }
    Ok(())
}

fn cmd_get(
    store: &Store,
    args: GetArgs,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let blob = store
        .bucket
        .get(&args.key)?
        .ok_or_else(|| anyhow!("{} not found in bucket {}", args.key, store.config.bucket))?;
    let mut reader = blob.open_reader()?;

    match args.output {
        Some(path) => {
            let mut file =
                File::create(&path).with_context(|| format!("creating {}", path.display()))?;
            let bytes = io::copy(&mut reader, &mut file)?;
            match format {
                OutputFormat::Text => writeln!(
                    out,
                    "{} Wrote {} bytes to {}",
                    "✓".green().bold(),
                    bytes,
                    path.display()
                )?,
                OutputFormat::Json => writeln!(
                    out,
                    "{}",
                    json!({ "key": args.key.to_hex(), "path": path.display().to_string(), "bytes": bytes })
                )?,
            }
        }
        None => {
            io::copy(&mut reader, out)?;
        }
    }
    Ok(())
}

fn cmd_contains(
    store: &Store,
    args: ContainsArgs,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let present = store.bucket.contained_subset(&args.keys)?;

    match format {
        OutputFormat::Text => {
            for key in &args.keys {
                let status = if present.contains(key) {
                    "present".green()
                } else {
                    "missing".red()
                };
                writeln!(out, "{key}  {status}")?;
            }
        }
        OutputFormat::Json => {
            let map: BTreeMap<String, bool> = args
                .keys
                .iter()
                .map(|key| (key.to_hex(), present.contains(key)))
                .collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&map)?)?;
        }
    }
    Ok(())
}

fn cmd_zip(
    store: &Store,
    args: ZipArgs,
    format: OutputFormat,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let archive =
        fs::read(&args.archive).with_context(|| format!("reading {}", args.archive.display()))?;

    if args.gzip {
        let stored = store.bucket.put_archive_gzip(&archive)?;
        let compressed = stored.values().filter(|entry| entry.compressed).count();
        info!(entries = stored.len(), compressed, "stored archive with gzip");
        match format {
            OutputFormat::Text => {
                let listing: BTreeMap<String, ContentKey> = stored
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.payload))
                    .collect();
                write!(out, "{}", format_listing(&listing))?;
            }
            OutputFormat::Json => {
                let rows: BTreeMap<&String, _> = stored
                    .iter()
                    .map(|(name, entry)| {
                        (
                            name,
                            json!({ "key": entry.payload.to_hex(), "compressed": entry.compressed }),
                        )
                    })
                    .collect();
                writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
            }
        }
    } else {
        let stored = store.bucket.put_archive(&archive)?;
        info!(entries = stored.len(), "stored archive");
        match format {
            OutputFormat::Text => write!(out, "{}", format_listing(&stored))?,
            OutputFormat::Json => {
                let rows: BTreeMap<&String, String> = stored
                    .iter()
                    .map(|(name, key)| (name, key.to_hex()))
                    .collect();
                writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
            }
        }
    }
    Ok(())
}

fn cmd_stat(store: &Store, format: OutputFormat, out: &mut dyn Write) -> anyhow::Result<()> {
    let entries = store.disk.len()?;
    let stats = store.cached.as_ref().map(|cached| cached.stats());

    match format {
        OutputFormat::Text => {
            writeln!(out, "Database: {}", store.config.database.display().to_string().bold())?;
            writeln!(out, "Bucket: {}", store.config.bucket.yellow())?;
            writeln!(out, "Hash function: {}", store.bucket.hash_function().name().cyan())?;
            writeln!(out, "Direct: {}", store.config.direct)?;
            writeln!(out, "Entries: {}", entries.to_string().bold())?;
            if let Some(stats) = stats {
                writeln!(
                    out,
                    "Cache: {} entries, {} bytes, hit rate {:.2}",
                    stats.entries,
                    stats.weight,
                    stats.hit_rate()
                )?;
            }
        }
        OutputFormat::Json => {
            let value = json!({
                "database": store.config.database.display().to_string(),
                "bucket": store.config.bucket,
                "hash_function": store.bucket.hash_function().name(),
                "direct": store.config.direct,
                "entries": entries,
                "cache": stats.map(|s| json!({
                    "entries": s.entries,
                    "weight": s.weight,
                    "hits": s.hits,
                    "misses": s.misses,
                    "evictions": s.evictions,
                })),
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        }
    }
    Ok(())
}
