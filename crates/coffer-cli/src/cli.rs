use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use coffer_types::{ContentKey, TypeError};

#[derive(Parser, Debug)]
#[command(
    name = "coffer",
    about = "Coffer - content-addressable blob store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Flags that override values from the configuration file.
#[derive(Args, Debug, Default)]
pub struct StoreArgs {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Bucket name
    #[arg(short, long, global = true)]
    pub bucket: Option<String>,

    /// Hash function name (SHA-256 or BLAKE3)
    #[arg(long, global = true)]
    pub hash: Option<String>,

    /// Materialize payloads off-heap
    #[arg(long, global = true)]
    pub direct: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store files and print their keys
    Put(PutArgs),
    /// Write the content stored under a key
    Get(GetArgs),
    /// Report which keys are stored
    Contains(ContainsArgs),
    /// Store every file of a zip archive
    Zip(ZipArgs),
    /// Show store configuration and size
    Stat,
}

#[derive(Args, Debug)]
pub struct PutArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    #[arg(value_parser = parse_key)]
    pub key: ContentKey,
    /// Output file (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ContainsArgs {
    #[arg(required = true, value_parser = parse_key)]
    pub keys: Vec<ContentKey>,
}

#[derive(Args, Debug)]
pub struct ZipArgs {
    pub archive: PathBuf,
    /// Gzip entries that shrink when compressed
    #[arg(long)]
    pub gzip: bool,
}

fn parse_key(value: &str) -> Result<ContentKey, TypeError> {
    ContentKey::from_hex(value)
}
