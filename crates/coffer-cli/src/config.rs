use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use coffer_crypto::HashFunction;
use coffer_redb::RedbOptions;
use coffer_store::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::cli::StoreArgs;

/// Settings for the `coffer` binary.
///
/// Loaded from a TOML file when one is given; command-line flags override
/// individual values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CofferConfig {
    /// Database file.
    pub database: PathBuf,
    /// Bucket (table) within the database.
    pub bucket: String,
    /// Name of the hash function deriving keys.
    pub hash_function: String,
    /// Materialize values read from disk off-heap.
    pub direct: bool,
    /// redb page cache size in bytes.
    pub cache_size: Option<usize>,
    /// Front cache over the bucket; none when absent.
    pub cache: Option<CacheConfig>,
}

impl Default for CofferConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("coffer.redb"),
            bucket: "blobs".to_string(),
            hash_function: HashFunction::sha256().name().to_string(),
            direct: false,
            cache_size: None,
            cache: None,
        }
    }
}

impl CofferConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// The configuration named by `--config` (or defaults) with flag
    /// overrides applied.
    pub fn resolve(args: &StoreArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(args);
        Ok(config)
    }

    pub fn apply(&mut self, args: &StoreArgs) {
        if let Some(db) = &args.db {
            self.database = db.clone();
        }
        if let Some(bucket) = &args.bucket {
            self.bucket = bucket.clone();
        }
        if let Some(hash) = &args.hash {
            self.hash_function = hash.clone();
        }
        if args.direct {
            self.direct = true;
        }
    }

    pub fn hash_function(&self) -> anyhow::Result<&'static HashFunction> {
        Ok(HashFunction::get(&self.hash_function)?)
    }

    pub fn redb_options(&self) -> anyhow::Result<RedbOptions> {
        let mut options = RedbOptions::default()
            .direct(self.direct)
            .hash_function(self.hash_function()?)
            .table(self.bucket.clone());
        if let Some(bytes) = self.cache_size {
            options = options.cache_size(bytes);
        }
        Ok(options)
    }
}
