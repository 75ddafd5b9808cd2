//! Configuration for a backup run.
//!
//! Defaults come from an optional TOML file; command-line values override them.
//! The merge produces an immutable [`RunConfig`] that is threaded through the
//! whole run.

use crate::fs::LogicalPath;
use crate::remote::{ChunkPlan, PutOptions, Target};
use crate::utils::errors::{BackupError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of the `--config` file. Every section and key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub target: TargetConfig,
    pub backup: BackupConfig,
    pub validation: ValidationConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Bucket name, `s3://`, `http(s)://` or `file://` target
    pub bucket: Option<String>,

    /// Storage class for archives
    pub storage_class: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Where materialized archives are written
    pub scratch_dir: PathBuf,

    /// Largest expected archive, in GiB
    pub max_size_gb: u64,

    /// Fingerprint worker threads (0 = one per core)
    pub hash_workers: usize,

    pub split_depth: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub keep_local_copy: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

// Default values
fn default_storage_class() -> String {
    "DEEP_ARCHIVE".to_string()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_max_size_gb() -> u64 {
    1024
}

fn default_split_depth() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            storage_class: default_storage_class(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            max_size_gb: default_max_size_gb(),
            hash_workers: 0,
            split_depth: default_split_depth(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }
}

/// Values given on the command line. `None`/`false` defers to the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bucket: Option<String>,
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub storage_class: Option<String>,
    pub max_size_gb: Option<u64>,
    pub split_depth: Option<usize>,
    pub dry_run: bool,
    pub validate: bool,
    pub keep_local: bool,
    pub keep_going: bool,
    pub scratch_dir: Option<PathBuf>,
    pub hash_workers: Option<usize>,
    pub http_token: Option<String>,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: Target,

    /// Remote prefix every key lives under
    pub backup_name: LogicalPath,

    pub source: PathBuf,
    pub storage_class: String,
    pub chunk_plan: ChunkPlan,
    pub split_depth: usize,
    pub dry_run: bool,
    pub validate: bool,
    pub keep_local: bool,
    pub keep_going: bool,
    pub scratch_dir: PathBuf,
    pub hash_workers: usize,
    pub http_token: Option<String>,
}

impl RunConfig {
    /// Merge command-line values over file defaults.
    ///
    /// Missing target, backup name or source path is a configuration error.
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let bucket = cli
            .bucket
            .or(file.target.bucket)
            .ok_or_else(|| BackupError::Config("missing required --bucket".into()))?;
        let name = cli
            .name
            .ok_or_else(|| BackupError::Config("missing required --name".into()))?;
        let source = cli
            .path
            .ok_or_else(|| BackupError::Config("missing required --path".into()))?;

        let backup_name = LogicalPath::normalize(&name)?;
        if backup_name.is_root() {
            return Err(BackupError::Config("backup name must not be empty".into()));
        }

        let storage_class = cli.storage_class.unwrap_or(file.target.storage_class);
        if storage_class.trim().is_empty() {
            return Err(BackupError::Config("storage class must not be empty".into()));
        }

        let chunk_plan = ChunkPlan::for_budget(cli.max_size_gb.unwrap_or(file.backup.max_size_gb))?;

        Ok(Self {
            target: Target::parse(&bucket)?,
            backup_name,
            source,
            storage_class,
            chunk_plan,
            split_depth: cli.split_depth.unwrap_or(file.backup.split_depth),
            dry_run: cli.dry_run,
            validate: cli.validate || file.validation.enabled,
            keep_local: cli.keep_local || file.validation.keep_local_copy,
            keep_going: cli.keep_going,
            scratch_dir: cli.scratch_dir.unwrap_or(file.backup.scratch_dir),
            hash_workers: cli.hash_workers.unwrap_or(file.backup.hash_workers),
            http_token: cli.http_token,
        })
    }

    /// Archives are written to scratch space before upload.
    pub fn materialize(&self) -> bool {
        self.validate || self.keep_local
    }

    /// Upload settings for archive objects.
    pub fn archive_put_options(&self) -> PutOptions {
        PutOptions {
            storage_class: self.storage_class.clone(),
            chunk_plan: self.chunk_plan,
        }
    }

    /// Scratch location of a unit's materialized archive.
    pub fn scratch_path(&self, unit: &LogicalPath) -> PathBuf {
        self.scratch_dir
            .join(self.backup_name.as_str())
            .join(format!("{}.tar.gz", unit))
    }
}
