//! Remote object stores and the key layout of a unit's record.
//!
//! Every unit is persisted as three sibling objects:
//!
//! ```text
//! {backup}/{unit}.tar.gz        archive, operator-chosen storage class
//! {backup}/{unit}.tar.gz.md5    fingerprint companion, fast-access class
//! {backup}/{unit}_files.txt     listing companion, fast-access class
//! ```

pub mod aws_cli;
pub mod http;
pub mod local;
pub mod memory;

use crate::fs::LogicalPath;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub use aws_cli::AwsCliStore;
pub use http::HttpStore;
pub use local::LocalStore;
pub use memory::MemoryStore;

/// Storage class for companions, read on every run.
pub const FAST_STORAGE_CLASS: &str = "STANDARD";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Most parts a single multipart upload may have.
pub const MAX_CHUNKS: u64 = 10_000;
/// Smallest part the transport accepts.
pub const MIN_CHUNK_SIZE: u64 = 5 * MIB;
/// Largest part the transport accepts.
pub const MAX_CHUNK_SIZE: u64 = 5 * GIB;

/// Owned byte source handed to a store.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Upload part sizing derived from the maximum unit size budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Bytes per upload part (whole MiB)
    pub chunk_size: u64,

    /// Configured budget for one archive, in bytes
    pub max_object_size: u64,
}

impl ChunkPlan {
    /// Smallest whole-MiB part size keeping a `max_size_gib` archive under
    /// [`MAX_CHUNKS`] parts.
    pub fn for_budget(max_size_gib: u64) -> Result<Self> {
        if max_size_gib == 0 {
            return Err(BackupError::Config("max unit size must be at least 1 GiB".into()));
        }

        let max_object_size = max_size_gib
            .checked_mul(GIB)
            .ok_or_else(|| BackupError::Config(format!("max unit size {} GiB is too large", max_size_gib)))?;

        let raw = max_object_size.div_ceil(MAX_CHUNKS);
        let chunk_size = (raw.div_ceil(MIB) * MIB).max(MIN_CHUNK_SIZE);

        if chunk_size > MAX_CHUNK_SIZE {
            return Err(BackupError::Config(format!(
                "max unit size {} GiB needs {} byte parts, above the {} byte part limit",
                max_size_gib, chunk_size, MAX_CHUNK_SIZE
            )));
        }

        Ok(Self {
            chunk_size,
            max_object_size,
        })
    }
}

/// Per-object upload settings.
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub storage_class: String,
    pub chunk_plan: ChunkPlan,
}

impl PutOptions {
    /// Same part sizing, fast-access storage class.
    pub fn companion(&self) -> Self {
        Self {
            storage_class: FAST_STORAGE_CLASS.to_string(),
            chunk_plan: self.chunk_plan,
        }
    }
}

/// Object keys of one unit's remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKeys {
    pub archive: String,
    pub fingerprint: String,
    pub listing: String,
}

impl RemoteKeys {
    pub fn new(backup_name: &LogicalPath, unit: &LogicalPath) -> Self {
        let base = if backup_name.is_root() {
            unit.to_string()
        } else {
            format!("{}/{}", backup_name, unit)
        };
        let archive = format!("{}.tar.gz", base);
        Self {
            fingerprint: format!("{}.md5", archive),
            listing: format!("{}_files.txt", base),
            archive,
        }
    }

    /// Final segment of the archive key, as recorded in the `.md5` companion.
    pub fn archive_file_name(&self) -> &str {
        self.archive.rsplit('/').next().unwrap_or(&self.archive)
    }
}

/// Minimal object store used by the change detector and uploader.
///
/// Implementations perform each call as one independent remote operation; there
/// is no multi-object transaction and no retry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    /// Read a whole object. Absence is `Ok(None)`, not an error.
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>>;

    /// Number of objects whose key is exactly `key`.
    async fn count(&self, key: &str) -> Result<usize>;

    /// Stream `body` into `key`, returning the number of bytes stored.
    async fn put_stream(&self, key: &str, body: ByteReader, options: &PutOptions) -> Result<u64>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Store a small in-memory object.
    async fn put_bytes(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<()> {
        self.put_stream(key, Box::pin(std::io::Cursor::new(data)), options).await?;
        Ok(())
    }
}

/// Where the backup is written, parsed from the bucket/target flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `s3://bucket` or a bare bucket name, via the `aws` CLI
    S3 { bucket: String },

    /// `http://` or `https://` base URL
    Http { base_url: String },

    /// `file:///dir` or any value containing a path separator
    Local { dir: PathBuf },
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BackupError::Config("bucket must not be empty".into()));
        }

        if let Some(rest) = raw.strip_prefix("s3://") {
            let bucket = rest.trim_end_matches('/');
            if bucket.is_empty() || bucket.contains('/') {
                return Err(BackupError::Config(format!("invalid S3 bucket '{}'", raw)));
            }
            return Ok(Target::S3 { bucket: bucket.to_string() });
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Target::Http { base_url: raw.trim_end_matches('/').to_string() });
        }

        if let Some(path) = raw.strip_prefix("file://") {
            return Ok(Target::Local { dir: PathBuf::from(path) });
        }

        if raw.contains('/') || raw.starts_with('.') {
            return Ok(Target::Local { dir: PathBuf::from(raw) });
        }

        Ok(Target::S3 { bucket: raw.to_string() })
    }

    /// Build the store for this target.
    pub fn open(&self, http_token: Option<String>) -> Result<Arc<dyn ObjectStore>> {
        Ok(match self {
            Target::S3 { bucket } => Arc::new(AwsCliStore::new(bucket.clone())),
            Target::Http { base_url } => Arc::new(HttpStore::new(base_url.clone(), http_token)?),
            Target::Local { dir } => Arc::new(LocalStore::new(dir.clone())),
        })
    }
}
