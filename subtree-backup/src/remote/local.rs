//! Directory-backed object store.
//!
//! Keys map onto relative paths below the store root. Objects are written to a
//! `.partial` sibling and renamed into place, so a reader never sees a
//! half-written archive under its final key.

use super::{ByteReader, ObjectStore, PutOptions};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Upper bound for the write buffer regardless of the part size.
const MAX_WRITE_BUFFER: u64 = 8 * 1024 * 1024;

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(BackupError::Transport(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

fn transport(op: &str, key: &str, err: std::io::Error) -> BackupError {
    BackupError::Transport(format!("{} {}: {}", op, key, err))
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transport("read", key, e)),
        }
    }

    async fn count(&self, key: &str) -> Result<usize> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(usize::from(meta.is_file())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(transport("stat", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(transport("remove", key, e)),
        }
    }

    async fn put_stream(&self, key: &str, mut body: ByteReader, options: &PutOptions) -> Result<u64> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transport("mkdir for", key, e))?;
        }

        let partial = path.with_file_name(format!(
            "{}.partial",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));

        let file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| transport("create", key, e))?;
        let capacity = options.chunk_plan.chunk_size.min(MAX_WRITE_BUFFER) as usize;
        let mut writer = BufWriter::with_capacity(capacity, file);

        let written = match tokio::io::copy(&mut body, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(transport("write", key, e));
            }
        };
        writer.flush().await.map_err(|e| transport("flush", key, e))?;
        writer.get_ref().sync_all().await.map_err(|e| transport("sync", key, e))?;
        drop(writer);

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| transport("rename", key, e))?;

        tracing::debug!(
            "Stored {} ({} bytes, storage class {} not applicable locally)",
            path.display(),
            written,
            options.storage_class
        );
        Ok(written)
    }
}
