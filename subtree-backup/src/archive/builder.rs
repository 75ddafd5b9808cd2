//! Gzip-compressed tar production for one unit.
//!
//! A blocking task writes the tar container into an in-memory pipe; the read
//! side is gzip-compressed on the fly. Callers either stream that reader
//! straight into a store or copy it into a scratch file.

use crate::fs::FileSet;
use crate::remote::ByteReader;
use crate::utils::errors::{BackupError, Result};
use async_compression::tokio::bufread::GzipEncoder;
use async_compression::Level;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

/// Bytes buffered between the tar writer and the compressor.
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Handle on the blocking tar writer.
pub struct TarProducer {
    handle: JoinHandle<Result<usize>>,
}

impl TarProducer {
    /// Wait for the writer and return the number of entries written.
    ///
    /// Must be awaited after the reader has been fully consumed (or dropped),
    /// otherwise the writer blocks on a full pipe.
    pub async fn finish(self) -> Result<usize> {
        self.handle.await?
    }
}

/// Start producing the archive for `files`.
///
/// If the producer fails, the reader returns an error at end of stream instead
/// of a clean EOF, so a store never commits a truncated archive.
///
/// Must be called from within a Tokio runtime.
pub fn stream_archive(files: Arc<FileSet>) -> (ByteReader, TarProducer) {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (status_tx, status_rx) = oneshot::channel();

    let handle = tokio::task::spawn_blocking(move || {
        let mut bridge = SyncIoBridge::new(writer);
        let result = write_tar(&files, &mut bridge);
        // Report before closing the pipe; the reader checks it on EOF
        let _ = status_tx.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        drop(bridge);
        result
    });

    let compressed = GzipEncoder::with_quality(BufReader::new(reader), Level::Default);
    let body = CheckedReader {
        inner: Box::pin(compressed),
        status: Some(status_rx),
    };

    (Box::pin(body), TarProducer { handle })
}

/// Passes bytes through and turns a failed producer into a read error at EOF.
struct CheckedReader {
    inner: ByteReader,
    status: Option<oneshot::Receiver<std::result::Result<(), String>>>,
}

impl AsyncRead for CheckedReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        ready!(self.inner.as_mut().poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let Some(status) = self.status.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let outcome = ready!(Pin::new(status).poll(cx));
        self.status = None;

        match outcome {
            Ok(Ok(())) => Poll::Ready(Ok(())),
            Ok(Err(message)) => Poll::Ready(Err(std::io::Error::other(format!(
                "archive producer failed: {}",
                message
            )))),
            Err(_) => Poll::Ready(Err(std::io::Error::other("archive producer exited without a status"))),
        }
    }
}

fn write_tar<W: Write>(files: &FileSet, out: W) -> Result<usize> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Complete);

    for entry in files.entries() {
        let path = files.absolute(entry);
        builder
            .append_path_with_name(&path, entry.relative_path.as_str())
            .map_err(|e| classify_write_error(&path, e))?;
    }

    let mut out = builder.into_inner().map_err(pipe_error)?;
    out.flush().map_err(pipe_error)?;

    debug!("Wrote {} tar entries from {}", files.len(), files.root().display());
    Ok(files.len())
}

/// The consumer hanging up is a transport problem; anything else came from
/// reading the source file.
fn classify_write_error(path: &Path, err: std::io::Error) -> BackupError {
    if err.kind() == std::io::ErrorKind::BrokenPipe {
        pipe_error(err)
    } else {
        BackupError::access(path, err)
    }
}

fn pipe_error(err: std::io::Error) -> BackupError {
    BackupError::Transport(format!("archive consumer closed the stream: {}", err))
}

/// True when the producer only failed because its consumer went away.
pub fn is_consumer_hangup(err: &BackupError) -> bool {
    matches!(err, BackupError::Transport(_))
}

/// An archive written to local scratch space.
#[derive(Debug)]
pub struct MaterializedArchive {
    pub path: PathBuf,
    pub size: u64,
    pub entries: usize,
}

impl MaterializedArchive {
    /// Open for upload.
    pub async fn open(&self) -> Result<ByteReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::pin(file))
    }

    /// Delete the scratch file.
    pub async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!("Failed to remove scratch archive {}: {}", self.path.display(), e);
        }
    }
}

/// Write the compressed archive for `files` to `dest`.
///
/// On failure the partial file is removed.
pub async fn materialize_archive(files: Arc<FileSet>, dest: &Path) -> Result<MaterializedArchive> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let result = write_to_file(files, dest).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

async fn write_to_file(files: Arc<FileSet>, dest: &Path) -> Result<MaterializedArchive> {
    let mut file = tokio::fs::File::create(dest).await?;
    let (size, entries) = copy_archive(files, &mut file).await?;

    file.flush().await?;
    file.sync_all().await?;

    Ok(MaterializedArchive {
        path: dest.to_path_buf(),
        size,
        entries,
    })
}

/// Copy the compressed archive into `out`, returning bytes written and entries.
async fn copy_archive<W: AsyncWrite + Unpin>(files: Arc<FileSet>, out: &mut W) -> Result<(u64, usize)> {
    let (mut reader, producer) = stream_archive(files);

    let copied = tokio::io::copy(&mut reader, out).await;
    drop(reader);
    let produced = producer.finish().await;

    match (copied, produced) {
        // A source read failure is the root cause of whatever the copy saw
        (_, Err(e)) if !is_consumer_hangup(&e) => Err(e),
        (Err(e), _) => Err(BackupError::Io(e)),
        (Ok(_), Err(e)) => Err(e),
        (Ok(size), Ok(entries)) => Ok((size, entries)),
    }
}

/// What the archive step hands to the upload step.
pub enum ArchiveArtifact {
    /// Compressed bytes still being produced; never persisted locally
    Streamed { body: ByteReader, producer: TarProducer },

    /// Written to scratch space first
    Materialized(MaterializedArchive),
}

impl ArchiveArtifact {
    /// Start streaming the archive for `files`.
    pub fn streamed(files: Arc<FileSet>) -> Self {
        let (body, producer) = stream_archive(files);
        ArchiveArtifact::Streamed { body, producer }
    }

    /// Write the archive for `files` to `dest` before upload.
    pub async fn materialized(files: Arc<FileSet>, dest: &Path) -> Result<Self> {
        Ok(ArchiveArtifact::Materialized(materialize_archive(files, dest).await?))
    }
}
