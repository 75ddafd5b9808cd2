//! Integrity checks for materialized archives.

use crate::fs::FileSet;
use crate::utils::errors::{BackupError, Result};
use async_compression::tokio::bufread::GzipDecoder;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use tokio::io::BufReader;
use tokio_util::io::SyncIoBridge;
use tracing::info;

/// How many offending names an error message lists.
const MAX_REPORTED_NAMES: usize = 10;

/// Check that `path` decompresses and untars in full and holds exactly the
/// files of `expected`, by count and by name.
pub async fn validate_archive(path: &Path, expected: &FileSet) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| BackupError::Validation(format!("cannot open {}: {}", path.display(), e)))?;

    let decoder = GzipDecoder::new(BufReader::new(file));
    let bridge = SyncIoBridge::new(decoder);
    let found = tokio::task::spawn_blocking(move || list_entries(bridge)).await??;

    if found.len() != expected.len() {
        return Err(BackupError::Validation(format!(
            "{} lists {} entries, expected {}",
            path.display(),
            found.len(),
            expected.len()
        )));
    }

    let found: BTreeSet<&str> = found.iter().map(String::as_str).collect();
    let wanted: BTreeSet<&str> = expected.entries().iter().map(|f| f.relative_path.as_str()).collect();
    let missing: Vec<&str> = wanted.difference(&found).copied().collect();
    let extra: Vec<&str> = found.difference(&wanted).copied().collect();

    if !missing.is_empty() || !extra.is_empty() {
        return Err(BackupError::Validation(format!(
            "{} does not match its file set (missing: [{}], extra: [{}])",
            path.display(),
            summarize(&missing),
            summarize(&extra)
        )));
    }

    info!("Validation passed for {} ({} entries)", path.display(), found.len());
    Ok(())
}

fn summarize(names: &[&str]) -> String {
    let mut shown = names.iter().take(MAX_REPORTED_NAMES).copied().collect::<Vec<_>>().join(", ");
    if names.len() > MAX_REPORTED_NAMES {
        shown.push_str(&format!(", ... {} more", names.len() - MAX_REPORTED_NAMES));
    }
    shown
}

fn unreadable(err: std::io::Error) -> BackupError {
    BackupError::Validation(format!("archive is not readable: {}", err))
}

/// Read every entry in full and return the names of non-directory entries.
fn list_entries<R: Read>(reader: R) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();

    for entry in archive.entries().map_err(unreadable)? {
        let mut entry = entry.map_err(unreadable)?;
        std::io::copy(&mut entry, &mut std::io::sink()).map_err(unreadable)?;
        if entry.header().entry_type() != tar::EntryType::Directory {
            let name = entry.path().map_err(unreadable)?;
            names.push(name.to_string_lossy().trim_end_matches('/').to_string());
        }
    }

    // Drain the tail so the gzip trailer checksum is verified too
    let mut rest = archive.into_inner();
    std::io::copy(&mut rest, &mut std::io::sink()).map_err(unreadable)?;

    Ok(names)
}
