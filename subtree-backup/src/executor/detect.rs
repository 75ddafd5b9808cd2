//! Skip-or-rebuild decision for a unit.

use crate::fingerprint::ContentFingerprint;
use crate::remote::{ObjectStore, RemoteKeys};
use crate::utils::errors::Result;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Remote record matches; nothing to do
    Unchanged,
    Rebuild(RebuildReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// No fingerprint companion in the store
    NoRecord,
    /// Companion present but holds a different (or unreadable) fingerprint
    FingerprintChanged,
    /// Fingerprint matches but the archive object count is not exactly one
    ArchiveCount(usize),
}

/// Compare `local` against the unit's remote record.
///
/// Skips only when the stored fingerprint equals `local` and exactly one
/// archive object exists.
pub async fn detect_change(
    store: &dyn ObjectStore,
    keys: &RemoteKeys,
    local: &ContentFingerprint,
) -> Result<ChangeDecision> {
    let body = match store.fetch(&keys.fingerprint).await? {
        Some(body) => body,
        None => return Ok(ChangeDecision::Rebuild(RebuildReason::NoRecord)),
    };

    let text = String::from_utf8_lossy(&body);
    let remote = match ContentFingerprint::parse_companion(&text) {
        Some(fp) => fp,
        None => {
            warn!("Unreadable fingerprint companion at {}, rebuilding", keys.fingerprint);
            return Ok(ChangeDecision::Rebuild(RebuildReason::FingerprintChanged));
        }
    };

    if remote != *local {
        debug!("{}: remote {} != local {}", keys.archive, remote, local);
        return Ok(ChangeDecision::Rebuild(RebuildReason::FingerprintChanged));
    }

    match store.count(&keys.archive).await? {
        1 => Ok(ChangeDecision::Unchanged),
        n => {
            warn!("Fingerprint matches but {} archive object(s) at {}", n, keys.archive);
            Ok(ChangeDecision::Rebuild(RebuildReason::ArchiveCount(n)))
        }
    }
}
