//! Content fingerprints over a unit's file-name set.
//!
//! Only relative names are hashed, not file contents, so fingerprinting stays
//! cheap on very large trees. In-place edits that keep the listing unchanged
//! are therefore not detected.

use crate::fs::FileSet;
use crate::utils::errors::{BackupError, Result};
use md5::{Digest, Md5};
use rayon::prelude::*;
use std::fmt;

/// MD5 digest identifying a unit's file set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFingerprint([u8; 16]);

impl ContentFingerprint {
    /// Reserved value for an empty file set (MD5 of zero bytes).
    pub const EMPTY: ContentFingerprint = ContentFingerprint([
        0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8, 0x42, 0x7e,
    ]);

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(text.trim(), &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Parse a remote `.md5` companion: the first whitespace-separated token.
    pub fn parse_companion(text: &str) -> Option<Self> {
        text.split_whitespace().next().and_then(Self::from_hex)
    }

    /// Body of the `.md5` companion object, in `md5sum` layout.
    pub fn companion_body(&self, archive_name: &str) -> String {
        format!("{}  {}\n", self.to_hex(), archive_name)
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentFingerprint({})", self.to_hex())
    }
}

/// Hashes file names on a bounded worker pool.
pub struct Fingerprinter {
    pool: rayon::ThreadPool,
}

impl Fingerprinter {
    /// `workers == 0` means one worker per available CPU core.
    pub fn new(workers: usize) -> Result<Self> {
        let workers = if workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            workers
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("fingerprint-{}", i))
            .build()
            .map_err(|e| BackupError::Config(format!("cannot start hashing pool: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Fingerprint a file set.
    ///
    /// Per-name digests are computed in parallel; `collect` on an indexed
    /// parallel iterator keeps them in the set's sorted order, so the combined
    /// digest does not depend on worker count or completion order.
    pub fn fingerprint(&self, files: &FileSet) -> ContentFingerprint {
        if files.is_empty() {
            return ContentFingerprint::EMPTY;
        }

        let digests: Vec<[u8; 16]> = self.pool.install(|| {
            files
                .entries()
                .par_iter()
                .map(|f| Md5::digest(f.relative_path.as_str().as_bytes()).into())
                .collect()
        });

        let mut hasher = Md5::new();
        for digest in &digests {
            hasher.update(digest);
        }
        ContentFingerprint(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileInfo, LogicalPath};
    use std::path::PathBuf;

    fn set_of(names: &[&str]) -> FileSet {
        let entries = names
            .iter()
            .map(|n| FileInfo {
                relative_path: LogicalPath::normalize(n).unwrap(),
                size: 1,
                is_symlink: false,
            })
            .collect();
        FileSet::new(PathBuf::from("/data"), entries)
    }

    #[test]
    fn test_empty_sentinel() {
        let fp = Fingerprinter::new(2).unwrap();
        let empty = fp.fingerprint(&set_of(&[]));
        assert!(empty.is_empty());
        assert_eq!(empty.to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
        let md5_of_nothing: [u8; 16] = Md5::digest(b"").into();
        assert_eq!(ContentFingerprint(md5_of_nothing), ContentFingerprint::EMPTY);
    }

    #[test]
    fn test_deterministic_across_worker_counts() {
        let names: Vec<String> = (0..500).map(|i| format!("dir{}/file{:04}.bin", i % 7, i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let mut reversed = refs.clone();
        reversed.reverse();

        let one = Fingerprinter::new(1).unwrap().fingerprint(&set_of(&refs));
        let many = Fingerprinter::new(8).unwrap().fingerprint(&set_of(&reversed));
        assert_eq!(one, many);
        assert!(!one.is_empty());
    }

    #[test]
    fn test_changes_with_file_set() {
        let fp = Fingerprinter::new(0).unwrap();
        let base = fp.fingerprint(&set_of(&["a.txt", "b/c.txt"]));
        let added = fp.fingerprint(&set_of(&["a.txt", "b/c.txt", "b/d.txt"]));
        let renamed = fp.fingerprint(&set_of(&["a.txt", "b/C.txt"]));
        assert_ne!(base, added);
        assert_ne!(base, renamed);

        // Duplicates collapse in the file set
        let dup = fp.fingerprint(&set_of(&["a.txt", "a.txt", "b/c.txt"]));
        assert_eq!(base, dup);
    }

    #[test]
    fn test_companion_round_trip() {
        let fp = Fingerprinter::new(1).unwrap().fingerprint(&set_of(&["x"]));
        let body = fp.companion_body("x.tar.gz");
        assert!(body.ends_with("  x.tar.gz\n"));
        assert_eq!(ContentFingerprint::parse_companion(&body), Some(fp));
        assert_eq!(ContentFingerprint::parse_companion(&format!("{}\n", fp)), Some(fp));
        assert_eq!(ContentFingerprint::parse_companion("garbage"), None);
        assert_eq!(ContentFingerprint::parse_companion(""), None);
    }
}
