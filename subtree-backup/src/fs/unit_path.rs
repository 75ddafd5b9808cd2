//! Forward-slash logical paths shared by traversal, file sets and remote keys.

use crate::utils::errors::{BackupError, Result};
use std::fmt;
use std::path::{Component, Path};

/// A normalized, relative, `/`-separated path.
///
/// No leading or trailing separators, no empty, `.` or `..` segments. Ordering
/// is byte-wise on the UTF-8 form, which is the collation used for file sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogicalPath(String);

impl LogicalPath {
    /// The empty path (the traversal root itself).
    pub fn root() -> Self {
        Self(String::new())
    }

    /// The single normalization routine. Accepts `/` or `\` separators.
    pub fn normalize(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(BackupError::Config(format!(
                        "path '{}' must not contain '..'",
                        raw
                    )))
                }
                s => segments.push(s),
            }
        }
        Ok(Self(segments.join("/")))
    }

    /// Build from a filesystem path relative to some root.
    pub fn from_relative(path: &Path) -> Result<Self> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        BackupError::access(
                            path,
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "file name is not valid UTF-8",
                            ),
                        )
                    })?;
                    segments.push(name);
                }
                Component::CurDir => continue,
                _ => {
                    return Err(BackupError::Config(format!(
                        "expected a relative path, got {}",
                        path.display()
                    )))
                }
            }
        }
        // Normal components are never empty, `.` or `..`, and a backslash in a
        // Unix file name stays part of the name
        Ok(Self(segments.join("/")))
    }

    /// Append exactly one segment, taken verbatim.
    ///
    /// A `\` inside a directory name stays part of that name.
    pub fn child(&self, segment: &str) -> Result<Self> {
        if matches!(segment, "" | "." | "..") || segment.contains('/') {
            return Err(BackupError::Config(format!(
                "'{}' is not a single path segment",
                segment
            )));
        }
        if self.0.is_empty() {
            Ok(Self(segment.to_string()))
        } else {
            Ok(Self(format!("{}/{}", self.0, segment)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Final segment, or the empty string for the root.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
