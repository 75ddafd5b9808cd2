//! Unit-splitting traversal and per-unit file enumeration.
//!
//! The traversal turns a source root and a split depth into an ordered
//! sequence of [`BackupUnit`]s. Each unit is later expanded into a [`FileSet`],
//! which is the exact scope used for both fingerprinting and archiving.

use crate::fs::unit_path::LogicalPath;
use crate::utils::errors::{BackupError, Result};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory names skipped at every depth.
const EXCLUDED_DIRS: &[&str] = &[
    "lost+found",
    ".Trash",
    ".Trashes",
    "$RECYCLE.BIN",
    "System Volume Information",
    "@eaDir",
    "#recycle",
    "#snapshot",
    ".snapshot",
];

/// Per-user trash folders on removable media (`.Trash-1000`).
const EXCLUDED_DIR_PREFIXES: &[&str] = &[".Trash-"];

/// Logical name segment used for a directory's loose-files unit.
pub const LOOSE_FILES_NAME: &str = "_files";

/// Check if a directory name belongs to a system or trash area
pub fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name) || EXCLUDED_DIR_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// What part of the filesystem a unit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitScope {
    /// The source root is a single file.
    SingleFile,
    /// Only the files directly inside a directory.
    LooseFiles,
    /// A directory and everything below it.
    Tree,
}

/// One independently fingerprinted, archived and uploaded slice of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupUnit {
    /// Absolute path of the file or directory the unit covers
    pub source_path: PathBuf,

    /// Remote key suffix under the backup name
    pub logical_name: LogicalPath,

    pub scope: UnitScope,

    /// Depth of the directory the unit was carved out at (root = 1, whole tree = 0)
    pub depth: usize,
}

impl BackupUnit {
    pub fn files_only(&self) -> bool {
        !matches!(self.scope, UnitScope::Tree)
    }

    /// Directory that archive entry names are relative to.
    pub fn archive_root(&self) -> &Path {
        match self.scope {
            UnitScope::SingleFile => self.source_path.parent().unwrap_or(Path::new("/")),
            UnitScope::LooseFiles | UnitScope::Tree => &self.source_path,
        }
    }
}

/// A file discovered inside a unit's scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path relative to the unit's archive root
    pub relative_path: LogicalPath,

    /// File size in bytes (link size for symlinks)
    pub size: u64,

    pub is_symlink: bool,
}

/// Sorted, deduplicated files of one unit.
#[derive(Debug, Clone)]
pub struct FileSet {
    root: PathBuf,
    entries: Vec<FileInfo>,
}

impl FileSet {
    pub fn new(root: PathBuf, mut entries: Vec<FileInfo>) -> Self {
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        entries.dedup_by(|a, b| a.relative_path == b.relative_path);
        Self { root, entries }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|f| f.size).sum()
    }

    /// Absolute path of an entry on disk.
    pub fn absolute(&self, entry: &FileInfo) -> PathBuf {
        self.root.join(entry.relative_path.as_str())
    }
}

/// Lazily yields backup units for a source root.
///
/// Directories are expanded from an explicit `(path, logical, depth)` stack so
/// deep trees never grow the call stack. Siblings are visited in byte-wise name
/// order. Two units with the same logical name are a configuration error, as
/// they would share one remote record. After the first error the walker yields
/// nothing more.
pub struct UnitWalker {
    split_depth: usize,
    stack: Vec<(PathBuf, LogicalPath, usize)>,
    pending: VecDeque<BackupUnit>,
    emitted: HashSet<LogicalPath>,
    failed: bool,
}

/// Plan the units for `root` at the given split depth.
///
/// Fails with an access error if the root itself cannot be read.
pub fn plan_units(root: &Path, split_depth: usize) -> Result<UnitWalker> {
    let root = fs::canonicalize(root).map_err(|e| BackupError::access(root, e))?;
    let metadata = fs::metadata(&root).map_err(|e| BackupError::access(&root, e))?;

    let mut walker = UnitWalker {
        split_depth,
        stack: Vec::new(),
        pending: VecDeque::new(),
        emitted: HashSet::new(),
        failed: false,
    };

    if !metadata.is_dir() {
        walker.pending.push_back(BackupUnit {
            logical_name: root_name(&root)?,
            source_path: root,
            scope: UnitScope::SingleFile,
            depth: 0,
        });
    } else if split_depth == 0 {
        walker.pending.push_back(BackupUnit {
            logical_name: root_name(&root)?,
            source_path: root,
            scope: UnitScope::Tree,
            depth: 0,
        });
    } else {
        walker.stack.push((root, LogicalPath::root(), 1));
    }

    Ok(walker)
}

fn root_name(root: &Path) -> Result<LogicalPath> {
    match root.file_name() {
        Some(name) => LogicalPath::from_relative(Path::new(name)),
        None => LogicalPath::normalize("root"),
    }
}

/// Immediate children of a directory, split into loose files and subdirectories.
struct DirListing {
    has_files: bool,
    subdirs: Vec<String>,
}

fn list_dir(dir: &Path) -> Result<DirListing> {
    let mut has_files = false;
    let mut subdirs = Vec::new();

    for entry in fs::read_dir(dir).map_err(|e| BackupError::access(dir, e))? {
        let entry = entry.map_err(|e| BackupError::access(dir, e))?;
        let file_type = entry.file_type().map_err(|e| BackupError::access(entry.path(), e))?;

        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                BackupError::access(
                    entry.path(),
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "directory name is not valid UTF-8"),
                )
            })?;
            if is_excluded_dir(name) {
                tracing::debug!("Skipping system directory {}", entry.path().display());
                continue;
            }
            subdirs.push(name.to_string());
        } else if file_type.is_file() || file_type.is_symlink() {
            has_files = true;
        }
    }

    subdirs.sort();
    Ok(DirListing { has_files, subdirs })
}

impl UnitWalker {
    fn emit(&mut self, unit: BackupUnit) -> Result<()> {
        if !self.emitted.insert(unit.logical_name.clone()) {
            return Err(BackupError::Config(format!(
                "{} maps to unit '{}', which is already taken; rename the directory",
                unit.source_path.display(),
                unit.logical_name
            )));
        }
        self.pending.push_back(unit);
        Ok(())
    }

    fn expand(&mut self, dir: PathBuf, logical: LogicalPath, depth: usize) -> Result<()> {
        let listing = list_dir(&dir)?;

        // Loose files are emitted at intermediate depths too, otherwise they would
        // belong to no unit at all.
        if listing.has_files {
            self.emit(BackupUnit {
                source_path: dir.clone(),
                logical_name: logical.child(LOOSE_FILES_NAME)?,
                scope: UnitScope::LooseFiles,
                depth,
            })?;
        }

        if depth >= self.split_depth {
            for name in &listing.subdirs {
                self.emit(BackupUnit {
                    source_path: dir.join(name),
                    logical_name: logical.child(name)?,
                    scope: UnitScope::Tree,
                    depth,
                })?;
            }
        } else {
            for name in listing.subdirs.iter().rev() {
                self.stack.push((dir.join(name), logical.child(name)?, depth + 1));
            }
        }

        Ok(())
    }
}

impl Iterator for UnitWalker {
    type Item = Result<BackupUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(Ok(unit));
            }

            let (dir, logical, depth) = self.stack.pop()?;
            if let Err(e) = self.expand(dir, logical, depth) {
                self.failed = true;
                self.stack.clear();
                self.pending.clear();
                return Some(Err(e));
            }
        }
    }
}

/// Enumerate the files a unit covers.
///
/// Any unreadable directory or file metadata is an access error: a partial
/// listing would silently drop files from the backup.
pub fn collect_file_set(unit: &BackupUnit) -> Result<FileSet> {
    let root = unit.archive_root().to_path_buf();

    let entries = match unit.scope {
        UnitScope::SingleFile => {
            let metadata = fs::symlink_metadata(&unit.source_path)
                .map_err(|e| BackupError::access(&unit.source_path, e))?;
            let name = unit.source_path.file_name().map(Path::new).unwrap_or(Path::new(""));
            vec![FileInfo {
                relative_path: LogicalPath::from_relative(name)?,
                size: metadata.len(),
                is_symlink: metadata.is_symlink(),
            }]
        }
        UnitScope::LooseFiles => {
            let mut entries = Vec::new();
            let dir = &unit.source_path;
            for entry in fs::read_dir(dir).map_err(|e| BackupError::access(dir, e))? {
                let entry = entry.map_err(|e| BackupError::access(dir, e))?;
                let metadata = fs::symlink_metadata(entry.path())
                    .map_err(|e| BackupError::access(entry.path(), e))?;
                if metadata.is_file() || metadata.is_symlink() {
                    entries.push(FileInfo {
                        relative_path: LogicalPath::from_relative(Path::new(&entry.file_name()))?,
                        size: metadata.len(),
                        is_symlink: metadata.is_symlink(),
                    });
                }
            }
            entries
        }
        UnitScope::Tree => {
            let mut entries = Vec::new();
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    !(e.depth() > 0
                        && e.file_type().is_dir()
                        && e.file_name().to_str().is_some_and(is_excluded_dir))
                });

            for entry in walker {
                let entry = entry?;
                let file_type = entry.file_type();
                if !(file_type.is_file() || file_type.is_symlink()) {
                    continue;
                }
                let metadata = entry.metadata()?;
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                entries.push(FileInfo {
                    relative_path: LogicalPath::from_relative(relative)?,
                    size: metadata.len(),
                    is_symlink: file_type.is_symlink(),
                });
            }
            entries
        }
    };

    Ok(FileSet::new(root, entries))
}
