//! Custom error types for the backup pipeline.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage a unit was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Fingerprint,
    ChangeDetection,
    Archive,
    Validation,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Fingerprint => "fingerprint",
            Phase::ChangeDetection => "change-detection",
            Phase::Archive => "archive",
            Phase::Validation => "validation",
            Phase::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot access {}: {source}", path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unit '{unit}' failed during {phase}: {source}")]
    Unit {
        unit: String,
        phase: Phase,
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    pub fn access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Access {
            path: path.into(),
            source,
        }
    }

    /// Attach the unit name and failing phase, unless already attached.
    pub fn in_unit(self, unit: &str, phase: Phase) -> Self {
        match self {
            e @ BackupError::Unit { .. } => e,
            other => BackupError::Unit {
                unit: unit.to_string(),
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Failures that end the run even when unit failures are tolerated.
    pub fn is_fatal(&self) -> bool {
        match self {
            BackupError::Config(_) | BackupError::Access { .. } => true,
            BackupError::Unit { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Failing phase, when the error is unit-scoped.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            BackupError::Unit { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Config(_) => 2,
            BackupError::Access { .. } => 3,
            BackupError::Validation(_) => 4,
            BackupError::Transport(_) => 5,
            BackupError::Io(_) => 1,
            BackupError::Unit { source, .. } => source.exit_code(),
        }
    }
}

impl From<walkdir::Error> for BackupError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
        BackupError::Access { path, source }
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackupError::Io(std::io::Error::other(format!("worker task failed: {}", err)))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
