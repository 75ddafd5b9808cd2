//! Subtree Backup Library
//!
//! Incremental archival of a directory tree into an object store, one
//! independently fingerprinted unit per subtree.

pub mod archive;
pub mod config;
pub mod executor;
pub mod fingerprint;
pub mod fs;
pub mod remote;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{FileConfig, Overrides, RunConfig};
pub use executor::{Executor, RunReport, UnitOutcome};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
