//! Utility modules for the backup pipeline.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Phase, Result};
