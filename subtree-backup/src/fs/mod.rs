//! Source tree traversal.

pub mod unit_path;
pub mod walker;

pub use unit_path::LogicalPath;
pub use walker::{collect_file_set, plan_units, BackupUnit, FileInfo, FileSet, UnitScope, UnitWalker};
