//! Archive construction, validation and listing companions.

pub mod builder;
pub mod listing;
pub mod validate;

pub use builder::{is_consumer_hangup, materialize_archive, stream_archive, ArchiveArtifact, MaterializedArchive, TarProducer};
pub use listing::render_listing;
pub use validate::validate_archive;
