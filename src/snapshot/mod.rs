//! # Snapshots
//!
//! Persisted responses used as comparison baselines. Bodies are normalized
//! by a content-type [`Formatter`] before being stored, and compared through
//! the same formatter so that a response always matches its own snapshot.

pub mod diff;
pub mod formatter;
pub mod store;
pub mod text_diff;

pub use diff::{BodyDiff, HeaderDiff, JsonDiff, JsonMismatch, SnapshotDiff, StatusDiff};
pub use formatter::{Formatter, FormatterRegistry};
pub use store::{
    sanitize, SaveOutcome, SnapshotFile, SnapshotMetadata, SnapshotOutcome, SnapshotStats,
    SnapshotStore, SNAPSHOT_EXTENSION,
};
