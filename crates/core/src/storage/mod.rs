//! Storage layer: checksummed bincode snapshots with atomic writes.
//!
//! Indexes, the lexical engine and codecs persist through
//! [`save_snapshot`] / [`load_snapshot`]; the file layout is opaque to callers.

/// Disk persistence: snapshot save/load with atomic writes.
pub mod persistence;

pub use persistence::{load_snapshot, save_snapshot};
