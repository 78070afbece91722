//! Persistent state for Loreforge.
//!
//! - [`CanonicalStore`]: the JSON content store, mutated only by the merge engine
//! - [`AppendLog`]: append-only JSONL logs for merge decisions and provenance
//! - [`RunRegistry`]: libSQL index of runs and their per-stage counts

mod log;
mod migrations;
mod registry;
mod store;

pub use log::AppendLog;
pub use registry::{RunEntry, RunRegistry, RunStatus, StageEntry};
pub use store::{CanonicalStore, StoreModule};

/// File name of the run registry inside the runs directory.
pub const REGISTRY_FILE_NAME: &str = "registry.db";
