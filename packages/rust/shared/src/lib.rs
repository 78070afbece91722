//! Shared types, error model, and configuration for Loreforge.
//!
//! This crate is the foundation depended on by all other Loreforge crates.
//! It provides:
//! - [`LoreforgeError`]: the unified error type
//! - Stage records ([`Seed`], [`FetchedPage`], [`CandidateRecord`],
//!   [`CanonicalRecord`], [`MergeDecision`], [`ProvenanceRecord`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`MergeConfig`], config loading)
//! - Wiki title/URL conventions ([`wiki`])

pub mod config;
pub mod error;
pub mod types;
pub mod wiki;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CollisionPolicy, ConflictPolicy, CrawlConfig, CrawlSection, EvaluateConfig,
    EvaluationThresholds, MergeConfig, MergeSection, NormalizeSection, PathsConfig, SeedsConfig,
    SourceConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{LoreforgeError, Result};
pub use types::{
    CURRENT_SCHEMA_VERSION, CandidateRecord, CandidateSignals, CanonicalRecord, EvaluationResult,
    FetchedPage, MergeDecision, NearestMatch, PageSection, ProvenanceRecord, ReasonCode,
    Recommendation, RunId, SectionTable, Seed, SeedOrigin, SourceRef, SpecEntry, Verdict,
};
