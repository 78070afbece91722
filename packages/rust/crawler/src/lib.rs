//! Wiki crawler.
//!
//! This crate provides:
//! - [`Crawler`]: breadth-first, bounded-concurrency traversal from seeds
//! - [`RateLimiter`]: the minimum-interval limiter shared by all workers
//! - [`extract_sections`]: heading-bounded sections from rendered HTML
//!
//! Per-page failures never surface as errors; they are returned as
//! [`CrawlSkip`] entries next to the fetched pages.

mod api;
pub mod engine;
pub mod rate_limit;
pub mod sections;

pub use api::FetchFailure;
pub use engine::{
    CrawlOutput, CrawlProgress, CrawlSkip, CrawlStats, Crawler, NoProgress, SkipReason,
    content_hash,
};
pub use rate_limit::RateLimiter;
pub use sections::{extract_sections, split_entry};
