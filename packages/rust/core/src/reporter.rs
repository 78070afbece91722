//! Run manifests: per-stage counts, conservation checks, and persistence.
//!
//! A [`RunReporter`] collects one [`StageReport`] per stage as the run
//! progresses and produces a [`RunManifest`] at the end. [`record_run`]
//! writes the manifest to `<runs_dir>/<run_id>.json` and registers it in
//! the run registry so it can be listed and fetched by id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use loreforge_artifacts::{ArtifactRef, read_json, write_json};
use loreforge_crawler::CrawlStats;
use loreforge_normalizer::NormalizeStats;
use loreforge_seeds::CatalogSummary;
use loreforge_shared::{CURRENT_SCHEMA_VERSION, LoreforgeError, Result, RunId};
use loreforge_storage::{REGISTRY_FILE_NAME, RunRegistry, RunStatus, StageEntry};

use crate::evaluator::EvaluationReport;
use crate::merge::MergeStats;

// ---------------------------------------------------------------------------
// Stage reports
// ---------------------------------------------------------------------------

/// Counts and outputs for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub records_in: usize,
    pub records_out: usize,
    pub skipped: usize,
    #[serde(default)]
    pub skip_reasons: BTreeMap<String, usize>,
    #[serde(default)]
    pub outputs: Vec<ArtifactRef>,
    pub duration_ms: u64,
    /// Stage-specific statistics as written by the stage.
    #[serde(default)]
    pub stats: serde_json::Value,
}

impl StageReport {
    fn new(stage: &str, records_in: usize, records_out: usize, skipped: usize, stats: serde_json::Value) -> Self {
        Self {
            stage: stage.to_string(),
            records_in,
            records_out,
            skipped,
            skip_reasons: BTreeMap::new(),
            outputs: Vec::new(),
            duration_ms: 0,
            stats,
        }
    }

    pub fn seeds(summary: &CatalogSummary) -> Self {
        let mut report = Self::new(
            "seeds",
            summary.base_seed_count + summary.resolved_members,
            summary.expanded_seed_count,
            summary.failed_categories.len(),
            to_value(summary),
        );
        if !summary.failed_categories.is_empty() {
            report
                .skip_reasons
                .insert("category_failed".into(), summary.failed_categories.len());
        }
        report
    }

    pub fn crawl(stats: &CrawlStats) -> Self {
        let mut report = Self::new(
            "crawl",
            stats.seeds,
            stats.pages_fetched,
            stats.pages_skipped,
            to_value(stats),
        );
        report.skip_reasons = stats.skip_reasons.clone();
        report.duration_ms = stats.duration_ms;
        report
    }

    pub fn normalize(stats: &NormalizeStats) -> Self {
        let mut report = Self::new(
            "normalize",
            stats.pages_in,
            stats.candidates,
            stats.pages_skipped,
            to_value(stats),
        );
        report.skip_reasons = stats.skip_reasons.clone();
        report
    }

    /// The evaluator drops nothing; non-accepted recommendations are
    /// reported as `flagged` in the stats.
    pub fn evaluate(report: &EvaluationReport) -> Self {
        let mut stats = to_value(report);
        if let serde_json::Value::Object(map) = &mut stats {
            map.insert("flagged".into(), report.flagged().into());
        }
        Self::new(
            "evaluate",
            report.input_candidates,
            report.input_candidates,
            0,
            stats,
        )
    }

    pub fn merge(stats: &MergeStats) -> Self {
        let mut report = Self::new(
            "merge",
            stats.candidates_in,
            stats.new + stats.updated,
            stats.rejected,
            to_value(stats),
        );
        report.skip_reasons = stats.reject_reasons.clone();
        report
    }

    pub fn with_outputs(mut self, outputs: Vec<ArtifactRef>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Set the duration from a start instant, unless the stage measured its own.
    pub fn timed(mut self, started: Instant) -> Self {
        if self.duration_ms == 0 {
            self.duration_ms = started.elapsed().as_millis() as u64;
        }
        self
    }

    fn to_entry(&self, recorded_at: DateTime<Utc>) -> StageEntry {
        StageEntry {
            stage: self.stage.clone(),
            recorded_at,
            records_in: self.records_in as u64,
            records_out: self.records_out as u64,
            skipped: self.skipped as u64,
            stats: Some(self.stats.clone()),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Headline counts across stages; absent when the stage did not run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestCounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeds: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_fetched: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_skipped: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_normalized: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize_skipped: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_new: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_updated: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_rejected: Option<usize>,
}

/// Count-conservation checks. A check is `None` when its stages did not run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConservationCheck {
    /// Normalizer input = normalized + skipped.
    pub pages: Option<bool>,
    /// Merge input = new + updated + rejected.
    pub candidates: Option<bool>,
    /// Pages fetched by the crawl = pages read by the normalizer.
    pub crawl_to_normalize: Option<bool>,
    /// Candidates produced = candidates merged.
    pub normalize_to_merge: Option<bool>,
    pub ok: bool,
}

/// One JSON summary per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: RunId,
    /// `run` for a full pipeline run, otherwise the single stage executed.
    pub command: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Thresholds and policies in effect.
    #[serde(default)]
    pub thresholds: serde_json::Value,
    pub stages: Vec<StageReport>,
    pub counts: ManifestCounts,
    pub conservation: ConservationCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

// ---------------------------------------------------------------------------
// RunReporter
// ---------------------------------------------------------------------------

/// Collects stage results for one run.
#[derive(Debug)]
pub struct RunReporter {
    run_id: RunId,
    command: String,
    started_at: DateTime<Utc>,
    seeds: Vec<String>,
    thresholds: serde_json::Value,
    stages: Vec<StageReport>,
    counts: ManifestCounts,
    /// normalize: (pages_in, normalized, skipped)
    pages: Option<(usize, usize, usize)>,
    /// merge: (candidates_in, new, updated, rejected)
    merge: Option<(usize, usize, usize, usize)>,
}

impl RunReporter {
    pub fn new(run_id: RunId, command: impl Into<String>) -> Self {
        Self {
            run_id,
            command: command.into(),
            started_at: Utc::now(),
            seeds: Vec::new(),
            thresholds: serde_json::Value::Null,
            stages: Vec::new(),
            counts: ManifestCounts::default(),
            pages: None,
            merge: None,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn set_seeds(&mut self, seeds: Vec<String>) {
        self.seeds = seeds;
    }

    pub fn set_thresholds(&mut self, thresholds: serde_json::Value) {
        self.thresholds = thresholds;
    }

    pub fn record_seeds(&mut self, summary: &CatalogSummary, report: StageReport) {
        self.counts.seeds = Some(summary.expanded_seed_count);
        self.push(report);
    }

    pub fn record_crawl(&mut self, stats: &CrawlStats, report: StageReport) {
        self.counts.pages_fetched = Some(stats.pages_fetched);
        self.counts.pages_skipped = Some(stats.pages_skipped);
        self.push(report);
    }

    pub fn record_normalize(&mut self, stats: &NormalizeStats, report: StageReport) {
        self.counts.pages_normalized = Some(stats.pages_normalized);
        self.counts.normalize_skipped = Some(stats.pages_skipped);
        self.counts.candidates = Some(stats.candidates);
        self.pages = Some((stats.pages_in, stats.pages_normalized, stats.pages_skipped));
        self.push(report);
    }

    pub fn record_evaluate(&mut self, report_data: &EvaluationReport, report: StageReport) {
        self.counts.flagged = Some(report_data.flagged());
        if self.counts.candidates.is_none() {
            self.counts.candidates = Some(report_data.input_candidates);
        }
        self.push(report);
    }

    pub fn record_merge(&mut self, stats: &MergeStats, report: StageReport) {
        self.counts.merged_new = Some(stats.new);
        self.counts.merged_updated = Some(stats.updated);
        self.counts.merged_rejected = Some(stats.rejected);
        self.merge = Some((stats.candidates_in, stats.new, stats.updated, stats.rejected));
        self.push(report);
    }

    fn push(&mut self, report: StageReport) {
        info!(
            stage = %report.stage,
            records_in = report.records_in,
            records_out = report.records_out,
            skipped = report.skipped,
            "stage recorded"
        );
        self.stages.push(report);
    }

    /// Evaluate every conservation check the recorded stages allow.
    pub fn conservation(&self) -> ConservationCheck {
        let pages = self.pages.map(|(input, ok, skipped)| input == ok + skipped);
        let candidates = self
            .merge
            .map(|(input, new, updated, rejected)| input == new + updated + rejected);
        let crawl_to_normalize = match (self.counts.pages_fetched, self.pages) {
            (Some(fetched), Some((input, _, _))) => Some(fetched == input),
            _ => None,
        };
        let normalize_to_merge = match (self.counts.candidates, self.merge, self.pages) {
            (Some(produced), Some((input, ..)), Some(_)) => Some(produced == input),
            _ => None,
        };

        let ok = [pages, candidates, crawl_to_normalize, normalize_to_merge]
            .iter()
            .all(|c| c.unwrap_or(true));
        ConservationCheck {
            pages,
            candidates,
            crawl_to_normalize,
            normalize_to_merge,
            ok,
        }
    }

    /// Close the run. A failed conservation check is logged, not fatal.
    pub fn finish(self, status: RunStatus, error: Option<String>) -> RunManifest {
        let conservation = self.conservation();
        if !conservation.ok {
            warn!(run_id = %self.run_id, ?conservation, "count conservation check failed");
        }
        RunManifest {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: self.run_id,
            command: self.command,
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            seeds: self.seeds,
            thresholds: self.thresholds,
            stages: self.stages,
            counts: self.counts,
            conservation,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub fn manifest_path(runs_dir: &Path, run_id: &RunId) -> PathBuf {
    runs_dir.join(format!("{run_id}.json"))
}

/// Write the manifest and register the run with its stages.
#[instrument(skip_all, fields(run_id = %manifest.run_id))]
pub async fn record_run(runs_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = manifest_path(runs_dir, &manifest.run_id);
    write_json(&path, manifest)?;

    let registry = RunRegistry::open(&runs_dir.join(REGISTRY_FILE_NAME)).await?;
    let run_id = manifest.run_id.to_string();
    let thresholds = serde_json::to_string(&manifest.thresholds)
        .map_err(|e| LoreforgeError::Storage(format!("failed to serialize thresholds: {e}")))?;

    registry
        .start_run(&run_id, &manifest.command, Some(&thresholds))
        .await?;
    for stage in &manifest.stages {
        registry
            .record_stage(&run_id, &stage.to_entry(manifest.finished_at))
            .await?;
    }
    let path_str = path.to_string_lossy();
    registry
        .finish_run(&run_id, manifest.status, Some(path_str.as_ref()))
        .await?;

    info!(path = %path.display(), status = manifest.status.as_str(), "run manifest recorded");
    Ok(path)
}

/// Load a manifest by run id.
pub fn load_manifest(runs_dir: &Path, run_id: &RunId) -> Result<RunManifest> {
    read_json(&manifest_path(runs_dir, run_id))
}
