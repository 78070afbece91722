//! End-to-end `run` pipeline: seeds → crawl → normalize → evaluate → merge.
//!
//! Stages run strictly in sequence; each stage's output is written to the
//! run's work directory before the next begins. The run manifest is recorded
//! whether the run succeeds or fails.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use loreforge_artifacts::{ArtifactRef, StageArtifacts, write_json, write_jsonl};
use loreforge_crawler::{CrawlProgress, Crawler};
use loreforge_normalizer::{Normalizer, RuleTable};
use loreforge_seeds::{
    CategoryResolver, SeedCatalogConfig, build_catalog, load_category_titles, load_seed_titles,
};
use loreforge_shared::{
    AppConfig, CrawlConfig, LoreforgeError, MergeConfig, Result, RunId, SeedsConfig, SourceConfig,
};
use loreforge_storage::{CanonicalStore, RunStatus};

use crate::evaluator::{EvaluatorConfig, evaluate};
use crate::merge::MergeEngine;
use crate::reporter::{RunManifest, RunReporter, StageReport, record_run};
use crate::similarity::LevenshteinScorer;

/// Configuration for [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Direct seed list (JSON).
    pub seeds_path: PathBuf,
    /// Category reference list (JSON), if any.
    pub categories_path: Option<PathBuf>,
    /// Rule table TOML.
    pub rules_path: PathBuf,
    /// Canonical store file.
    pub store_path: PathBuf,
    /// Directory for `<run_id>.json` manifests and the run registry.
    pub runs_dir: PathBuf,
    /// Directory for intermediate stage artifacts.
    pub work_dir: PathBuf,
    pub source: SourceConfig,
    pub seeds: SeedsConfig,
    pub crawl: CrawlConfig,
    pub evaluator: EvaluatorConfig,
    pub merge: MergeConfig,
}

impl PipelineConfig {
    /// Build from the resolved application config and the seed inputs.
    pub fn from_app(config: &AppConfig, seeds_path: PathBuf, categories_path: Option<PathBuf>) -> Self {
        Self {
            seeds_path,
            categories_path,
            rules_path: PathBuf::from(&config.normalize.rules_path),
            store_path: PathBuf::from(&config.paths.store),
            runs_dir: PathBuf::from(&config.paths.runs_dir),
            work_dir: PathBuf::from(&config.paths.work_dir),
            source: config.source.clone(),
            seeds: config.seeds.clone(),
            crawl: CrawlConfig::from(config),
            evaluator: EvaluatorConfig::from(config),
            merge: MergeConfig::from(config),
        }
    }

    /// Thresholds and policies recorded in the manifest.
    pub fn thresholds(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct Thresholds<'a> {
            duplicate_threshold: f64,
            conflict_policy: loreforge_shared::ConflictPolicy,
            collision_policy: loreforge_shared::CollisionPolicy,
            canon_allowed: &'a [String],
            excluded_categories: &'a [String],
            max_inserts: usize,
            max_updates: usize,
            max_depth: u32,
            max_pages: usize,
            evaluate: &'a loreforge_shared::EvaluateConfig,
        }

        serde_json::to_value(Thresholds {
            duplicate_threshold: self.merge.duplicate_threshold,
            conflict_policy: self.merge.conflict_policy,
            collision_policy: self.merge.collision_policy,
            canon_allowed: &self.merge.canon_allowed,
            excluded_categories: &self.merge.excluded_categories,
            max_inserts: self.merge.max_inserts,
            max_updates: self.merge.max_updates,
            max_depth: self.crawl.max_depth,
            max_pages: self.crawl.max_pages,
            evaluate: &self.evaluator.policy,
        })
        .unwrap_or_default()
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called after each crawled page.
    fn page_fetched(&self, title: &str, fetched: usize, cap: usize);
    /// Called when the run completes successfully.
    fn done(&self, manifest: &RunManifest);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_fetched(&self, _title: &str, _fetched: usize, _cap: usize) {}
    fn done(&self, _manifest: &RunManifest) {}
}

/// Run every stage once and record the manifest.
///
/// Per-item problems (fetch failures, unmapped pages, rejected candidates)
/// end up in the stage outputs. An `Err` means a stage could not read its
/// input or write its output, or the canonical store could not be opened or
/// persisted; a failed manifest is still recorded in that case.
#[instrument(skip_all, fields(seeds = %config.seeds_path.display(), store = %config.store_path.display()))]
pub async fn run_pipeline(config: &PipelineConfig, progress: &dyn ProgressReporter) -> Result<RunManifest> {
    let run_id = RunId::new();
    info!(%run_id, "starting run");

    let mut reporter = RunReporter::new(run_id.clone(), "run");
    reporter.set_thresholds(config.thresholds());

    match run_stages(config, &run_id, &mut reporter, progress).await {
        Ok(()) => {
            let manifest = reporter.finish(RunStatus::Succeeded, None);
            record_run(&config.runs_dir, &manifest).await?;
            progress.done(&manifest);
            info!(
                %run_id,
                conservation_ok = manifest.conservation.ok,
                "run complete"
            );
            Ok(manifest)
        }
        Err(e) => {
            warn!(%run_id, error = %e, "run failed");
            let manifest = reporter.finish(RunStatus::Failed, Some(e.to_string()));
            if let Err(record_err) = record_run(&config.runs_dir, &manifest).await {
                warn!(%run_id, error = %record_err, "could not record failed run");
            }
            Err(e)
        }
    }
}

async fn run_stages(
    config: &PipelineConfig,
    run_id: &RunId,
    reporter: &mut RunReporter,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let layout = StageArtifacts::in_dir(&config.work_dir, &run_id.to_string());

    // --- Stage 1: Seeds ---
    progress.phase("Building seed catalog");
    let started = Instant::now();
    let direct = load_seed_titles(&config.seeds_path, &config.source.wiki_host)?;
    let categories = match &config.categories_path {
        Some(path) => load_category_titles(path, &config.source.wiki_host)?,
        None => Vec::new(),
    };
    let resolver = CategoryResolver::new(
        &config.source.api_url,
        &config.source.user_agent,
        config.source.timeout_secs,
        config.seeds.members_per_category,
    )?;
    let catalog = build_catalog(
        &resolver,
        &direct,
        &categories,
        &SeedCatalogConfig {
            wiki_host: config.source.wiki_host.clone(),
            hop_budget: config.seeds.hop_budget,
        },
    )
    .await;
    if catalog.seeds.is_empty() {
        return Err(LoreforgeError::validation("seed catalog is empty: nothing to crawl"));
    }

    let seeds_out = layout.seeds();
    write_jsonl(&seeds_out, &catalog.seeds)?;
    reporter.set_seeds(catalog.seeds.iter().map(|s| s.title.clone()).collect());
    reporter.record_seeds(
        &catalog.summary,
        StageReport::seeds(&catalog.summary)
            .with_outputs(describe(&[seeds_out.as_path()])?)
            .timed(started),
    );

    // --- Stage 2: Crawl ---
    progress.phase("Crawling pages");
    let started = Instant::now();
    let crawler = Crawler::new(config.crawl.clone())?;
    let crawl_progress = PipelineCrawlProgress { inner: progress };
    let crawl = crawler.crawl_with_progress(&catalog.seeds, &crawl_progress).await;

    let (pages_out, crawl_skips_out) = (layout.pages(), layout.crawl_skips());
    write_jsonl(&pages_out, &crawl.pages)?;
    write_jsonl(&crawl_skips_out, &crawl.skips)?;
    reporter.record_crawl(
        &crawl.stats,
        StageReport::crawl(&crawl.stats)
            .with_outputs(describe(&[pages_out.as_path(), crawl_skips_out.as_path()])?)
            .timed(started),
    );

    // --- Stage 3: Normalize ---
    progress.phase("Normalizing pages");
    let started = Instant::now();
    let rules = RuleTable::load(&config.rules_path)?;
    let normalizer = Normalizer::new(rules, config.evaluator.policy.required_fields.clone());
    let normalized = normalizer.normalize(&crawl.pages);

    let (candidates_out, normalize_skips_out) = (layout.candidates(), layout.normalize_skips());
    write_jsonl(&candidates_out, &normalized.candidates)?;
    write_jsonl(&normalize_skips_out, &normalized.skips)?;
    reporter.record_normalize(
        &normalized.stats,
        StageReport::normalize(&normalized.stats)
            .with_outputs(describe(&[candidates_out.as_path(), normalize_skips_out.as_path()])?)
            .timed(started),
    );

    // --- Stage 4: Evaluate ---
    progress.phase("Evaluating candidates");
    let started = Instant::now();
    let store = CanonicalStore::load(&config.store_path)?;
    let evaluation = evaluate(
        &normalized.candidates,
        &store,
        &LevenshteinScorer::default(),
        &config.evaluator,
    );

    let (evaluations_out, report_out) = (layout.evaluations(), layout.evaluation_report());
    write_jsonl(&evaluations_out, &evaluation.results)?;
    write_json(&report_out, &evaluation.report)?;
    let mut eval_outputs = describe(&[evaluations_out.as_path()])?;
    eval_outputs.push(ArtifactRef::describe(&report_out)?);
    reporter.record_evaluate(
        &evaluation.report,
        StageReport::evaluate(&evaluation.report)
            .with_outputs(eval_outputs)
            .timed(started),
    );

    // --- Stage 5: Merge ---
    progress.phase("Merging into canonical store");
    let started = Instant::now();
    let mut engine = MergeEngine::new(config.merge.clone(), store, run_id.clone())?
        .with_advisories(&evaluation.results);
    let outcome = engine.run(normalized.candidates)?;

    reporter.record_merge(
        &outcome.stats,
        StageReport::merge(&outcome.stats)
            .with_outputs(describe(&[
                config.merge.decision_log.as_path(),
                config.merge.provenance_log.as_path(),
            ])?)
            .timed(started),
    );

    Ok(())
}

/// Artifact refs for the given outputs. Append logs that were never written
/// (no entries this run and none before) are left out.
fn describe(paths: &[&Path]) -> Result<Vec<ArtifactRef>> {
    paths
        .iter()
        .filter(|p| p.exists())
        .map(|p| ArtifactRef::describe(p))
        .collect()
}

// ---------------------------------------------------------------------------
// Crawl progress adapter
// ---------------------------------------------------------------------------

/// Adapts a `ProgressReporter` to the crawler's `CrawlProgress` interface.
struct PipelineCrawlProgress<'a> {
    inner: &'a dyn ProgressReporter,
}

impl CrawlProgress for PipelineCrawlProgress<'_> {
    fn page_fetched(&self, title: &str, fetched: usize, cap: usize) {
        self.inner.page_fetched(title, fetched, cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use loreforge_storage::{AppendLog, REGISTRY_FILE_NAME, RunRegistry};
    use loreforge_shared::{MergeDecision, Verdict};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RULES: &str = r#"
[[rules]]
name = "weapons"
category = "weapons"
keywords = ["weapon", "pistol", "rifle"]
extractor = "infobox"
min_score = 4.0
"#;

    const STORE: &str = r#"{
  "inventory": { "title": "Inventory", "items": { "weapons": [] } },
  "meta": { "version": 3 }
}"#;

    async fn mount_page(server: &MockServer, page_id: u64, title: &str, extract: &str, category: &str) {
        Mock::given(method("GET"))
            .and(path("/api.php"))
            .and(query_param("action", "query"))
            .and(query_param("titles", title))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "batchcomplete": true,
                "query": {"pages": [{
                    "pageid": page_id,
                    "ns": 0,
                    "title": title,
                    "extract": extract,
                    "categories": [{"ns": 14, "title": format!("Category:{category}")}],
                    "revisions": [{"revid": page_id * 10, "parentid": 1, "timestamp": "2024-03-01T12:00:00Z"}],
                    "fullurl": format!("https://fallout.fandom.com/wiki/{}", title.replace(' ', "_"))
                }]}
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api.php"))
            .and(query_param("action", "parse"))
            .and(query_param("page", title))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "parse": {
                    "title": title,
                    "pageid": page_id,
                    "text": format!("<div class=\"mw-parser-output\"><p>{extract}</p></div>"),
                    "links": []
                }
            })))
            .mount(server)
            .await;
    }

    fn setup(server: &MockServer) -> (PathBuf, PipelineConfig) {
        let dir = std::env::temp_dir().join(format!("loreforge-pipeline-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("seeds.json"), r#"["Laser pistol", "Vault 101", "Missing page"]"#).unwrap();
        std::fs::write(dir.join("rules.toml"), RULES).unwrap();
        std::fs::write(dir.join("store.json"), STORE).unwrap();

        let mut app = AppConfig::default();
        app.source.api_url = format!("{}/api.php", server.uri());
        app.seeds.hop_budget = 0;
        app.crawl.rate_limit_ms = 0;
        app.paths.provenance_log = dir.join("provenance.jsonl").display().to_string();
        app.paths.decision_log = dir.join("decisions.jsonl").display().to_string();

        let mut config = PipelineConfig::from_app(&app, dir.join("seeds.json"), None);
        config.rules_path = dir.join("rules.toml");
        config.store_path = dir.join("store.json");
        config.runs_dir = dir.join("runs");
        config.work_dir = dir.join("work");
        (dir, config)
    }

    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<String>>,
        fetched: Mutex<usize>,
    }

    impl ProgressReporter for Recorder {
        fn phase(&self, name: &str) {
            self.phases.lock().unwrap().push(name.to_string());
        }
        fn page_fetched(&self, _title: &str, _fetched: usize, _cap: usize) {
            *self.fetched.lock().unwrap() += 1;
        }
        fn done(&self, _manifest: &RunManifest) {}
    }

    async fn mount_pages(server: &MockServer) {
        mount_page(
            server,
            7,
            "Laser pistol",
            "The laser pistol is a common energy weapon. It was produced before 2077 by Wattz.",
            "Fallout 3 weapons",
        )
        .await;
        mount_page(server, 8, "Vault 101", "Vault 101 is a fallout shelter in the Capital Wasteland.", "Vaults").await;
        Mock::given(path("/api.php"))
            .and(query_param("titles", "Missing page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "query": {"pages": [{"ns": 0, "title": "Missing page", "missing": true}]}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_run_merges_and_records_manifest() {
        let server = MockServer::start().await;
        mount_pages(&server).await;
        let (dir, config) = setup(&server);
        let progress = Recorder::default();

        let manifest = run_pipeline(&config, &progress).await.unwrap();

        assert_eq!(manifest.status, RunStatus::Succeeded);
        assert_eq!(manifest.counts.seeds, Some(3));
        assert_eq!(manifest.counts.pages_fetched, Some(2));
        assert_eq!(manifest.counts.pages_skipped, Some(1));
        assert_eq!(manifest.counts.pages_normalized, Some(1));
        assert_eq!(manifest.counts.candidates, Some(1));
        assert_eq!(manifest.counts.merged_new, Some(1));
        assert!(manifest.conservation.ok);
        assert_eq!(manifest.stages.len(), 5);
        assert_eq!(progress.phases.lock().unwrap().len(), 5);
        assert_eq!(*progress.fetched.lock().unwrap(), 2);

        let store = CanonicalStore::load(&config.store_path).unwrap();
        let record = store.find("weapons", "laser_pistol").unwrap();
        assert_eq!(record.name, "LASER PISTOL");

        let decisions: Vec<MergeDecision> = AppendLog::new(&config.merge.decision_log).read_all().unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].verdict, Verdict::New);
        assert!(decisions[0].advisory.is_some());

        let layout = StageArtifacts::in_dir(&config.work_dir, &manifest.run_id.to_string());
        assert!(layout.pages().exists());
        assert!(layout.evaluation_report().exists());
        assert!(config.runs_dir.join(format!("{}.json", manifest.run_id)).exists());

        // A second run over the same pages changes nothing.
        let again = run_pipeline(&config, &SilentProgress).await.unwrap();
        assert_eq!(again.counts.merged_new, Some(0));
        assert_eq!(again.counts.merged_updated, Some(1));
        let merge = again.stage("merge").unwrap();
        assert_eq!(merge.stats["fields_changed"], 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_store_fails_run_and_records_it() {
        let server = MockServer::start().await;
        mount_pages(&server).await;
        let (dir, mut config) = setup(&server);
        config.store_path = dir.join("nope").join("store.json");

        let err = run_pipeline(&config, &SilentProgress).await.unwrap_err();
        assert!(err.is_store_failure());

        let registry = RunRegistry::open_readonly(&config.runs_dir.join(REGISTRY_FILE_NAME))
            .await
            .unwrap();
        let runs = registry.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        let stages = registry.stages(&runs[0].run_id).await.unwrap();
        assert_eq!(stages.len(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
