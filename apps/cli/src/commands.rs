//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use loreforge_artifacts::{ArtifactRef, read_jsonl, sibling_with_suffix, write_json, write_jsonl};
use loreforge_core::evaluator::{EvaluatorConfig, evaluate};
use loreforge_core::merge::MergeEngine;
use loreforge_core::pipeline::{PipelineConfig, ProgressReporter, run_pipeline};
use loreforge_core::reporter::{RunManifest, RunReporter, StageReport, load_manifest, record_run};
use loreforge_core::similarity::LevenshteinScorer;
use loreforge_crawler::{CrawlProgress, Crawler};
use loreforge_normalizer::{Normalizer, RuleTable};
use loreforge_seeds::{
    CategoryResolver, SeedCatalogConfig, build_catalog, load_category_titles, load_seed_titles,
};
use loreforge_shared::{
    AppConfig, CandidateRecord, CollisionPolicy, ConflictPolicy, CrawlConfig, EvaluationResult,
    FetchedPage, MergeConfig, RunId, Seed, init_config, load_config,
};
use loreforge_storage::{CanonicalStore, REGISTRY_FILE_NAME, RunRegistry, RunStatus};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Loreforge: wiki lore ingestion for the canonical content store.
#[derive(Parser)]
#[command(
    name = "loreforge",
    version,
    about = "Crawl the Fallout wiki, normalize pages into lore candidates, and merge them into the canonical store.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ./loreforge.toml, then ~/.loreforge/loreforge.toml).
    #[arg(long, global = true, env = "LOREFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Expand seed titles and categories into a seed list.
    Seeds {
        /// Direct seeds (JSON list or {"seed_urls": [...]}).
        #[arg(long)]
        seeds: PathBuf,

        /// Category references (JSON list or {"category_urls": [...]}).
        #[arg(long)]
        categories: Option<PathBuf>,

        /// Output seed list (JSONL).
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Fetch pages breadth-first from a seed list.
    Crawl {
        /// Seed list (JSONL).
        #[arg(short, long = "in")]
        input: PathBuf,

        /// Output pages (JSONL); skips go next to it.
        #[arg(short, long)]
        out: PathBuf,

        #[arg(long)]
        max_depth: Option<u32>,

        #[arg(long)]
        max_pages: Option<usize>,

        #[arg(long)]
        concurrency: Option<u32>,

        /// Minimum milliseconds between API requests.
        #[arg(long)]
        rate_limit_ms: Option<u64>,
    },

    /// Map pages to candidate records with the rule table.
    Normalize {
        /// Pages (JSONL).
        #[arg(short, long = "in")]
        input: PathBuf,

        /// Output candidates (JSONL); skips go next to it.
        #[arg(short, long)]
        out: PathBuf,

        /// Rule table (defaults to [normalize].rules_path).
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Score candidates against the canonical store.
    Evaluate {
        /// Candidates (JSONL).
        #[arg(short, long = "in")]
        input: PathBuf,

        /// Output evaluation results (JSONL).
        #[arg(short, long)]
        out: PathBuf,

        /// Batch report (defaults to <out>.report.json).
        #[arg(long)]
        report: Option<PathBuf>,

        /// Canonical store (defaults to [paths].store).
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Merge candidates into the canonical store.
    Merge {
        /// Candidates (JSONL).
        #[arg(short, long = "in")]
        input: PathBuf,

        /// Evaluation results to attach as advisories.
        #[arg(long)]
        evaluations: Option<PathBuf>,

        /// Canonical store (defaults to [paths].store).
        #[arg(long)]
        store: Option<PathBuf>,

        /// prefer_newer, conservative, or skip_existing.
        #[arg(long)]
        conflict: Option<ConflictPolicy>,

        /// suffix or reject.
        #[arg(long)]
        collision: Option<CollisionPolicy>,

        /// Allowed canon tags (comma-separated).
        #[arg(long)]
        canon: Option<String>,

        /// Duplicate similarity threshold (0..=1).
        #[arg(long)]
        threshold: Option<f64>,

        /// 0 = unlimited.
        #[arg(long)]
        max_inserts: Option<usize>,

        /// 0 = unlimited.
        #[arg(long)]
        max_updates: Option<usize>,
    },

    /// Run every stage end to end.
    Run {
        #[arg(long)]
        seeds: PathBuf,

        #[arg(long)]
        categories: Option<PathBuf>,

        #[arg(long)]
        rules: Option<PathBuf>,

        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// List recorded runs, or show one manifest.
    Report {
        /// Run to show; lists recent runs when omitted.
        run_id: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Where to write (defaults to ~/.loreforge/loreforge.toml).
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "loreforge=info",
        1 => "loreforge=debug",
        _ => "loreforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init { path } => cmd_config_init(path.as_deref()),
            ConfigAction::Show => cmd_config_show(config_path),
        },
        command => {
            let config = load_config(config_path)?;
            match command {
                Command::Seeds { seeds, categories, out } => {
                    cmd_seeds(&config, &seeds, categories.as_deref(), &out).await
                }
                Command::Crawl {
                    input,
                    out,
                    max_depth,
                    max_pages,
                    concurrency,
                    rate_limit_ms,
                } => {
                    let mut crawl = CrawlConfig::from(&config);
                    if let Some(v) = max_depth {
                        crawl.max_depth = v;
                    }
                    if let Some(v) = max_pages {
                        crawl.max_pages = v;
                    }
                    if let Some(v) = concurrency {
                        crawl.concurrency = v;
                    }
                    if let Some(v) = rate_limit_ms {
                        crawl.rate_limit_ms = v;
                    }
                    cmd_crawl(&config, crawl, &input, &out).await
                }
                Command::Normalize { input, out, rules } => {
                    let rules = rules.unwrap_or_else(|| PathBuf::from(&config.normalize.rules_path));
                    cmd_normalize(&config, &input, &out, &rules).await
                }
                Command::Evaluate {
                    input,
                    out,
                    report,
                    store,
                } => {
                    let report = report.unwrap_or_else(|| sibling_with_suffix(&out, "report.json"));
                    let store = store.unwrap_or_else(|| PathBuf::from(&config.paths.store));
                    cmd_evaluate(&config, &input, &out, &report, &store).await
                }
                Command::Merge {
                    input,
                    evaluations,
                    store,
                    conflict,
                    collision,
                    canon,
                    threshold,
                    max_inserts,
                    max_updates,
                } => {
                    let mut merge = MergeConfig::from(&config);
                    if let Some(v) = conflict {
                        merge.conflict_policy = v;
                    }
                    if let Some(v) = collision {
                        merge.collision_policy = v;
                    }
                    if let Some(v) = canon {
                        merge.canon_allowed = split_list(&v);
                    }
                    if let Some(v) = threshold {
                        merge.duplicate_threshold = v;
                    }
                    if let Some(v) = max_inserts {
                        merge.max_inserts = v;
                    }
                    if let Some(v) = max_updates {
                        merge.max_updates = v;
                    }
                    let store = store.unwrap_or_else(|| PathBuf::from(&config.paths.store));
                    cmd_merge(&config, merge, &input, evaluations.as_deref(), &store).await
                }
                Command::Run {
                    seeds,
                    categories,
                    rules,
                    store,
                } => {
                    let mut pipeline = PipelineConfig::from_app(&config, seeds, categories);
                    if let Some(v) = rules {
                        pipeline.rules_path = v;
                    }
                    if let Some(v) = store {
                        pipeline.store_path = v;
                    }
                    cmd_run(&pipeline).await
                }
                Command::Report { run_id, limit } => cmd_report(&config, run_id.as_deref(), limit).await,
                Command::Config { .. } => Err(eyre!("config is handled above")),
            }
        }
    }
}

/// Comma-separated values, trimmed, empties dropped.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Describe outputs that exist; append logs stay absent until their first entry.
fn existing_outputs(paths: &[&Path]) -> Result<Vec<ArtifactRef>> {
    let mut outputs = Vec::new();
    for path in paths.iter().filter(|p| p.exists()) {
        outputs.push(ArtifactRef::describe(path)?);
    }
    Ok(outputs)
}

fn runs_dir(config: &AppConfig) -> PathBuf {
    PathBuf::from(&config.paths.runs_dir)
}

/// Close a single-stage run and record its manifest.
async fn finish_stage(config: &AppConfig, reporter: RunReporter) -> Result<RunManifest> {
    let manifest = reporter.finish(RunStatus::Succeeded, None);
    let path = record_run(&runs_dir(config), &manifest).await?;
    println!("  Run:     {}", manifest.run_id);
    println!("  Report:  {}", path.display());
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Stage commands
// ---------------------------------------------------------------------------

async fn cmd_seeds(config: &AppConfig, seeds: &Path, categories: Option<&Path>, out: &Path) -> Result<()> {
    let started = Instant::now();
    let direct = load_seed_titles(seeds, &config.source.wiki_host)?;
    let categories = match categories {
        Some(path) => load_category_titles(path, &config.source.wiki_host)?,
        None => Vec::new(),
    };
    info!(direct = direct.len(), categories = categories.len(), "building seed catalog");

    let resolver = CategoryResolver::new(
        &config.source.api_url,
        &config.source.user_agent,
        config.source.timeout_secs,
        config.seeds.members_per_category,
    )?;
    let spinner = CliProgress::new();
    spinner.phase("Resolving categories");
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
    spinner.finish();

    write_jsonl(out, &catalog.seeds)?;
    let summary_path = sibling_with_suffix(out, "summary.json");
    write_json(&summary_path, &catalog.summary)?;

    let mut reporter = RunReporter::new(RunId::new(), "seeds");
    reporter.set_seeds(catalog.seeds.iter().map(|s| s.title.clone()).collect());
    reporter.record_seeds(
        &catalog.summary,
        StageReport::seeds(&catalog.summary)
            .with_outputs(vec![ArtifactRef::describe(out)?, ArtifactRef::describe(&summary_path)?])
            .timed(started),
    );

    println!();
    println!("  Seeds:   {}", catalog.summary.expanded_seed_count);
    println!("  Failed:  {} categories", catalog.summary.failed_categories.len());
    println!("  Output:  {}", out.display());
    finish_stage(config, reporter).await?;
    println!();
    Ok(())
}

async fn cmd_crawl(config: &AppConfig, crawl: CrawlConfig, input: &Path, out: &Path) -> Result<()> {
    let started = Instant::now();
    let seeds: Vec<Seed> = read_jsonl(input)?;
    if seeds.is_empty() {
        return Err(eyre!("no seeds in '{}'", input.display()));
    }

    let crawler = Crawler::new(crawl)?;
    let progress = CliProgress::new();
    progress.phase("Crawling");
    let output = crawler.crawl_with_progress(&seeds, &progress).await;
    progress.finish();

    let skips_path = sibling_with_suffix(out, "skips.jsonl");
    write_jsonl(out, &output.pages)?;
    write_jsonl(&skips_path, &output.skips)?;

    let mut reporter = RunReporter::new(RunId::new(), "crawl");
    reporter.record_crawl(
        &output.stats,
        StageReport::crawl(&output.stats)
            .with_outputs(vec![ArtifactRef::describe(out)?, ArtifactRef::describe(&skips_path)?])
            .timed(started),
    );

    println!();
    println!("  Fetched: {}", output.stats.pages_fetched);
    println!("  Skipped: {}", output.stats.pages_skipped);
    for (reason, count) in &output.stats.skip_reasons {
        println!("    {reason}: {count}");
    }
    println!("  Output:  {}", out.display());
    finish_stage(config, reporter).await?;
    println!();
    Ok(())
}

async fn cmd_normalize(config: &AppConfig, input: &Path, out: &Path, rules: &Path) -> Result<()> {
    let started = Instant::now();
    let pages: Vec<FetchedPage> = read_jsonl(input)?;
    let table = RuleTable::load(rules)?;
    let normalizer = Normalizer::new(table, config.evaluate.required_fields.clone());
    let output = normalizer.normalize(&pages);

    let skips_path = sibling_with_suffix(out, "skips.jsonl");
    write_jsonl(out, &output.candidates)?;
    write_jsonl(&skips_path, &output.skips)?;

    let mut reporter = RunReporter::new(RunId::new(), "normalize");
    reporter.record_normalize(
        &output.stats,
        StageReport::normalize(&output.stats)
            .with_outputs(vec![ArtifactRef::describe(out)?, ArtifactRef::describe(&skips_path)?])
            .timed(started),
    );

    println!();
    println!("  Pages:      {}", output.stats.pages_in);
    println!("  Normalized: {}", output.stats.pages_normalized);
    println!("  Skipped:    {}", output.stats.pages_skipped);
    for (reason, count) in &output.stats.skip_reasons {
        println!("    {reason}: {count}");
    }
    println!("  Candidates: {}", output.stats.candidates);
    finish_stage(config, reporter).await?;
    println!();
    Ok(())
}

async fn cmd_evaluate(config: &AppConfig, input: &Path, out: &Path, report: &Path, store: &Path) -> Result<()> {
    let started = Instant::now();
    let candidates: Vec<CandidateRecord> = read_jsonl(input)?;
    let store = CanonicalStore::load(store)?;
    let output = evaluate(
        &candidates,
        &store,
        &LevenshteinScorer::default(),
        &EvaluatorConfig::from(config),
    );

    write_jsonl(out, &output.results)?;
    write_json(report, &output.report)?;

    let mut reporter = RunReporter::new(RunId::new(), "evaluate");
    reporter.record_evaluate(
        &output.report,
        StageReport::evaluate(&output.report)
            .with_outputs(vec![ArtifactRef::describe(out)?, ArtifactRef::describe(report)?])
            .timed(started),
    );

    println!();
    println!("  Candidates: {}", output.report.input_candidates);
    for (recommendation, count) in &output.report.recommendations {
        println!("    {recommendation}: {count}");
    }
    println!("  Flagged:    {}", output.report.flagged());
    println!("  Report:     {}", report.display());
    finish_stage(config, reporter).await?;
    println!();
    Ok(())
}

async fn cmd_merge(
    config: &AppConfig,
    merge: MergeConfig,
    input: &Path,
    evaluations: Option<&Path>,
    store_path: &Path,
) -> Result<()> {
    let started = Instant::now();
    let candidates: Vec<CandidateRecord> = read_jsonl(input)?;
    let advisories: Vec<EvaluationResult> = match evaluations {
        Some(path) => read_jsonl(path)?,
        None => Vec::new(),
    };
    let store = CanonicalStore::load(store_path)?;

    let run_id = RunId::new();
    let mut reporter = RunReporter::new(run_id.clone(), "merge");
    reporter.set_thresholds(serde_json::json!({
        "duplicate_threshold": merge.duplicate_threshold,
        "conflict_policy": merge.conflict_policy,
        "collision_policy": merge.collision_policy,
        "canon_allowed": merge.canon_allowed,
        "max_inserts": merge.max_inserts,
        "max_updates": merge.max_updates,
    }));

    let (decision_log, provenance_log) = (merge.decision_log.clone(), merge.provenance_log.clone());
    let mut engine = MergeEngine::new(merge, store, run_id)?.with_advisories(&advisories);
    let outcome = match engine.run(candidates) {
        Ok(outcome) => outcome,
        Err(e) => {
            let manifest = reporter.finish(RunStatus::Failed, Some(e.to_string()));
            if let Err(record_err) = record_run(&runs_dir(config), &manifest).await {
                tracing::warn!(error = %record_err, "could not record failed run");
            }
            return Err(e.into());
        }
    };

    reporter.record_merge(
        &outcome.stats,
        StageReport::merge(&outcome.stats)
            .with_outputs(existing_outputs(&[decision_log.as_path(), provenance_log.as_path()])?)
            .timed(started),
    );

    println!();
    println!("  Candidates: {}", outcome.stats.candidates_in);
    println!("  New:        {}", outcome.stats.new);
    println!("  Updated:    {}", outcome.stats.updated);
    println!("  Rejected:   {}", outcome.stats.rejected);
    for (reason, count) in &outcome.stats.reject_reasons {
        println!("    {reason}: {count}");
    }
    println!("  Store:      {}", store_path.display());
    finish_stage(config, reporter).await?;
    println!();
    Ok(())
}

async fn cmd_run(pipeline: &PipelineConfig) -> Result<()> {
    info!(seeds = %pipeline.seeds_path.display(), "starting full run");
    let progress = CliProgress::new();
    let manifest = run_pipeline(pipeline, &progress).await?;

    let c = &manifest.counts;
    let show = |v: Option<usize>| v.map_or_else(|| "-".to_string(), |n| n.to_string());
    println!();
    println!("  Run complete!");
    println!("  Run:          {}", manifest.run_id);
    println!("  Seeds:        {}", show(c.seeds));
    println!("  Fetched:      {}", show(c.pages_fetched));
    println!("  Crawl skips:  {}", show(c.pages_skipped));
    println!("  Candidates:   {}", show(c.candidates));
    println!("  Flagged:      {}", show(c.flagged));
    println!("  New:          {}", show(c.merged_new));
    println!("  Updated:      {}", show(c.merged_updated));
    println!("  Rejected:     {}", show(c.merged_rejected));
    println!(
        "  Conservation: {}",
        if manifest.conservation.ok { "ok" } else { "MISMATCH" }
    );
    println!();
    Ok(())
}

async fn cmd_report(config: &AppConfig, run_id: Option<&str>, limit: u32) -> Result<()> {
    let dir = runs_dir(config);

    if let Some(id) = run_id {
        let run_id: RunId = id.parse()?;
        let manifest = load_manifest(&dir, &run_id)?;
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    let registry_path = dir.join(REGISTRY_FILE_NAME);
    if !registry_path.exists() {
        println!("No runs recorded yet.");
        return Ok(());
    }
    let registry = RunRegistry::open_readonly(&registry_path).await?;
    let runs = registry.list_runs(limit).await?;
    for run in runs {
        println!(
            "{}  {:<10} {:<9} {}",
            run.run_id,
            run.command,
            run.status.as_str(),
            run.started_at.to_rfc3339()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(explicit: Option<&Path>) -> Result<()> {
    let config: AppConfig = load_config(explicit)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_fetched(&self, title: &str, fetched: usize, cap: usize) {
        self.spinner.set_message(format!("Fetching [{fetched}/{cap}] {title}"));
    }

    fn done(&self, _manifest: &RunManifest) {
        self.finish();
    }
}

impl CrawlProgress for CliProgress {
    fn page_fetched(&self, title: &str, fetched: usize, cap: usize) {
        ProgressReporter::page_fetched(self, title, fetched, cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_merge_overrides() {
        let cli = Cli::try_parse_from([
            "loreforge",
            "merge",
            "--in",
            "candidates.jsonl",
            "--conflict",
            "conservative",
            "--canon",
            "mainline, tv,",
            "--threshold",
            "0.9",
        ])
        .unwrap();

        match cli.command {
            Command::Merge {
                input,
                conflict,
                canon,
                threshold,
                ..
            } => {
                assert_eq!(input, PathBuf::from("candidates.jsonl"));
                assert_eq!(conflict, Some(ConflictPolicy::Conservative));
                assert_eq!(split_list(&canon.unwrap()), vec!["mainline", "tv"]);
                assert_eq!(threshold, Some(0.9));
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn rejects_unknown_conflict_policy() {
        let result = Cli::try_parse_from(["loreforge", "merge", "--in", "c.jsonl", "--conflict", "newest"]);
        assert!(result.is_err());
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from(["loreforge", "report", "-vv", "--config", "alt.toml"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Command::Report { run_id: None, limit: 20 }));
    }
}
