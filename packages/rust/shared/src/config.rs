//! Application configuration for Loreforge.
//!
//! Config is read from `--config <path>`, then `./loreforge.toml`, then
//! `~/.loreforge/loreforge.toml`. CLI flags override config file values,
//! which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LoreforgeError, Result};
use crate::wiki::DEFAULT_WIKI_HOST;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "loreforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".loreforge";

// ---------------------------------------------------------------------------
// Config structs (matching loreforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub seeds: SeedsConfig,
    #[serde(default)]
    pub crawl: CrawlSection,
    #[serde(default)]
    pub normalize: NormalizeSection,
    #[serde(default)]
    pub evaluate: EvaluateConfig,
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// `[source]` section: the wiki API being crawled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// MediaWiki `api.php` endpoint.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Host used to build and recognize article URLs.
    #[serde(default = "default_wiki_host")]
    pub wiki_host: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            wiki_host: default_wiki_host(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    format!("https://{DEFAULT_WIKI_HOST}/api.php")
}
fn default_wiki_host() -> String {
    DEFAULT_WIKI_HOST.into()
}
fn default_user_agent() -> String {
    concat!("Loreforge/", env!("CARGO_PKG_VERSION"), " (lore-ingest)").into()
}
fn default_timeout_secs() -> u64 {
    20
}

/// `[seeds]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedsConfig {
    /// Upper bound on titles taken from each category.
    #[serde(default = "default_members_per_category")]
    pub members_per_category: usize,
    /// Hop budget assigned to every seed.
    #[serde(default = "default_hop_budget")]
    pub hop_budget: u32,
}

impl Default for SeedsConfig {
    fn default() -> Self {
        Self {
            members_per_category: default_members_per_category(),
            hop_budget: default_hop_budget(),
        }
    }
}

fn default_members_per_category() -> usize {
    200
}
fn default_hop_budget() -> u32 {
    2
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    /// Maximum hop depth from any seed.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Hard cap on fetched pages.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Minimum ms between any two API requests.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_ms: u64,
    /// Per-page timeout covering all requests for that page.
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,
    /// Namespace prefixes never crawled.
    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,
    /// Regex patterns; matching titles are never crawled.
    #[serde(default = "default_exclude_title_patterns")]
    pub exclude_title_patterns: Vec<String>,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            concurrency: default_concurrency(),
            rate_limit_ms: default_rate_limit(),
            page_timeout_secs: default_page_timeout(),
            exclude_namespaces: default_exclude_namespaces(),
            exclude_title_patterns: default_exclude_title_patterns(),
        }
    }
}

fn default_max_depth() -> u32 {
    2
}
fn default_max_pages() -> usize {
    500
}
fn default_concurrency() -> u32 {
    4
}
fn default_rate_limit() -> u64 {
    200
}
fn default_page_timeout() -> u64 {
    30
}
fn default_exclude_namespaces() -> Vec<String> {
    [
        "User", "User talk", "Talk", "File", "File talk", "Template", "Template talk",
        "Category", "Category talk", "Module", "MediaWiki", "Help", "Special", "Forum",
        "Board Thread", "Message Wall",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_exclude_title_patterns() -> Vec<String> {
    vec![r"(?i)\(mod\)$".into(), r"(?i)^list of .* mods$".into()]
}

/// `[normalize]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeSection {
    /// Rule table TOML file.
    #[serde(default = "default_rules_path")]
    pub rules_path: String,
}

impl Default for NormalizeSection {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
        }
    }
}

fn default_rules_path() -> String {
    "config/rules.toml".into()
}

/// Thresholds the evaluator compares scores against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationThresholds {
    #[serde(default = "default_min_completeness")]
    pub min_completeness: f64,
    #[serde(default = "default_min_consistency")]
    pub min_consistency: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Candidates that resemble an existing record this closely without
    /// reaching the duplicate threshold are held for review.
    #[serde(default = "default_min_novelty")]
    pub min_novelty: f64,
}

impl Default for EvaluationThresholds {
    fn default() -> Self {
        Self {
            min_novelty: default_min_novelty(),
            min_completeness: default_min_completeness(),
            min_consistency: default_min_consistency(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_min_completeness() -> f64 {
    0.75
}
fn default_min_novelty() -> f64 {
    0.15
}
fn default_min_consistency() -> f64 {
    0.5
}
fn default_min_confidence() -> f64 {
    0.5
}

/// `[evaluate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateConfig {
    /// Fields counted for completeness.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
    #[serde(default = "default_lore_min_chars")]
    pub lore_min_chars: usize,
    #[serde(default = "default_lore_max_chars")]
    pub lore_max_chars: usize,
    /// Longest accepted specification key.
    #[serde(default = "default_spec_key_max_chars")]
    pub spec_key_max_chars: usize,
    /// Thresholds used when a category has no override.
    #[serde(default)]
    pub default: EvaluationThresholds,
    /// Per-category overrides.
    #[serde(default)]
    pub categories: BTreeMap<String, EvaluationThresholds>,
}

impl Default for EvaluateConfig {
    fn default() -> Self {
        Self {
            required_fields: default_required_fields(),
            lore_min_chars: default_lore_min_chars(),
            lore_max_chars: default_lore_max_chars(),
            spec_key_max_chars: default_spec_key_max_chars(),
            default: EvaluationThresholds::default(),
            categories: BTreeMap::new(),
        }
    }
}

impl EvaluateConfig {
    /// Thresholds for a category, falling back to the defaults.
    pub fn thresholds_for(&self, category: &str) -> &EvaluationThresholds {
        self.categories.get(category).unwrap_or(&self.default)
    }
}

fn default_required_fields() -> Vec<String> {
    vec!["id".into(), "name".into(), "lore".into(), "specs".into()]
}
fn default_lore_min_chars() -> usize {
    25
}
fn default_lore_max_chars() -> usize {
    1200
}
fn default_spec_key_max_chars() -> usize {
    48
}

/// How duplicates update existing canonical records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Replace a field only when the candidate's source is strictly newer.
    #[default]
    PreferNewer,
    /// Only fill fields that are empty on the existing record.
    Conservative,
    /// Reject duplicates outright.
    SkipExisting,
}

impl FromStr for ConflictPolicy {
    type Err = LoreforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prefer_newer" | "prefer-newer" => Ok(Self::PreferNewer),
            "conservative" => Ok(Self::Conservative),
            "skip_existing" | "skip-existing" => Ok(Self::SkipExisting),
            other => Err(LoreforgeError::config(format!(
                "unknown conflict policy '{other}': expected prefer_newer, conservative, or skip_existing"
            ))),
        }
    }
}

/// What to do when a new record's identifier is already taken in its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Append `_2`, `_3`, ... up to `max_suffix`.
    #[default]
    Suffix,
    /// Reject the candidate.
    Reject,
}

impl FromStr for CollisionPolicy {
    type Err = LoreforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "suffix" => Ok(Self::Suffix),
            "reject" => Ok(Self::Reject),
            other => Err(LoreforgeError::config(format!(
                "unknown collision policy '{other}': expected suffix or reject"
            ))),
        }
    }
}

/// `[merge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSection {
    /// Similarity at or above which a candidate is a duplicate.
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    /// Highest numeric suffix tried before the collision is unresolved.
    #[serde(default = "default_max_suffix")]
    pub max_suffix: u32,
    /// Canon tags eligible for merging.
    #[serde(default = "default_canon_allowed")]
    pub canon_allowed: Vec<String>,
    /// Categories never merged regardless of tags.
    #[serde(default)]
    pub excluded_categories: Vec<String>,
    /// Fields a candidate must carry to be written.
    #[serde(default = "default_merge_required_fields")]
    pub required_fields: Vec<String>,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_inserts: usize,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_updates: usize,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            duplicate_threshold: default_duplicate_threshold(),
            conflict_policy: ConflictPolicy::default(),
            collision_policy: CollisionPolicy::default(),
            max_suffix: default_max_suffix(),
            canon_allowed: default_canon_allowed(),
            excluded_categories: Vec::new(),
            required_fields: default_merge_required_fields(),
            max_inserts: 0,
            max_updates: 0,
        }
    }
}

fn default_duplicate_threshold() -> f64 {
    0.92
}
fn default_max_suffix() -> u32 {
    9
}
fn default_canon_allowed() -> Vec<String> {
    vec!["mainline".into(), "tv".into()]
}
fn default_merge_required_fields() -> Vec<String> {
    vec!["id".into(), "name".into(), "lore".into()]
}

/// `[paths]` section: where stage outputs and persistent state live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Canonical store file.
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_provenance_log")]
    pub provenance_log: String,
    #[serde(default = "default_decision_log")]
    pub decision_log: String,
    /// Directory holding `<run_id>.json` manifests and the run registry.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,
    /// Directory for intermediate stage artifacts of `run`.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            provenance_log: default_provenance_log(),
            decision_log: default_decision_log(),
            runs_dir: default_runs_dir(),
            work_dir: default_work_dir(),
        }
    }
}

fn default_store() -> String {
    "data/database-en.json".into()
}
fn default_provenance_log() -> String {
    "reports/provenance.jsonl".into()
}
fn default_decision_log() -> String {
    "reports/merge_decisions.jsonl".into()
}
fn default_runs_dir() -> String {
    "reports/runs".into()
}
fn default_work_dir() -> String {
    "tmp".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub api_url: String,
    pub wiki_host: String,
    pub user_agent: String,
    pub max_depth: u32,
    pub max_pages: usize,
    pub concurrency: u32,
    pub rate_limit_ms: u64,
    pub request_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub exclude_namespaces: Vec<String>,
    pub exclude_title_patterns: Vec<String>,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            api_url: config.source.api_url.clone(),
            wiki_host: config.source.wiki_host.clone(),
            user_agent: config.source.user_agent.clone(),
            max_depth: config.crawl.max_depth,
            max_pages: config.crawl.max_pages,
            concurrency: config.crawl.concurrency,
            rate_limit_ms: config.crawl.rate_limit_ms,
            request_timeout_secs: config.source.timeout_secs,
            page_timeout_secs: config.crawl.page_timeout_secs,
            exclude_namespaces: config.crawl.exclude_namespaces.clone(),
            exclude_title_patterns: config.crawl.exclude_title_patterns.clone(),
        }
    }
}

/// Runtime merge configuration.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub duplicate_threshold: f64,
    pub conflict_policy: ConflictPolicy,
    pub collision_policy: CollisionPolicy,
    pub max_suffix: u32,
    pub canon_allowed: Vec<String>,
    pub excluded_categories: Vec<String>,
    pub required_fields: Vec<String>,
    pub max_inserts: usize,
    pub max_updates: usize,
    pub provenance_log: PathBuf,
    pub decision_log: PathBuf,
}

impl From<&AppConfig> for MergeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            duplicate_threshold: config.merge.duplicate_threshold,
            conflict_policy: config.merge.conflict_policy,
            collision_policy: config.merge.collision_policy,
            max_suffix: config.merge.max_suffix,
            canon_allowed: config.merge.canon_allowed.clone(),
            excluded_categories: config.merge.excluded_categories.clone(),
            required_fields: config.merge.required_fields.clone(),
            max_inserts: config.merge.max_inserts,
            max_updates: config.merge.max_updates,
            provenance_log: PathBuf::from(&config.paths.provenance_log),
            decision_log: PathBuf::from(&config.paths.decision_log),
        }
    }
}

impl MergeConfig {
    /// Reject configurations the merge engine cannot apply deterministically.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.duplicate_threshold) {
            return Err(LoreforgeError::config(format!(
                "duplicate_threshold must be within 0..=1, got {}",
                self.duplicate_threshold
            )));
        }
        if self.canon_allowed.is_empty() {
            return Err(LoreforgeError::config(
                "canon_allowed is empty: every candidate would be rejected",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.loreforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LoreforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the user config file (`~/.loreforge/loreforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config.
///
/// An explicit path must exist. Otherwise `./loreforge.toml` and then the
/// user config are tried; defaults are returned if neither exists.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return load_config_from(path);
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return load_config_from(&local);
    }

    let path = config_file_path()?;
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LoreforgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LoreforgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write a default config file to `path` (or the user config location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| LoreforgeError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LoreforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LoreforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("duplicate_threshold"));
        assert!(toml_str.contains("prefer_newer"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.crawl.max_depth, 2);
        assert_eq!(parsed.merge.duplicate_threshold, 0.92);
        assert_eq!(parsed.merge.conflict_policy, ConflictPolicy::PreferNewer);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[crawl]
concurrency = 8

[merge]
conflict_policy = "conservative"
canon_allowed = ["mainline"]

[evaluate.categories.weapons]
min_completeness = 1.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.crawl.concurrency, 8);
        assert_eq!(config.crawl.max_pages, 500);
        assert_eq!(config.merge.conflict_policy, ConflictPolicy::Conservative);
        assert_eq!(config.merge.canon_allowed, vec!["mainline".to_string()]);

        let weapons = config.evaluate.thresholds_for("weapons");
        assert_eq!(weapons.min_completeness, 1.0);
        assert_eq!(weapons.min_consistency, 0.5);
        assert_eq!(config.evaluate.thresholds_for("armor").min_completeness, 0.75);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let crawl = CrawlConfig::from(&app);
        assert_eq!(crawl.concurrency, 4);
        assert_eq!(crawl.rate_limit_ms, 200);
        assert!(crawl.exclude_namespaces.iter().any(|ns| ns == "User talk"));

        let merge = MergeConfig::from(&app);
        assert!(merge.validate().is_ok());
        assert_eq!(merge.decision_log, PathBuf::from("reports/merge_decisions.jsonl"));
    }

    #[test]
    fn merge_config_validation() {
        let mut merge = MergeConfig::from(&AppConfig::default());
        merge.duplicate_threshold = 1.5;
        assert!(merge.validate().is_err());

        merge.duplicate_threshold = 0.9;
        merge.canon_allowed.clear();
        let err = merge.validate().unwrap_err();
        assert!(err.to_string().contains("canon_allowed"));
    }

    #[test]
    fn policies_parse_from_str() {
        assert_eq!("prefer-newer".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::PreferNewer);
        assert_eq!("skip_existing".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::SkipExisting);
        assert_eq!("reject".parse::<CollisionPolicy>().unwrap(), CollisionPolicy::Reject);
        assert!("overwrite".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn init_config_writes_defaults() {
        let dir = std::env::temp_dir().join(format!("lf-config-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("loreforge.toml");
        let written = init_config(Some(&path)).expect("init config");
        assert_eq!(written, path);

        let loaded = load_config(Some(&path)).expect("load written config");
        assert_eq!(loaded.seeds.members_per_category, 200);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sample_config_parses() {
        let config = load_config_from(Path::new("../../../fixtures/loreforge.toml")).expect("load sample");
        assert_eq!(config.merge.conflict_policy, ConflictPolicy::PreferNewer);
        assert_eq!(config.merge.max_suffix, 9);
        let weapons = config.evaluate.thresholds_for("weapons");
        assert_eq!(weapons.min_confidence, 0.6);
        assert_eq!(weapons.min_completeness, 0.75);
        assert_eq!(config.evaluate.thresholds_for("armor"), &EvaluationThresholds::default());
    }
}
