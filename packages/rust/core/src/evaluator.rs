//! Advisory candidate evaluation.
//!
//! Scores every candidate for completeness, consistency, and novelty against
//! a read-only view of the canonical store, and builds a batch report for
//! human review. Nothing here binds the merge engine.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use loreforge_shared::{
    AppConfig, CandidateRecord, EvaluateConfig, EvaluationResult, EvaluationThresholds,
    Recommendation,
};
use loreforge_storage::CanonicalStore;

use crate::similarity::{SimilarityScorer, nearest_match};

const WEAK_SAMPLE_LIMIT: usize = 20;
const DUPLICATE_SAMPLE_LIMIT: usize = 25;

/// Evaluation policy.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub policy: EvaluateConfig,
    /// Similarity at or above which a candidate is noted as a likely update.
    pub duplicate_threshold: f64,
}

impl From<&AppConfig> for EvaluatorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            policy: config.evaluate.clone(),
            duplicate_threshold: config.merge.duplicate_threshold,
        }
    }
}

impl EvaluatorConfig {
    pub fn thresholds_for(&self, category: &str) -> &EvaluationThresholds {
        self.policy.thresholds_for(category)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coverage {
    pub categories: BTreeMap<String, usize>,
    pub rules: BTreeMap<String, usize>,
}

/// A low-confidence candidate listed in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakRecord {
    pub candidate_id: String,
    pub id: String,
    pub category: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quality {
    pub confidence_histogram: BTreeMap<String, usize>,
    pub low_confidence_count: usize,
    pub missing_required_fields_count: usize,
    pub weak_record_samples: Vec<WeakRecord>,
}

/// Repeats within the evaluated batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Duplicates {
    pub duplicate_id_count: usize,
    pub duplicate_url_count: usize,
    pub exact_duplicate_lore_count: usize,
    pub duplicate_id_samples: Vec<String>,
    pub duplicate_url_samples: Vec<String>,
}

/// Batch-level evaluation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub run_at: DateTime<Utc>,
    pub input_candidates: usize,
    pub recommendations: BTreeMap<String, usize>,
    pub coverage: Coverage,
    pub quality: Quality,
    pub duplicates: Duplicates,
    pub canon_tags: BTreeMap<String, usize>,
}

impl EvaluationReport {
    /// Candidates not recommended for acceptance.
    pub fn flagged(&self) -> usize {
        self.recommendations
            .iter()
            .filter(|(k, _)| k.as_str() != Recommendation::Accept.as_str())
            .map(|(_, v)| v)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationOutput {
    pub results: Vec<EvaluationResult>,
    pub report: EvaluationReport,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Evaluate a batch of candidates against the store.
#[instrument(skip_all, fields(candidates = candidates.len()))]
pub fn evaluate(
    candidates: &[CandidateRecord],
    store: &CanonicalStore,
    scorer: &dyn SimilarityScorer,
    config: &EvaluatorConfig,
) -> EvaluationOutput {
    let results: Vec<EvaluationResult> = candidates
        .iter()
        .map(|c| evaluate_one(c, store, scorer, config))
        .collect();
    let report = build_report(candidates, &results, config);

    info!(
        evaluated = results.len(),
        flagged = report.flagged(),
        "evaluation completed"
    );
    EvaluationOutput { results, report }
}

fn evaluate_one(
    candidate: &CandidateRecord,
    store: &CanonicalStore,
    scorer: &dyn SimilarityScorer,
    config: &EvaluatorConfig,
) -> EvaluationResult {
    let thresholds = config.thresholds_for(&candidate.category);
    let mut notes = Vec::new();

    let completeness = candidate.completeness(&config.policy.required_fields);
    for field in &config.policy.required_fields {
        if !candidate.has_field(field) {
            notes.push(format!("missing_field:{field}"));
        }
    }

    let consistency = consistency(candidate, &config.policy, &mut notes);

    let known_category = store.has_category(&candidate.category);
    let nearest = if known_category {
        nearest_match(scorer, candidate, store.records(&candidate.category))
    } else {
        notes.push(format!("unknown_category:{}", candidate.category));
        None
    };
    let novelty = nearest.as_ref().map_or(1.0, |m| 1.0 - m.similarity);
    let mut near_duplicate = false;
    if let Some(m) = &nearest {
        if m.similarity >= config.duplicate_threshold {
            notes.push(format!("likely_update:{}", m.record_id));
        } else if novelty < thresholds.min_novelty {
            near_duplicate = true;
            notes.push(format!("near_duplicate:{}", m.record_id));
        }
    }

    if candidate.confidence < thresholds.min_confidence {
        notes.push(format!("low_confidence:{}", candidate.confidence));
    }

    let recommendation = if !known_category
        || consistency < thresholds.min_consistency
        || candidate.confidence < thresholds.min_confidence
    {
        Recommendation::Reject
    } else if completeness < thresholds.min_completeness || near_duplicate {
        Recommendation::Hold
    } else {
        Recommendation::Accept
    };

    EvaluationResult {
        candidate_id: candidate.candidate_id.clone(),
        category: candidate.category.clone(),
        id: candidate.id.clone(),
        completeness,
        consistency,
        novelty,
        nearest,
        recommendation,
        notes,
    }
}

/// Fraction of passed checks: one per specification entry, one for lore length.
fn consistency(candidate: &CandidateRecord, policy: &EvaluateConfig, notes: &mut Vec<String>) -> f64 {
    let mut checks = 1usize;
    let mut passed = 0usize;

    for (key, value) in &candidate.specs {
        checks += 1;
        if spec_entry_ok(key, value, policy.spec_key_max_chars) {
            passed += 1;
        } else {
            notes.push(format!("malformed_spec:{key}"));
        }
    }

    let lore_chars = candidate.lore.trim().chars().count();
    if lore_chars < policy.lore_min_chars {
        notes.push("lore_too_short".into());
    } else if lore_chars > policy.lore_max_chars {
        notes.push("lore_too_long".into());
    } else {
        passed += 1;
    }

    passed as f64 / checks as f64
}

/// A specification entry is well formed when both sides are non-blank
/// single-line text and the key fits the length limit.
pub fn spec_entry_ok(key: &str, value: &str, key_max_chars: usize) -> bool {
    let key = key.trim();
    !key.is_empty()
        && key.chars().count() <= key_max_chars
        && !key.contains('\n')
        && !value.trim().is_empty()
}

// ---------------------------------------------------------------------------
// Batch report
// ---------------------------------------------------------------------------

fn build_report(
    candidates: &[CandidateRecord],
    results: &[EvaluationResult],
    config: &EvaluatorConfig,
) -> EvaluationReport {
    let mut recommendations = BTreeMap::new();
    for result in results {
        *recommendations
            .entry(result.recommendation.as_str().to_string())
            .or_default() += 1;
    }

    let mut coverage = Coverage::default();
    let mut quality = Quality::default();
    let mut canon_tags = BTreeMap::new();
    let mut id_counts: HashMap<String, usize> = HashMap::new();
    let mut url_counts: HashMap<&str, usize> = HashMap::new();
    let mut lore_counts: HashMap<String, usize> = HashMap::new();

    for candidate in candidates {
        *coverage.categories.entry(candidate.category.clone()).or_default() += 1;
        *coverage.rules.entry(candidate.rule.clone()).or_default() += 1;
        *quality
            .confidence_histogram
            .entry(confidence_bucket(candidate.confidence).to_string())
            .or_default() += 1;

        let required = &config.policy.required_fields;
        if required.iter().any(|f| !candidate.has_field(f)) {
            quality.missing_required_fields_count += 1;
        }

        if candidate.confidence < config.thresholds_for(&candidate.category).min_confidence {
            quality.low_confidence_count += 1;
            if quality.weak_record_samples.len() < WEAK_SAMPLE_LIMIT {
                quality.weak_record_samples.push(WeakRecord {
                    candidate_id: candidate.candidate_id.clone(),
                    id: candidate.id.clone(),
                    category: candidate.category.clone(),
                    confidence: candidate.confidence,
                    source_url: candidate.source_url().map(String::from),
                });
            }
        }

        for tag in &candidate.canon_tags {
            *canon_tags.entry(tag.clone()).or_default() += 1;
        }

        *id_counts
            .entry(format!("{}/{}", candidate.category, candidate.id))
            .or_default() += 1;
        if let Some(url) = candidate.source_url() {
            *url_counts.entry(url).or_default() += 1;
        }
        let lore = normalize_lore(&candidate.lore);
        if !lore.is_empty() {
            *lore_counts.entry(lore).or_default() += 1;
        }
    }

    let repeated = |counts: Vec<(String, usize)>| -> Vec<String> {
        let mut keys: Vec<String> = counts.into_iter().filter(|(_, n)| *n > 1).map(|(k, _)| k).collect();
        keys.sort();
        keys
    };
    let dup_ids = repeated(id_counts.into_iter().collect());
    let dup_urls = repeated(url_counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect());
    let dup_lore = lore_counts.values().filter(|n| **n > 1).count();

    EvaluationReport {
        run_at: Utc::now(),
        input_candidates: candidates.len(),
        recommendations,
        coverage,
        quality,
        duplicates: Duplicates {
            duplicate_id_count: dup_ids.len(),
            duplicate_url_count: dup_urls.len(),
            exact_duplicate_lore_count: dup_lore,
            duplicate_id_samples: dup_ids.into_iter().take(DUPLICATE_SAMPLE_LIMIT).collect(),
            duplicate_url_samples: dup_urls.into_iter().take(DUPLICATE_SAMPLE_LIMIT).collect(),
        },
        canon_tags,
    }
}

/// Histogram bucket label for a confidence value.
pub fn confidence_bucket(value: f64) -> &'static str {
    if value >= 0.9 {
        "0.90-1.00"
    } else if value >= 0.8 {
        "0.80-0.89"
    } else if value >= 0.7 {
        "0.70-0.79"
    } else if value >= 0.6 {
        "0.60-0.69"
    } else if value >= 0.5 {
        "0.50-0.59"
    } else {
        "<0.50"
    }
}

fn normalize_lore(lore: &str) -> String {
    let kept: String = lore
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::LevenshteinScorer;
    use crate::test_support::{candidate, canonical, temp_store};

    fn config() -> EvaluatorConfig {
        EvaluatorConfig::from(&AppConfig::default())
    }

    #[test]
    fn scores_complete_novel_candidate() {
        let (dir, store) = temp_store(&[("weapons", vec![canonical("laser_pistol", "LASER PISTOL")])]);
        let c = candidate("1:0", "weapons", "gauss_rifle", "GAUSS RIFLE");

        let out = evaluate(&[c], &store, &LevenshteinScorer::default(), &config());
        let r = &out.results[0];
        assert_eq!(r.completeness, 1.0);
        assert_eq!(r.consistency, 1.0);
        assert!(r.novelty > 0.3, "novelty {}", r.novelty);
        assert_eq!(r.nearest.as_ref().unwrap().record_id, "laser_pistol");
        assert_eq!(r.recommendation, Recommendation::Accept);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn holds_incomplete_and_rejects_inconsistent() {
        let (dir, store) = temp_store(&[("weapons", vec![])]);

        let mut incomplete = candidate("1:0", "weapons", "ripper", "RIPPER");
        incomplete.specs.clear();

        let mut malformed = candidate("2:0", "weapons", "shishkebab", "SHISHKEBAB");
        malformed.lore = "Hot.".into();
        malformed.specs.insert("   ".into(), "x".into());

        let unknown = candidate("3:0", "perks", "toughness", "TOUGHNESS");

        let mut cfg = config();
        cfg.policy.required_fields.push("Year".into());

        let out = evaluate(&[incomplete, malformed, unknown], &store, &LevenshteinScorer::default(), &cfg);
        assert_eq!(out.results[0].recommendation, Recommendation::Hold);
        assert!((out.results[0].completeness - 0.6).abs() < 1e-9);
        assert!(out.results[0].notes.contains(&"missing_field:specs".to_string()));
        assert_eq!(out.results[0].novelty, 1.0);

        // 1 of 3 checks passes: "Damage" spec ok, blank key and short lore fail.
        let m = &out.results[1];
        assert!((m.consistency - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.recommendation, Recommendation::Reject);
        assert!(m.notes.contains(&"lore_too_short".to_string()));

        assert_eq!(out.results[2].recommendation, Recommendation::Reject);
        assert!(out.results[2].notes.contains(&"unknown_category:perks".to_string()));

        assert_eq!(out.report.flagged(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn near_duplicates_are_held_and_updates_are_not() {
        let (dir, store) = temp_store(&[(
            "weapons",
            vec![
                canonical("laser_pistol", "LASER PISTOL"),
                canonical("laser_rifle", "LASER RIFLE"),
            ],
        )]);
        let update = candidate("1:0", "weapons", "laser_pistol", "LASER PISTOL");
        // One edit away on both id and name: 11/12 similar, below 0.92.
        let near = candidate("2:0", "weapons", "laser_rifles", "LASER RIFLES");

        let out = evaluate(&[update, near], &store, &LevenshteinScorer::default(), &config());
        assert_eq!(out.results[0].recommendation, Recommendation::Accept);
        assert!(out.results[0].notes.contains(&"likely_update:laser_pistol".to_string()));

        let held = &out.results[1];
        let similarity = held.nearest.as_ref().unwrap().similarity;
        assert!(similarity < 0.92 && similarity > 0.85, "similarity {similarity}");
        assert_eq!(held.recommendation, Recommendation::Hold);
        assert!(held.notes.contains(&"near_duplicate:laser_rifle".to_string()));

        let mut relaxed = config();
        relaxed.policy.default.min_novelty = 0.0;
        let near = candidate("2:0", "weapons", "laser_rifles", "LASER RIFLES");
        let out = evaluate(&[near], &store, &LevenshteinScorer::default(), &relaxed);
        assert_eq!(out.results[0].recommendation, Recommendation::Accept);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn report_counts_duplicates_and_buckets() {
        let (dir, store) = temp_store(&[("weapons", vec![])]);
        let a = candidate("1:0", "weapons", "laser_pistol", "LASER PISTOL");
        let mut b = candidate("1:1", "weapons", "laser_pistol", "LASER PISTOL");
        b.confidence = 0.42;
        let mut c = candidate("2:0", "weapons", "plasma_rifle", "PLASMA RIFLE");
        c.canon_tags.push("tv".into());
        c.sources[0].url = "https://fallout.fandom.com/wiki/Plasma_rifle".into();

        let out = evaluate(&[a, b, c], &store, &LevenshteinScorer::default(), &config());
        let report = &out.report;
        assert_eq!(report.input_candidates, 3);
        assert_eq!(report.coverage.categories.get("weapons"), Some(&3));
        assert_eq!(report.quality.confidence_histogram.get("0.80-0.89"), Some(&2));
        assert_eq!(report.quality.confidence_histogram.get("<0.50"), Some(&1));
        assert_eq!(report.quality.low_confidence_count, 1);
        assert_eq!(report.quality.weak_record_samples[0].candidate_id, "1:1");
        assert_eq!(report.duplicates.duplicate_id_count, 1);
        assert_eq!(report.duplicates.duplicate_id_samples, vec!["weapons/laser_pistol"]);
        assert_eq!(report.duplicates.duplicate_url_count, 1);
        assert_eq!(report.duplicates.exact_duplicate_lore_count, 1);
        assert_eq!(report.canon_tags.get("mainline"), Some(&3));
        assert_eq!(report.canon_tags.get("tv"), Some(&1));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn spec_entry_rules() {
        assert!(spec_entry_ok("Damage", "12", 48));
        assert!(!spec_entry_ok("Damage", " ", 48));
        assert!(!spec_entry_ok(&"k".repeat(49), "v", 48));
        assert!(!spec_entry_ok("a\nb", "v", 48));
        assert_eq!(confidence_bucket(0.9), "0.90-1.00");
        assert_eq!(confidence_bucket(0.499), "<0.50");
    }
}
