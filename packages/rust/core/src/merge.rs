//! The merge engine: the only writer of canonical state.
//!
//! Candidates are processed one at a time in `(page_order, candidate_id)`
//! order. Each produces exactly one [`MergeDecision`]; accepted candidates
//! also produce exactly one [`ProvenanceRecord`]. Per-candidate problems are
//! rejections, while a failure to persist the store or its logs aborts the
//! run. The in-flight candidate's change is undone in memory and, when the
//! store was already written, on disk too.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use loreforge_shared::{
    CandidateRecord, CanonicalRecord, CollisionPolicy, ConflictPolicy, EvaluationResult,
    MergeConfig, MergeDecision, ProvenanceRecord, ReasonCode, Recommendation, Result, RunId,
    Verdict,
};
use loreforge_storage::{AppendLog, CanonicalStore};

use crate::evaluator::spec_entry_ok;
use crate::similarity::{LevenshteinScorer, SimilarityScorer, nearest};

/// Longest specification key accepted by the merge validator.
const SPEC_KEY_MAX_CHARS: usize = 48;

const PLACEHOLDER_IMAGE_BASE: &str = "https://placehold.co/300x200/111100/33ff33?text=";
const PLACEHOLDER_TEXT_CHARS: usize = 26;

/// Counts for one merge run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub candidates_in: usize,
    pub new: usize,
    pub updated: usize,
    pub rejected: usize,
    /// Fields written into existing records.
    pub fields_changed: usize,
    pub reject_reasons: BTreeMap<String, usize>,
    pub conflict_policy: ConflictPolicy,
    pub duplicate_threshold: f64,
    pub canon_allowed: Vec<String>,
}

impl MergeStats {
    /// `candidates_in == new + updated + rejected`.
    pub fn is_balanced(&self) -> bool {
        self.candidates_in == self.new + self.updated + self.rejected
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub stats: MergeStats,
    pub decisions: Vec<MergeDecision>,
}

/// A store mutation waiting to be committed.
enum Change {
    Insert(CanonicalRecord),
    Replace(CanonicalRecord),
}

enum Undo {
    Remove(String),
    Restore(CanonicalRecord),
}

/// What happened to one candidate before it is written.
struct Resolution {
    verdict: Verdict,
    reason: ReasonCode,
    record_id: Option<String>,
    nearest: Option<(String, f64)>,
    changed_fields: Vec<String>,
    detail: Option<String>,
    change: Option<Change>,
}

impl Resolution {
    fn reject(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Rejected,
            reason,
            record_id: None,
            nearest: None,
            changed_fields: Vec::new(),
            detail: Some(detail.into()),
            change: None,
        }
    }

    fn with_nearest(mut self, nearest: Option<(String, f64)>) -> Self {
        self.nearest = nearest;
        self
    }
}

/// Single-writer merge of candidates into a canonical store.
pub struct MergeEngine {
    config: MergeConfig,
    run_id: RunId,
    store: CanonicalStore,
    scorer: Box<dyn SimilarityScorer>,
    decisions: AppendLog<MergeDecision>,
    provenance: AppendLog<ProvenanceRecord>,
    advisories: HashMap<String, Recommendation>,
}

impl MergeEngine {
    /// Engine over an already loaded store, logging to the configured paths.
    pub fn new(config: MergeConfig, store: CanonicalStore, run_id: RunId) -> Result<Self> {
        config.validate()?;
        let decisions = AppendLog::new(&config.decision_log);
        let provenance = AppendLog::new(&config.provenance_log);
        Ok(Self {
            config,
            run_id,
            store,
            scorer: Box::new(LevenshteinScorer::default()),
            decisions,
            provenance,
            advisories: HashMap::new(),
        })
    }

    /// Replace the similarity measure.
    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Attach evaluator recommendations, recorded on each decision.
    pub fn with_advisories(mut self, evaluations: &[EvaluationResult]) -> Self {
        self.advisories = evaluations
            .iter()
            .map(|e| (e.candidate_id.clone(), e.recommendation))
            .collect();
        self
    }

    pub fn store(&self) -> &CanonicalStore {
        &self.store
    }

    pub fn into_store(self) -> CanonicalStore {
        self.store
    }

    /// Merge every candidate. Returns `Err` only for store or log failures.
    #[instrument(skip_all, fields(run_id = %self.run_id, candidates = candidates.len()))]
    pub fn run(&mut self, mut candidates: Vec<CandidateRecord>) -> Result<MergeOutcome> {
        candidates.sort_by(|a, b| {
            a.page_order
                .cmp(&b.page_order)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });

        let mut stats = MergeStats {
            candidates_in: candidates.len(),
            conflict_policy: self.config.conflict_policy,
            duplicate_threshold: self.config.duplicate_threshold,
            canon_allowed: self.config.canon_allowed.clone(),
            ..MergeStats::default()
        };
        let mut decisions = Vec::with_capacity(candidates.len());

        for candidate in &candidates {
            let resolution = self.resolve(candidate, &stats);
            let decision = self.commit(candidate, resolution)?;

            match decision.verdict {
                Verdict::New => stats.new += 1,
                Verdict::Updated => {
                    stats.updated += 1;
                    stats.fields_changed += decision.changed_fields.len();
                }
                Verdict::Rejected => {
                    stats.rejected += 1;
                    *stats
                        .reject_reasons
                        .entry(decision.reason.as_str().to_string())
                        .or_default() += 1;
                }
            }
            decisions.push(decision);
        }

        info!(
            new = stats.new,
            updated = stats.updated,
            rejected = stats.rejected,
            "merge completed"
        );
        Ok(MergeOutcome { stats, decisions })
    }

    // -----------------------------------------------------------------------
    // Resolution (no side effects)
    // -----------------------------------------------------------------------

    fn resolve(&self, candidate: &CandidateRecord, stats: &MergeStats) -> Resolution {
        let category = candidate.category.as_str();

        if self.config.excluded_categories.iter().any(|c| c == category) {
            return Resolution::reject(ReasonCode::CanonFiltered, format!("category '{category}' is excluded"));
        }
        if !candidate
            .canon_tags
            .iter()
            .any(|t| self.config.canon_allowed.contains(t))
        {
            return Resolution::reject(
                ReasonCode::CanonFiltered,
                format!("canon tags {:?} not allowed", candidate.canon_tags),
            );
        }
        if !self.store.has_category(category) {
            return Resolution::reject(ReasonCode::UnknownCategory, format!("no category '{category}' in store"));
        }
        if let Some(field) = self
            .config
            .required_fields
            .iter()
            .find(|f| !candidate.has_field(f))
        {
            return Resolution::reject(ReasonCode::MissingRequiredField, format!("missing {field}"));
        }
        if let Some((key, _)) = candidate
            .specs
            .iter()
            .find(|(k, v)| !spec_entry_ok(k, v, SPEC_KEY_MAX_CHARS))
        {
            return Resolution::reject(ReasonCode::MalformedSpecification, format!("bad entry '{key}'"));
        }

        let records = self.store.records(category);
        let scored = nearest(self.scorer.as_ref(), candidate, records).map(|(r, s)| (r.clone(), s));

        match scored {
            Some((existing, similarity)) if similarity >= self.config.duplicate_threshold => {
                let id = existing.id.clone();
                self.resolve_duplicate(candidate, existing, stats)
                    .with_nearest(Some((id, similarity)))
            }
            other => self
                .resolve_new(candidate, stats)
                .with_nearest(other.map(|(r, s)| (r.id, s))),
        }
    }

    fn resolve_duplicate(
        &self,
        candidate: &CandidateRecord,
        existing: CanonicalRecord,
        stats: &MergeStats,
    ) -> Resolution {
        if self.config.conflict_policy == ConflictPolicy::SkipExisting {
            return Resolution::reject(ReasonCode::ExistingSkipped, format!("duplicate of '{}'", existing.id));
        }
        if self.config.max_updates > 0 && stats.updated >= self.config.max_updates {
            return Resolution::reject(
                ReasonCode::UpdateLimitReached,
                format!("max_updates {} reached", self.config.max_updates),
            );
        }

        let record_id = existing.id.clone();
        let (updated, changed_fields) = apply_conflict_policy(existing, candidate, self.config.conflict_policy);
        let change = (!changed_fields.is_empty()).then_some(Change::Replace(updated));

        Resolution {
            verdict: Verdict::Updated,
            reason: ReasonCode::DuplicateMerged,
            record_id: Some(record_id),
            nearest: None,
            changed_fields,
            detail: None,
            change,
        }
    }

    fn resolve_new(&self, candidate: &CandidateRecord, stats: &MergeStats) -> Resolution {
        if self.config.max_inserts > 0 && stats.new >= self.config.max_inserts {
            return Resolution::reject(
                ReasonCode::InsertLimitReached,
                format!("max_inserts {} reached", self.config.max_inserts),
            );
        }

        let category = candidate.category.as_str();
        let (id, reason) = if !self.store.contains_id(category, &candidate.id) {
            (candidate.id.clone(), ReasonCode::NewRecord)
        } else {
            match self.config.collision_policy {
                CollisionPolicy::Reject => {
                    return Resolution::reject(
                        ReasonCode::IdentifierCollision,
                        format!("'{}' already exists", candidate.id),
                    );
                }
                CollisionPolicy::Suffix => {
                    let free = (2..=self.config.max_suffix)
                        .map(|n| format!("{}_{n}", candidate.id))
                        .find(|id| !self.store.contains_id(category, id));
                    match free {
                        Some(id) => (id, ReasonCode::NewRecordSuffixed),
                        None => {
                            return Resolution::reject(
                                ReasonCode::IdentifierCollision,
                                format!("'{}' and suffixes up to _{} are taken", candidate.id, self.config.max_suffix),
                            );
                        }
                    }
                }
            }
        };

        let record = new_record(&id, candidate);
        let changed_fields = written_fields(&record);
        Resolution {
            verdict: Verdict::New,
            reason,
            record_id: Some(id),
            nearest: None,
            changed_fields,
            detail: None,
            change: Some(Change::Insert(record)),
        }
    }

    // -----------------------------------------------------------------------
    // Commit (store, provenance, decision)
    // -----------------------------------------------------------------------

    fn commit(&mut self, candidate: &CandidateRecord, resolution: Resolution) -> Result<MergeDecision> {
        let category = candidate.category.as_str();
        let now = Utc::now();

        let undo = match resolution.change {
            Some(change) => {
                let undo = self.apply(category, change)?;
                if let Err(e) = self.store.persist() {
                    self.rollback(category, undo);
                    return Err(e);
                }
                Some(undo)
            }
            None => None,
        };

        if resolution.verdict != Verdict::Rejected {
            let entry = ProvenanceRecord {
                run_id: self.run_id.clone(),
                timestamp: now,
                category: category.to_string(),
                record_id: resolution.record_id.clone().unwrap_or_default(),
                action: resolution.verdict,
                fields: resolution.changed_fields.clone(),
                candidate_id: candidate.candidate_id.clone(),
                sources: candidate.sources.clone(),
                confidence: candidate.confidence,
            };
            if let Err(e) = self.provenance.append(&entry) {
                self.revert_persisted(category, undo);
                return Err(e);
            }
        }

        let decision = MergeDecision {
            run_id: self.run_id.clone(),
            timestamp: now,
            candidate_id: candidate.candidate_id.clone(),
            category: category.to_string(),
            proposed_id: candidate.id.clone(),
            record_id: resolution.record_id,
            verdict: resolution.verdict,
            reason: resolution.reason,
            similarity: resolution.nearest.as_ref().map(|(_, s)| *s),
            nearest_id: resolution.nearest.map(|(id, _)| id),
            changed_fields: resolution.changed_fields,
            advisory: self.advisories.get(&candidate.candidate_id).copied(),
            detail: resolution.detail,
        };
        if let Err(e) = self.decisions.append(&decision) {
            self.revert_persisted(category, undo);
            return Err(e);
        }

        debug!(
            candidate_id = %decision.candidate_id,
            verdict = decision.verdict.as_str(),
            reason = decision.reason.as_str(),
            "candidate merged"
        );
        Ok(decision)
    }

    /// Apply a change in memory, returning how to undo it.
    fn apply(&mut self, category: &str, change: Change) -> Result<Undo> {
        match change {
            Change::Insert(record) => {
                let id = record.id.clone();
                self.store.insert(category, record)?;
                Ok(Undo::Remove(id))
            }
            Change::Replace(record) => {
                let previous = self.store.replace(category, record)?;
                Ok(Undo::Restore(previous))
            }
        }
    }

    /// Undo a change that already reached disk: restore memory, then persist
    /// the previous state again.
    fn revert_persisted(&mut self, category: &str, undo: Option<Undo>) {
        let Some(undo) = undo else {
            return;
        };
        self.rollback(category, undo);
        if let Err(e) = self.store.persist() {
            warn!(category, error = %e, "could not restore store after log failure");
        }
    }

    fn rollback(&mut self, category: &str, undo: Undo) {
        let restored = match undo {
            Undo::Remove(id) => self.store.remove(category, &id).is_some(),
            Undo::Restore(previous) => self.store.replace(category, previous).is_ok(),
        };
        if !restored {
            warn!(category, "could not roll back in-memory store change");
        }
    }
}

// ---------------------------------------------------------------------------
// Record construction and conflict policies
// ---------------------------------------------------------------------------

fn new_record(id: &str, candidate: &CandidateRecord) -> CanonicalRecord {
    let ts = candidate.source_timestamp;
    let name = candidate.name.trim().to_uppercase();

    let mut field_updated_at = BTreeMap::new();
    field_updated_at.insert("name".to_string(), ts);
    field_updated_at.insert("lore".to_string(), ts);
    for key in candidate.specs.keys() {
        field_updated_at.insert(format!("specs.{key}"), ts);
    }

    let img = candidate
        .image
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map_or_else(|| placeholder_image(&name), String::from);
    let mut extra = serde_json::Map::new();
    extra.insert("img".into(), serde_json::Value::String(img));

    CanonicalRecord {
        id: id.to_string(),
        name,
        specs: candidate.specs.clone(),
        lore: candidate.lore.trim().to_string(),
        updated_at: Some(ts),
        field_updated_at,
        extra,
    }
}

fn written_fields(record: &CanonicalRecord) -> Vec<String> {
    let mut fields = vec!["id".to_string(), "name".to_string(), "lore".to_string()];
    fields.extend(record.specs.keys().map(|k| format!("specs.{k}")));
    fields
}

/// Placeholder image URL showing the first characters of the name.
pub fn placeholder_image(name: &str) -> String {
    let text: String = name.chars().take(PLACEHOLDER_TEXT_CHARS).collect();
    format!("{PLACEHOLDER_IMAGE_BASE}{}", urlencoding::encode(&text))
}

/// Merge `candidate` into `existing` field by field.
///
/// Empty candidate values never overwrite. Under `prefer_newer` a populated
/// field is replaced only when the candidate's source time is strictly newer
/// than that field's last update; empty fields are always filled. Under
/// `conservative` only empty fields are filled.
pub fn apply_conflict_policy(
    mut existing: CanonicalRecord,
    candidate: &CandidateRecord,
    policy: ConflictPolicy,
) -> (CanonicalRecord, Vec<String>) {
    let ts = candidate.source_timestamp;
    let mut changed = Vec::new();

    let name = candidate.name.trim().to_uppercase();
    if should_write(&existing, "name", &existing.name, &name, ts, policy) {
        existing.name = name;
        changed.push("name".to_string());
    }

    let lore = candidate.lore.trim().to_string();
    if should_write(&existing, "lore", &existing.lore, &lore, ts, policy) {
        existing.lore = lore;
        changed.push("lore".to_string());
    }

    for (key, value) in &candidate.specs {
        let field = format!("specs.{key}");
        let current = existing.specs.get(key).cloned().unwrap_or_default();
        if should_write(&existing, &field, &current, value, ts, policy) {
            existing.specs.insert(key.clone(), value.clone());
            changed.push(field);
        }
    }

    if !changed.is_empty() {
        for field in &changed {
            existing.field_updated_at.insert(field.clone(), ts);
        }
        if existing.updated_at.is_none_or(|u| ts > u) {
            existing.updated_at = Some(ts);
        }
    }
    (existing, changed)
}

fn should_write(
    record: &CanonicalRecord,
    field: &str,
    current: &str,
    incoming: &str,
    ts: DateTime<Utc>,
    policy: ConflictPolicy,
) -> bool {
    if incoming.trim().is_empty() || current == incoming {
        return false;
    }
    if current.trim().is_empty() {
        return policy != ConflictPolicy::SkipExisting;
    }
    match policy {
        ConflictPolicy::PreferNewer => record.field_timestamp(field).is_none_or(|t| ts > t),
        ConflictPolicy::Conservative | ConflictPolicy::SkipExisting => false,
    }
}
