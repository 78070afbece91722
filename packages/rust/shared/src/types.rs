//! Core domain types flowing between pipeline stages.
//!
//! Every stage artifact is one of these records serialized as a JSON line.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for run manifests and stage artifacts.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// How a seed entered the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOrigin {
    /// Listed directly in the curated seed file.
    Direct,
    /// Resolved as a member of a curated category.
    Category,
}

/// A crawl starting point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    /// Canonical page title.
    pub title: String,
    /// Article URL on the wiki.
    pub url: String,
    /// Direct page or category expansion.
    pub origin: SeedOrigin,
    /// Categories this title was resolved from (empty for pure direct seeds).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Remaining hops the crawler may follow from this seed.
    pub hop_budget: u32,
}

// ---------------------------------------------------------------------------
// FetchedPage
// ---------------------------------------------------------------------------

/// A `key: value` pair lifted from an infobox, two-column table, or list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecEntry {
    pub key: String,
    pub value: String,
}

/// A multi-column table found in a section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionTable {
    /// Header cells (may be empty if the table has no header row).
    #[serde(default)]
    pub headers: Vec<String>,
    /// Body rows, one `Vec` of cell texts per row.
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// One section of a page, bounded by headings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSection {
    /// Heading text (empty for the lead section).
    pub heading: String,
    /// Heading level (0 for the lead section, 2..=4 otherwise).
    pub level: u8,
    /// Flattened prose of the section.
    #[serde(default)]
    pub text: String,
    /// Key/value pairs extracted from structured markup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<SpecEntry>,
    /// Multi-column tables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<SectionTable>,
    /// Plain list items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

/// One page retrieved by the crawler. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Wiki page id.
    pub page_id: u64,
    /// Canonical title (after redirect resolution).
    pub title: String,
    /// MediaWiki namespace number.
    pub namespace: i64,
    /// Full article URL.
    pub url: String,
    /// Plain-text intro extract.
    #[serde(default)]
    pub lead_summary: String,
    /// Plain text of every section, joined.
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub sections: Vec<PageSection>,
    /// Visible (non-hidden) categories, without the `Category:` prefix.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Outbound article-namespace links.
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_timestamp: Option<DateTime<Utc>>,
    /// Lead image thumbnail URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// SHA-256 of the extracted text.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    /// Title of the seed whose traversal reached this page.
    pub seed: String,
    /// Hop distance from the seed.
    pub depth: u32,
}

impl FetchedPage {
    /// Timestamp used by the conflict policy: last revision, else fetch time.
    pub fn source_timestamp(&self) -> DateTime<Utc> {
        self.revision_timestamp.unwrap_or(self.fetched_at)
    }

    /// Reference to this page for candidate/provenance records.
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            page_id: self.page_id,
            title: self.title.clone(),
            url: self.url.clone(),
            revision_id: self.revision_id,
        }
    }
}

// ---------------------------------------------------------------------------
// CandidateRecord
// ---------------------------------------------------------------------------

/// Pointer from a derived record back to the page it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub page_id: u64,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<u64>,
}

/// Scores that explain a candidate's confidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateSignals {
    /// Raw weighted keyword score of the winning rule.
    pub match_score: f64,
    /// Fraction of required fields populated.
    pub completeness: f64,
    /// Category minimum confidence in effect.
    pub min_confidence: f64,
}

/// A proposed, not-yet-merged lore entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Stable key: `<page_id>:<ordinal>`.
    pub candidate_id: String,
    /// Target category in the canonical store.
    pub category: String,
    /// Proposed identifier (slug).
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
    #[serde(default)]
    pub lore: String,
    pub confidence: f64,
    #[serde(default)]
    pub canon_tags: Vec<String>,
    /// Image of the source page, when it describes this one item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Pages the candidate was derived from.
    pub sources: Vec<SourceRef>,
    /// Revision time of the newest source page.
    pub source_timestamp: DateTime<Utc>,
    /// Position of the source page in the normalizer input; the merge order key.
    pub page_order: usize,
    /// Name of the rule that produced the candidate.
    pub rule: String,
    #[serde(default)]
    pub signals: CandidateSignals,
    pub extracted_at: DateTime<Utc>,
}

impl CandidateRecord {
    /// Whether a required field is populated.
    ///
    /// `id`, `name`, `lore`, `specs`, and `category` refer to the record
    /// fields; any other name is looked up as a specification key.
    pub fn has_field(&self, field: &str) -> bool {
        match field {
            "id" => !self.id.trim().is_empty(),
            "name" => !self.name.trim().is_empty(),
            "lore" => !self.lore.trim().is_empty(),
            "category" => !self.category.trim().is_empty(),
            "specs" => !self.specs.is_empty(),
            key => self.specs.get(key).is_some_and(|v| !v.trim().is_empty()),
        }
    }

    /// Fraction of `fields` that are populated (1.0 when `fields` is empty).
    pub fn completeness(&self, fields: &[String]) -> f64 {
        if fields.is_empty() {
            return 1.0;
        }
        let present = fields.iter().filter(|f| self.has_field(f)).count();
        present as f64 / fields.len() as f64
    }

    /// Primary source page URL.
    pub fn source_url(&self) -> Option<&str> {
        self.sources.first().map(|s| s.url.as_str())
    }
}

// ---------------------------------------------------------------------------
// EvaluationResult
// ---------------------------------------------------------------------------

/// Advisory recommendation from the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Accept,
    Hold,
    Reject,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Hold => "hold",
            Self::Reject => "reject",
        }
    }
}

/// Closest existing canonical record for a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestMatch {
    pub record_id: String,
    pub similarity: f64,
}

/// Advisory scores for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub candidate_id: String,
    pub category: String,
    pub id: String,
    pub completeness: f64,
    pub consistency: f64,
    /// `1 - similarity` to the nearest record (1.0 when the category is empty).
    pub novelty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nearest: Option<NearestMatch>,
    pub recommendation: Recommendation,
    /// Human-readable flags explaining the recommendation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// CanonicalRecord
// ---------------------------------------------------------------------------

/// A persisted lore entry as consumed by the front end.
///
/// Fields the pipeline does not manage (images, flags) are kept in `extra`
/// and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub name: String,
    /// Numbers and booleans in hand-edited stores are read as strings.
    #[serde(default, deserialize_with = "scalar_specs")]
    pub specs: BTreeMap<String, String>,
    #[serde(default)]
    pub lore: String,
    /// Source time of the newest value written into this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Per-field source times (`name`, `lore`, `specs.<key>`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_updated_at: BTreeMap<String, DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn scalar_specs<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "spec '{key}' must be a string, number, or boolean, got {other}"
                    )));
                }
            };
            Ok((key, value))
        })
        .collect()
}

impl CanonicalRecord {
    /// Last-updated time for a single field, falling back to the record time.
    pub fn field_timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.field_updated_at
            .get(field)
            .copied()
            .or(self.updated_at)
    }
}

// ---------------------------------------------------------------------------
// Merge audit trail
// ---------------------------------------------------------------------------

/// Outcome of one candidate in the merge engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    New,
    Updated,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Rejected => "rejected",
        }
    }
}

/// Machine-readable reason attached to every merge decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NewRecord,
    NewRecordSuffixed,
    DuplicateMerged,
    CanonFiltered,
    UnknownCategory,
    MissingRequiredField,
    MalformedSpecification,
    IdentifierCollision,
    ExistingSkipped,
    InsertLimitReached,
    UpdateLimitReached,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewRecord => "new_record",
            Self::NewRecordSuffixed => "new_record_suffixed",
            Self::DuplicateMerged => "duplicate_merged",
            Self::CanonFiltered => "canon_filtered",
            Self::UnknownCategory => "unknown_category",
            Self::MissingRequiredField => "missing_required_field",
            Self::MalformedSpecification => "malformed_specification",
            Self::IdentifierCollision => "identifier_collision",
            Self::ExistingSkipped => "existing_skipped",
            Self::InsertLimitReached => "insert_limit_reached",
            Self::UpdateLimitReached => "update_limit_reached",
        }
    }
}

/// Append-only record of one candidate's merge outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeDecision {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub candidate_id: String,
    pub category: String,
    /// Identifier proposed by the candidate.
    pub proposed_id: String,
    /// Identifier of the record written (absent for rejections).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub verdict: Verdict,
    pub reason: ReasonCode,
    /// Similarity to the nearest record in the category (absent if none was scored).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nearest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    /// Evaluator recommendation, if one was supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only link between a canonical record and the pages/run that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub record_id: String,
    pub action: Verdict,
    /// Fields this candidate wrote (all fields for a new record).
    #[serde(default)]
    pub fields: Vec<String>,
    pub candidate_id: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f64,
}
