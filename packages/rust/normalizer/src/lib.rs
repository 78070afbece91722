//! Page normalizer: maps fetched pages to candidate records.
//!
//! Each page is either normalized (yielding one or more candidates) or
//! skipped with exactly one [`NormalizeSkipReason`], so
//! `pages_in == pages_normalized + pages_skipped` always holds.

pub mod rules;
pub mod text;

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use loreforge_shared::{CandidateRecord, CandidateSignals, FetchedPage, SectionTable};

pub use rules::{ConfidenceThresholds, Exclusions, Extractor, Rule, RuleMatch, RuleTable};
pub use text::{find_year, first_sentences, slugify};

use rules::PageText;

/// Lead text shorter than this falls back to the full text.
const LEAD_MIN_CHARS: usize = 45;
/// Lore shorter than this rejects a single-record page.
const LORE_MIN_CHARS: usize = 25;
const LEAD_SENTENCES: usize = 2;
const FULL_TEXT_SENTENCES: usize = 3;

const BASE_CONFIDENCE: f64 = 0.30;
const STRENGTH_WEIGHT: f64 = 0.45;
const COMPLETENESS_WEIGHT: f64 = 0.20;
const YEAR_BONUS: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.99;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Why a page produced no candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeSkipReason {
    UrlBlocked,
    TitleBlocked,
    CategoryBlocked,
    /// Same source URL as an earlier page in the batch.
    DuplicatePage,
    /// No rule reached its minimum score.
    Unmapped,
    MissingTitle,
    LoreTooShort,
    LowConfidence,
    /// A listing rule matched but the page has no usable table rows.
    NoRows,
}

impl NormalizeSkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UrlBlocked => "url_blocked",
            Self::TitleBlocked => "title_blocked",
            Self::CategoryBlocked => "category_blocked",
            Self::DuplicatePage => "duplicate_page",
            Self::Unmapped => "unmapped",
            Self::MissingTitle => "missing_title",
            Self::LoreTooShort => "lore_too_short",
            Self::LowConfidence => "low_confidence",
            Self::NoRows => "no_rows",
        }
    }
}

/// One entry of the normalizer skip log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeSkip {
    pub page_id: u64,
    pub title: String,
    pub url: String,
    pub reason: NormalizeSkipReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub pages_in: usize,
    pub pages_normalized: usize,
    pub pages_skipped: usize,
    pub candidates: usize,
    /// Listing rows dropped for low confidence on otherwise normalized pages.
    pub rows_dropped: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    /// Normalized pages per winning rule.
    pub rules_matched: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct NormalizeOutput {
    pub candidates: Vec<CandidateRecord>,
    pub skips: Vec<NormalizeSkip>,
    pub stats: NormalizeStats,
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

type PageResult = std::result::Result<(Vec<CandidateRecord>, usize), (NormalizeSkipReason, Option<String>)>;

/// Stateless page-to-candidate mapper.
pub struct Normalizer {
    rules: RuleTable,
    required_fields: Vec<String>,
}

impl Normalizer {
    /// `required_fields` drive the completeness part of the confidence score.
    pub fn new(rules: RuleTable, required_fields: Vec<String>) -> Self {
        Self {
            rules,
            required_fields,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Normalize a batch of pages in order.
    #[instrument(skip_all, fields(pages = pages.len()))]
    pub fn normalize(&self, pages: &[FetchedPage]) -> NormalizeOutput {
        let mut candidates = Vec::new();
        let mut skips = Vec::new();
        let mut stats = NormalizeStats {
            pages_in: pages.len(),
            ..NormalizeStats::default()
        };
        let mut seen_urls: HashSet<&str> = HashSet::new();

        for (order, page) in pages.iter().enumerate() {
            let result = if seen_urls.insert(page.url.as_str()) {
                self.normalize_page(page, order)
            } else {
                Err((NormalizeSkipReason::DuplicatePage, None))
            };

            match result {
                Ok((page_candidates, dropped)) => {
                    stats.pages_normalized += 1;
                    stats.rows_dropped += dropped;
                    if let Some(first) = page_candidates.first() {
                        *stats.rules_matched.entry(first.rule.clone()).or_default() += 1;
                    }
                    candidates.extend(page_candidates);
                }
                Err((reason, detail)) => {
                    debug!(title = %page.title, reason = reason.as_str(), "page skipped");
                    stats.pages_skipped += 1;
                    *stats.skip_reasons.entry(reason.as_str().to_string()).or_default() += 1;
                    skips.push(NormalizeSkip {
                        page_id: page.page_id,
                        title: page.title.clone(),
                        url: page.url.clone(),
                        reason,
                        detail,
                    });
                }
            }
        }

        stats.candidates = candidates.len();
        info!(
            pages_normalized = stats.pages_normalized,
            pages_skipped = stats.pages_skipped,
            candidates = stats.candidates,
            "normalization completed"
        );

        NormalizeOutput {
            candidates,
            skips,
            stats,
        }
    }

    fn normalize_page(&self, page: &FetchedPage, order: usize) -> PageResult {
        if let Some(reason) = self.rules.exclusion(page) {
            return Err((reason, None));
        }

        let title = page.title.trim();
        if title.is_empty() {
            return Err((NormalizeSkipReason::MissingTitle, None));
        }

        let page_text = PageText::of(page);
        let Some(matched) = self.rules.match_text(&page_text) else {
            return Err((NormalizeSkipReason::Unmapped, None));
        };

        let context = PageContext::new(page, &self.rules, &page_text, matched, order);
        match matched.rule.extractor {
            Extractor::Infobox | Extractor::LeadOnly => self.single_record(page, &context),
            Extractor::Listing => self.listing_records(page, &context),
        }
    }

    fn single_record(&self, page: &FetchedPage, ctx: &PageContext<'_>) -> PageResult {
        let lore = page_lore(page);
        if lore.chars().count() < LORE_MIN_CHARS {
            return Err((
                NormalizeSkipReason::LoreTooShort,
                Some(format!("{} chars", lore.chars().count())),
            ));
        }

        let mut specs = BTreeMap::new();
        if ctx.rule_match.rule.extractor == Extractor::Infobox {
            for entry in page.sections.iter().flat_map(|s| &s.entries) {
                let key = clean_key(&entry.key);
                let value = text::squash(&entry.value);
                if !key.is_empty() && !value.is_empty() {
                    specs.entry(key).or_insert(value);
                }
            }
        }
        ctx.add_page_specs(&mut specs, true);

        let title = page.title.trim();
        let candidate = ctx.candidate(0, slugify(title), title.to_uppercase(), specs, lore);
        let candidate = self.score(candidate, ctx)?;
        Ok((vec![candidate], 0))
    }

    fn listing_records(&self, page: &FetchedPage, ctx: &PageContext<'_>) -> PageResult {
        let page_lore = page_lore(page);
        let tables: Vec<&SectionTable> = page.sections.iter().flat_map(|s| &s.tables).collect();

        let mut out = Vec::new();
        let mut dropped = 0;
        let mut ordinal = 0;

        for table in tables {
            for row in &table.rows {
                let Some(name) = row.first().map(|c| text::squash(c)).filter(|n| !n.is_empty()) else {
                    continue;
                };

                let mut specs = BTreeMap::new();
                let mut description: Option<String> = None;
                for (idx, cell) in row.iter().enumerate().skip(1) {
                    let value = text::squash(cell);
                    if value.is_empty() {
                        continue;
                    }
                    let header = table.headers.get(idx).map(|h| clean_key(h)).unwrap_or_default();
                    let lowered = header.to_lowercase();
                    if lowered.contains("description") || lowered.contains("notes") {
                        description = Some(value);
                        continue;
                    }
                    let key = if header.is_empty() {
                        format!("Column {}", idx + 1)
                    } else {
                        header
                    };
                    specs.entry(key).or_insert(value);
                }
                ctx.add_page_specs(&mut specs, false);

                let lore = description
                    .map(|d| first_sentences(&d, FULL_TEXT_SENTENCES))
                    .unwrap_or_else(|| page_lore.clone());

                let candidate = ctx.candidate(ordinal, slugify(&name), name.to_uppercase(), specs, lore);
                ordinal += 1;
                match self.score(candidate, ctx) {
                    Ok(candidate) => out.push(candidate),
                    Err(_) => dropped += 1,
                }
            }
        }

        if out.is_empty() {
            return Err(if dropped > 0 {
                (
                    NormalizeSkipReason::LowConfidence,
                    Some(format!("all {dropped} rows below threshold")),
                )
            } else {
                (NormalizeSkipReason::NoRows, None)
            });
        }
        Ok((out, dropped))
    }

    /// Fill in confidence and signals; reject below the category minimum.
    fn score(
        &self,
        mut candidate: CandidateRecord,
        ctx: &PageContext<'_>,
    ) -> std::result::Result<CandidateRecord, (NormalizeSkipReason, Option<String>)> {
        let strength = (ctx.rule_match.score / self.rules.strength_scale).min(1.0);
        let completeness = candidate.completeness(&self.required_fields);

        let mut confidence = BASE_CONFIDENCE + STRENGTH_WEIGHT * strength + COMPLETENESS_WEIGHT * completeness;
        if ctx.year.is_some() {
            confidence += YEAR_BONUS;
        }
        let confidence = round3(confidence.clamp(0.0, MAX_CONFIDENCE));
        let min_confidence = self.rules.min_confidence(&candidate.category);

        candidate.confidence = confidence;
        candidate.signals = CandidateSignals {
            match_score: round3(ctx.rule_match.score),
            completeness: round3(completeness),
            min_confidence,
        };

        if confidence < min_confidence {
            return Err((
                NormalizeSkipReason::LowConfidence,
                Some(format!("{confidence} < {min_confidence}")),
            ));
        }
        Ok(candidate)
    }
}

/// Page-level values shared by every candidate of one page.
struct PageContext<'a> {
    page: &'a FetchedPage,
    rule_match: RuleMatch<'a>,
    year: Option<u16>,
    source_label: &'a str,
    canon_tags: Vec<String>,
    order: usize,
}

impl<'a> PageContext<'a> {
    fn new(
        page: &'a FetchedPage,
        rules: &'a RuleTable,
        page_text: &PageText,
        rule_match: RuleMatch<'a>,
        order: usize,
    ) -> Self {
        let context = [
            page.title.as_str(),
            page.lead_summary.as_str(),
            page.full_text.as_str(),
            page.categories.join(" ").as_str(),
        ]
        .join(" ");

        Self {
            page,
            rule_match,
            year: find_year(&context),
            source_label: &rules.source_label,
            canon_tags: rules.canon_tags(page_text),
            order,
        }
    }

    fn add_page_specs(&self, specs: &mut BTreeMap<String, String>, with_year: bool) {
        specs
            .entry("Source".to_string())
            .or_insert_with(|| self.source_label.to_string());
        if with_year {
            if let Some(year) = self.year {
                specs.entry("Year".to_string()).or_insert_with(|| year.to_string());
            }
        }
        if let Some(revision) = self.page.revision_id {
            specs.entry("Revision".to_string()).or_insert_with(|| revision.to_string());
        }
    }

    fn candidate(
        &self,
        ordinal: usize,
        id: String,
        name: String,
        specs: BTreeMap<String, String>,
        lore: String,
    ) -> CandidateRecord {
        CandidateRecord {
            candidate_id: format!("{}:{ordinal}", self.page.page_id),
            category: self.rule_match.rule.category.clone(),
            id,
            name,
            specs,
            lore,
            confidence: 0.0,
            canon_tags: self.canon_tags.clone(),
            image: match self.rule_match.rule.extractor {
                Extractor::Listing => None,
                Extractor::Infobox | Extractor::LeadOnly => self.page.image.clone(),
            },
            sources: vec![self.page.source_ref()],
            source_timestamp: self.page.source_timestamp(),
            page_order: self.order,
            rule: self.rule_match.rule.name.clone(),
            signals: CandidateSignals::default(),
            extracted_at: Utc::now(),
        }
    }
}

/// Lead sentences, falling back to the full text when the lead is too short.
fn page_lore(page: &FetchedPage) -> String {
    let lore = first_sentences(&page.lead_summary, LEAD_SENTENCES);
    if lore.chars().count() >= LEAD_MIN_CHARS {
        return lore;
    }
    let fallback = first_sentences(&page.full_text, FULL_TEXT_SENTENCES);
    if fallback.chars().count() > lore.chars().count() {
        fallback
    } else {
        lore
    }
}

fn clean_key(key: &str) -> String {
    text::squash(key).trim_end_matches(':').trim().to_string()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use loreforge_shared::{PageSection, SpecEntry};

    const RULES: &str = r#"
[exclude]
url_patterns = ["/wiki/User:"]

[thresholds]
default = 0.45
categories = { factions = 0.9 }

[canon]
tv = ["television series"]

[[rules]]
name = "weapon_list"
category = "weapons"
keywords = ["list of weapons"]
extractor = "listing"
min_score = 4.0
priority = 20

[[rules]]
name = "weapons"
category = "weapons"
keywords = ["weapon", "pistol", "rifle"]
extractor = "infobox"
min_score = 4.0
priority = 10

[[rules]]
name = "factions"
category = "factions"
keywords = ["faction"]
extractor = "lead_only"
min_score = 2.0
"#;

    fn required() -> Vec<String> {
        ["id", "name", "lore", "specs"].map(String::from).to_vec()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(RuleTable::from_toml_str(RULES).unwrap(), required())
    }

    fn page(page_id: u64, title: &str, lead: &str) -> FetchedPage {
        FetchedPage {
            page_id,
            title: title.into(),
            namespace: 0,
            url: format!("https://fallout.fandom.com/wiki/{}", title.replace(' ', "_")),
            lead_summary: lead.into(),
            full_text: lead.into(),
            sections: Vec::new(),
            categories: Vec::new(),
            links: Vec::new(),
            revision_id: Some(9001),
            revision_timestamp: Some("2024-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()),
            image: None,
            content_hash: String::new(),
            fetched_at: Utc::now(),
            seed: title.into(),
            depth: 0,
        }
    }

    fn laser_pistol() -> FetchedPage {
        let mut p = page(
            7,
            "Laser pistol",
            "The laser pistol is a common energy weapon. It was produced before 2077 by Wattz. It is cheap.",
        );
        p.sections = vec![PageSection {
            heading: String::new(),
            level: 0,
            entries: vec![
                SpecEntry { key: "Damage:".into(), value: "12".into() },
                SpecEntry { key: "Weight".into(), value: "2".into() },
                SpecEntry { key: "Damage".into(), value: "99".into() },
            ],
            ..PageSection::default()
        }];
        p.categories = vec!["Fallout 3 weapons".into()];
        p
    }

    #[test]
    fn infobox_page_yields_one_candidate() {
        let out = normalizer().normalize(&[laser_pistol()]);
        assert_eq!(out.candidates.len(), 1);

        let c = &out.candidates[0];
        assert_eq!(c.candidate_id, "7:0");
        assert_eq!(c.category, "weapons");
        assert_eq!(c.id, "laser_pistol");
        assert_eq!(c.name, "LASER PISTOL");
        assert_eq!(c.lore, "The laser pistol is a common energy weapon. It was produced before 2077 by Wattz.");
        assert_eq!(c.specs.get("Damage").map(String::as_str), Some("12"));
        assert_eq!(c.specs.get("Year").map(String::as_str), Some("2077"));
        assert_eq!(c.specs.get("Revision").map(String::as_str), Some("9001"));
        assert_eq!(c.specs.get("Source").map(String::as_str), Some("Fallout Wiki"));
        assert_eq!(c.canon_tags, vec!["mainline"]);
        assert_eq!(c.sources[0].page_id, 7);
        assert_eq!(c.rule, "weapons");
        assert_eq!(c.source_timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");

        // "weapon": categories 3 + lead 2 + full text 1, "pistol": title 4 + lead 2 + full 1 = 13
        // 0.30 + 0.45 * 13/24 + 0.20 * 1.0 + 0.05
        assert_eq!(c.signals.match_score, 13.0);
        assert!((c.confidence - 0.79375).abs() <= 0.0006, "confidence {}", c.confidence);
    }

    #[test]
    fn page_image_reaches_single_record_candidates_only() {
        let image = "https://static.wikia.nocookie.net/fallout/images/7.png";
        let mut pistol = laser_pistol();
        pistol.image = Some(image.into());
        let out = normalizer().normalize(&[pistol]);
        assert_eq!(out.candidates[0].image.as_deref(), Some(image));

        let mut list = page(20, "List of weapons", "This list of weapons covers every weapon in the Capital Wasteland.");
        list.image = Some(image.into());
        list.sections = vec![PageSection {
            heading: "Energy".into(),
            level: 2,
            tables: vec![SectionTable {
                headers: vec!["Name".into(), "Damage".into()],
                rows: vec![vec!["Laser rifle".into(), "23".into()]],
            }],
            ..PageSection::default()
        }];
        let out = normalizer().normalize(&[list]);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].image, None);
    }

    #[test]
    fn listing_page_yields_row_candidates() {
        let mut p = page(
            20,
            "List of weapons",
            "This list of weapons covers every weapon in the Capital Wasteland.",
        );
        p.sections = vec![PageSection {
            heading: "Energy".into(),
            level: 2,
            tables: vec![SectionTable {
                headers: vec!["Name".into(), "Damage".into(), "Description".into()],
                rows: vec![
                    vec!["Laser rifle".into(), "23".into(), "A long-range energy weapon used by the Brotherhood.".into()],
                    vec!["".into(), "5".into(), "".into()],
                    vec!["Plasma pistol".into(), "25".into(), "".into()],
                ],
            }],
            ..PageSection::default()
        }];

        let out = normalizer().normalize(&[p]);
        assert_eq!(out.stats.pages_normalized, 1);
        let ids: Vec<_> = out.candidates.iter().map(|c| c.candidate_id.as_str()).collect();
        assert_eq!(ids, vec!["20:0", "20:1"]);

        let rifle = &out.candidates[0];
        assert_eq!(rifle.id, "laser_rifle");
        assert_eq!(rifle.specs.get("Damage").map(String::as_str), Some("23"));
        assert!(!rifle.specs.contains_key("Description"));
        assert_eq!(rifle.lore, "A long-range energy weapon used by the Brotherhood.");

        let plasma = &out.candidates[1];
        assert_eq!(plasma.lore, "This list of weapons covers every weapon in the Capital Wasteland.");
        assert_eq!(plasma.rule, "weapon_list");
    }

    #[test]
    fn skips_are_counted_once_per_page() {
        let mut blocked = page(1, "User:Someone", "A weapon collector and faction member.");
        blocked.url = "https://fallout.fandom.com/wiki/User:Someone".into();

        let unmapped = page(2, "Megaton", "A town built around an undetonated atomic bomb.");
        let short = page(3, "Ripper pistol", "A weapon.");
        let faction = page(4, "Enclave", "The Enclave is a faction descended from the pre-War government.");
        let duplicate = laser_pistol();

        let pages = vec![blocked, unmapped, short, faction, laser_pistol(), duplicate];
        let out = normalizer().normalize(&pages);

        let reasons: Vec<_> = out.skips.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                NormalizeSkipReason::UrlBlocked,
                NormalizeSkipReason::Unmapped,
                NormalizeSkipReason::LoreTooShort,
                NormalizeSkipReason::LowConfidence,
                NormalizeSkipReason::DuplicatePage,
            ]
        );
        assert_eq!(out.stats.pages_in, out.stats.pages_normalized + out.stats.pages_skipped);
        assert_eq!(out.stats.pages_normalized, 1);
        assert_eq!(out.stats.skip_reasons.get("low_confidence"), Some(&1));
        assert_eq!(out.stats.rules_matched.get("weapons"), Some(&1));
    }

    #[test]
    fn lore_falls_back_to_full_text() {
        let mut p = page(5, "Gauss rifle", "A rifle.");
        p.full_text = "The Gauss rifle is an electromagnetic weapon. It fires 2mm EC rounds. It is heavy. Extra.".into();
        let out = normalizer().normalize(&[p]);
        assert_eq!(
            out.candidates[0].lore,
            "The Gauss rifle is an electromagnetic weapon. It fires 2mm EC rounds. It is heavy."
        );
    }

    #[test]
    fn canon_tags_include_tv() {
        let p = page(
            6,
            "Lucy's pistol",
            "A 10mm pistol carried by Lucy in the Fallout television series. It is a weapon.",
        );
        let out = normalizer().normalize(&[p]);
        assert_eq!(out.candidates[0].canon_tags, vec!["mainline", "tv"]);
    }
}
