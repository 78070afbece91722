//! Rule tables: ordered keyword/section-header mappings from pages to categories.
//!
//! A rule table is a TOML file:
//!
//! ```toml
//! strength_scale = 24.0
//! source_label = "Fallout Wiki"
//!
//! [exclude]
//! url_patterns = ["/wiki/User:"]
//! title_patterns = ["(disambiguation)"]
//! category_patterns = ["Fallout 76 Atomic Shop"]
//!
//! [thresholds]
//! default = 0.45
//! categories = { weapons = 0.55 }
//!
//! [canon]
//! tv = ["television series", "prime video"]
//!
//! [[rules]]
//! name = "weapons"
//! category = "weapons"
//! keywords = ["weapon", "rifle", "pistol"]
//! section_headers = ["Characteristics"]
//! extractor = "infobox"
//! min_score = 4.0
//! priority = 10
//! ```
//!
//! Rules are evaluated by descending `priority` (file order breaks ties) and
//! the first rule whose score reaches its `min_score` wins.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use loreforge_shared::{FetchedPage, LoreforgeError, Result};

use crate::NormalizeSkipReason;

/// Per-field keyword weights.
const TITLE_WEIGHT: f64 = 4.0;
const CATEGORIES_WEIGHT: f64 = 3.0;
const LEAD_WEIGHT: f64 = 2.0;
const SECTIONS_WEIGHT: f64 = 1.2;
const FULL_TEXT_WEIGHT: f64 = 1.0;

/// Score added for each rule section header found among the page headings.
const HEADER_MATCH_WEIGHT: f64 = 2.0;

/// How a matched page is turned into candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extractor {
    /// One record; specs from infobox/table/list entries.
    #[default]
    Infobox,
    /// One record per table row.
    Listing,
    /// One record with only page-level specs.
    LeadOnly,
}

/// One `[[rules]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub section_headers: Vec<String>,
    #[serde(default)]
    pub extractor: Extractor,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default)]
    pub priority: i32,
}

fn default_min_score() -> f64 {
    4.0
}

/// Substring blocklists, matched case-insensitively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Exclusions {
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub title_patterns: Vec<String>,
    #[serde(default)]
    pub category_patterns: Vec<String>,
}

/// Minimum confidence per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    #[serde(default = "default_min_confidence")]
    pub default: f64,
    #[serde(default)]
    pub categories: BTreeMap<String, f64>,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            default: default_min_confidence(),
            categories: BTreeMap::new(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.45
}

/// A loaded, validated rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTable {
    /// Raw score that counts as full match strength.
    #[serde(default = "default_strength_scale")]
    pub strength_scale: f64,
    /// Value of the `Source` spec on every candidate.
    #[serde(default = "default_source_label")]
    pub source_label: String,
    #[serde(default)]
    pub exclude: Exclusions,
    #[serde(default)]
    pub thresholds: ConfidenceThresholds,
    /// Canon tag -> keywords that add it.
    #[serde(default)]
    pub canon: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_strength_scale() -> f64 {
    24.0
}

fn default_source_label() -> String {
    "Fallout Wiki".into()
}

/// The rule that claimed a page and its raw score.
#[derive(Debug, Clone, Copy)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    pub score: f64,
}

impl RuleTable {
    /// Load a rule table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LoreforgeError::io(path, e))?;
        Self::from_toml_str(&content)
            .map_err(|e| LoreforgeError::config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate a rule table.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut table: RuleTable = toml::from_str(content)
            .map_err(|e| LoreforgeError::config(format!("invalid rule table: {e}")))?;
        table.validate()?;
        table.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(LoreforgeError::config("rule table has no [[rules]]"));
        }
        if self.strength_scale <= 0.0 {
            return Err(LoreforgeError::config("strength_scale must be positive"));
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() || rule.category.trim().is_empty() {
                return Err(LoreforgeError::config("every rule needs a name and a category"));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(LoreforgeError::config(format!("duplicate rule name '{}'", rule.name)));
            }
            if rule.keywords.is_empty() && rule.section_headers.is_empty() {
                return Err(LoreforgeError::config(format!(
                    "rule '{}' has neither keywords nor section_headers",
                    rule.name
                )));
            }
            if rule.min_score < 0.0 {
                return Err(LoreforgeError::config(format!(
                    "rule '{}' has a negative min_score",
                    rule.name
                )));
            }
        }

        let thresholds = std::iter::once(&self.thresholds.default)
            .chain(self.thresholds.categories.values());
        for value in thresholds {
            if !(0.0..=1.0).contains(value) {
                return Err(LoreforgeError::config(format!(
                    "confidence threshold {value} is outside 0..=1"
                )));
            }
        }
        Ok(())
    }

    /// First rule (in priority order) that claims the page.
    pub fn match_page(&self, page: &FetchedPage) -> Option<RuleMatch<'_>> {
        self.match_text(&PageText::of(page))
    }

    pub(crate) fn match_text(&self, text: &PageText) -> Option<RuleMatch<'_>> {
        self.rules.iter().find_map(|rule| {
            let score = text.keyword_score(&rule.keywords) + text.header_score(&rule.section_headers);
            (score > 0.0 && score >= rule.min_score).then_some(RuleMatch { rule, score })
        })
    }

    /// Exclusion reason for a page, if any blocklist matches.
    pub fn exclusion(&self, page: &FetchedPage) -> Option<NormalizeSkipReason> {
        let url = page.url.to_lowercase();
        let title = page.title.to_lowercase();
        let categories = page.categories.join(" ").to_lowercase();

        let hit = |patterns: &[String], haystack: &str| {
            patterns
                .iter()
                .map(|p| p.to_lowercase())
                .any(|p| !p.is_empty() && haystack.contains(&p))
        };

        if hit(self.exclude.url_patterns.as_slice(), url.as_str()) {
            Some(NormalizeSkipReason::UrlBlocked)
        } else if hit(self.exclude.title_patterns.as_slice(), title.as_str()) {
            Some(NormalizeSkipReason::TitleBlocked)
        } else if hit(self.exclude.category_patterns.as_slice(), categories.as_str()) {
            Some(NormalizeSkipReason::CategoryBlocked)
        } else {
            None
        }
    }

    /// Minimum confidence for a category.
    pub fn min_confidence(&self, category: &str) -> f64 {
        self.thresholds
            .categories
            .get(category)
            .copied()
            .unwrap_or(self.thresholds.default)
    }

    /// `mainline` plus every canon group with a keyword present in the page.
    pub(crate) fn canon_tags(&self, text: &PageText) -> Vec<String> {
        let all = text.combined();
        let mut tags = vec!["mainline".to_string()];
        for (tag, keywords) in &self.canon {
            let present = keywords
                .iter()
                .map(|k| k.to_lowercase())
                .any(|k| !k.is_empty() && all.contains(&k));
            if present && !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }
}

// ---------------------------------------------------------------------------
// Page text
// ---------------------------------------------------------------------------

/// Lowercased, whitespace-collapsed page fields used for scoring.
#[derive(Debug, Clone)]
pub(crate) struct PageText {
    title: String,
    categories: String,
    lead: String,
    sections: String,
    full_text: String,
    headings: Vec<String>,
}

impl PageText {
    pub(crate) fn of(page: &FetchedPage) -> Self {
        let clean = |s: &str| crate::text::squash(s).to_lowercase();
        let headings: Vec<String> = page
            .sections
            .iter()
            .filter(|s| !s.heading.is_empty())
            .map(|s| clean(&s.heading))
            .collect();

        Self {
            title: clean(&page.title),
            categories: clean(&page.categories.join(" ")),
            lead: clean(&page.lead_summary),
            sections: headings.join(" "),
            full_text: clean(&page.full_text),
            headings,
        }
    }

    fn weighted_fields(&self) -> [(&str, f64); 5] {
        [
            (self.title.as_str(), TITLE_WEIGHT),
            (self.categories.as_str(), CATEGORIES_WEIGHT),
            (self.lead.as_str(), LEAD_WEIGHT),
            (self.sections.as_str(), SECTIONS_WEIGHT),
            (self.full_text.as_str(), FULL_TEXT_WEIGHT),
        ]
    }

    /// Sum of field weights over every (keyword, field) containment.
    pub(crate) fn keyword_score(&self, keywords: &[String]) -> f64 {
        let fields = self.weighted_fields();
        keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| !k.is_empty())
            .map(|k| {
                fields
                    .iter()
                    .filter(|(text, _)| text.contains(&k))
                    .map(|(_, weight)| weight)
                    .sum::<f64>()
            })
            .sum()
    }

    fn header_score(&self, headers: &[String]) -> f64 {
        headers
            .iter()
            .map(|h| h.to_lowercase())
            .filter(|h| !h.is_empty() && self.headings.iter().any(|heading| heading.contains(h)))
            .count() as f64
            * HEADER_MATCH_WEIGHT
    }

    pub(crate) fn combined(&self) -> String {
        [
            self.title.as_str(),
            self.categories.as_str(),
            self.lead.as_str(),
            self.sections.as_str(),
            self.full_text.as_str(),
        ]
        .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loreforge_shared::PageSection;

    const TABLE: &str = r#"
[exclude]
title_patterns = ["(disambiguation)"]
category_patterns = ["Atomic Shop"]

[thresholds]
default = 0.45
categories = { weapons = 0.6 }

[canon]
tv = ["television series"]

[[rules]]
name = "generic_location"
category = "locations"
keywords = ["location", "settlement"]
min_score = 3.0

[[rules]]
name = "weapons"
category = "weapons"
keywords = ["weapon", "pistol"]
section_headers = ["Characteristics"]
priority = 10
"#;

    fn page(title: &str, lead: &str, categories: &[&str]) -> FetchedPage {
        FetchedPage {
            page_id: 1,
            title: title.into(),
            namespace: 0,
            url: format!("https://fallout.fandom.com/wiki/{}", title.replace(' ', "_")),
            lead_summary: lead.into(),
            full_text: lead.into(),
            sections: vec![PageSection {
                heading: "Characteristics".into(),
                level: 2,
                text: "Stats.".into(),
                ..PageSection::default()
            }],
            categories: categories.iter().map(|c| c.to_string()).collect(),
            links: Vec::new(),
            revision_id: None,
            revision_timestamp: None,
            image: None,
            content_hash: String::new(),
            fetched_at: Utc::now(),
            seed: title.into(),
            depth: 0,
        }
    }

    #[test]
    fn priority_orders_rules() {
        let table = RuleTable::from_toml_str(TABLE).unwrap();
        assert_eq!(table.rules[0].name, "weapons");
        assert_eq!(table.rules[1].name, "generic_location");
    }

    #[test]
    fn first_match_wins_with_weighted_score() {
        let table = RuleTable::from_toml_str(TABLE).unwrap();
        let p = page(
            "Laser pistol",
            "The laser pistol is an energy weapon found at every location.",
            &["Fallout 3 weapons"],
        );
        let m = table.match_page(&p).unwrap();
        assert_eq!(m.rule.name, "weapons");
        // "weapon": categories 3 + lead 2 + full text 1; "pistol": title 4 + lead 2 + full text 1;
        // header "Characteristics": 2.
        assert!((m.score - 15.0).abs() < 1e-9, "score {}", m.score);
    }

    #[test]
    fn below_min_score_falls_through() {
        let table = RuleTable::from_toml_str(TABLE).unwrap();
        let mut p = page("Megaton", "A settlement built around a bomb.", &[]);
        p.sections.clear();
        let m = table.match_page(&p).unwrap();
        assert_eq!(m.rule.category, "locations");

        let q = page("Nothing", "Unrelated text.", &[]);
        // Only the header matches (2.0), below the weapons min_score of 4.0.
        assert!(table.match_page(&q).is_none());
    }

    #[test]
    fn exclusions_and_thresholds() {
        let table = RuleTable::from_toml_str(TABLE).unwrap();
        let p = page("Megaton (disambiguation)", "", &[]);
        assert_eq!(table.exclusion(&p), Some(NormalizeSkipReason::TitleBlocked));

        let q = page("Power armor paint", "", &["Fallout 76 Atomic Shop"]);
        assert_eq!(table.exclusion(&q), Some(NormalizeSkipReason::CategoryBlocked));

        assert_eq!(table.min_confidence("weapons"), 0.6);
        assert_eq!(table.min_confidence("locations"), 0.45);
    }

    #[test]
    fn canon_tags_from_keywords() {
        let table = RuleTable::from_toml_str(TABLE).unwrap();
        let p = page("Lucy MacLean", "A character in the Fallout television series.", &[]);
        assert_eq!(table.canon_tags(&PageText::of(&p)), vec!["mainline", "tv"]);
    }

    #[test]
    fn invalid_tables_are_config_errors() {
        assert!(RuleTable::from_toml_str("").is_err());
        let dup = r#"
[[rules]]
name = "a"
category = "x"
keywords = ["k"]
[[rules]]
name = "a"
category = "y"
keywords = ["k"]
"#;
        let err = RuleTable::from_toml_str(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate rule name"));

        let bad_threshold = r#"
[thresholds]
default = 1.5
[[rules]]
name = "a"
category = "x"
keywords = ["k"]
"#;
        assert!(RuleTable::from_toml_str(bad_threshold).is_err());
    }

    #[test]
    fn bundled_rule_tables_load() {
        let table = RuleTable::load(Path::new("../../../config/rules.toml")).unwrap();
        assert_eq!(table.rules.len(), 7);
        assert_eq!(table.rules[0].name, "power_armor");
        assert_eq!(table.rules.last().unwrap().name, "locations");
        assert!(table.canon.contains_key("tv"));

        let minimal = RuleTable::load(Path::new("../../../fixtures/rules/minimal.toml")).unwrap();
        assert_eq!(minimal.rules.len(), 1);
        assert_eq!(minimal.strength_scale, 24.0);
    }
}
