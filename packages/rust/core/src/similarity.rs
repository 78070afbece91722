//! Candidate-to-record similarity.
//!
//! The merge engine and the evaluator only see the [`SimilarityScorer`]
//! trait, so the measure can be swapped without touching either. Any
//! `Fn(&CandidateRecord, &CanonicalRecord) -> f64` is a scorer too.

use loreforge_shared::{CandidateRecord, CanonicalRecord, NearestMatch};

/// Similarity in `0.0..=1.0` between a candidate and an existing record.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, candidate: &CandidateRecord, record: &CanonicalRecord) -> f64;
}

impl<F> SimilarityScorer for F
where
    F: Fn(&CandidateRecord, &CanonicalRecord) -> f64 + Send + Sync,
{
    fn score(&self, candidate: &CandidateRecord, record: &CanonicalRecord) -> f64 {
        self(candidate, record)
    }
}

/// Default scorer: normalized Levenshtein over identifier and name,
/// weighted equally.
#[derive(Debug, Clone, Copy)]
pub struct LevenshteinScorer {
    pub id_weight: f64,
    pub name_weight: f64,
}

impl Default for LevenshteinScorer {
    fn default() -> Self {
        Self {
            id_weight: 0.5,
            name_weight: 0.5,
        }
    }
}

impl SimilarityScorer for LevenshteinScorer {
    fn score(&self, candidate: &CandidateRecord, record: &CanonicalRecord) -> f64 {
        let total = self.id_weight + self.name_weight;
        if total <= 0.0 {
            return 0.0;
        }
        let id = text_similarity(&candidate.id, &record.id);
        let name = text_similarity(&candidate.name, &record.name);
        ((self.id_weight * id + self.name_weight * name) / total).clamp(0.0, 1.0)
    }
}

/// Lowercase, `_`/punctuation to spaces, whitespace collapsed.
pub fn normalize_text(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity of two strings after [`normalize_text`].
pub fn text_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_text(a), &normalize_text(b))
}

/// Highest-scoring record, or `None` when `records` is empty.
///
/// Ties keep the earliest record in store order.
pub fn nearest<'a>(
    scorer: &dyn SimilarityScorer,
    candidate: &CandidateRecord,
    records: &'a [CanonicalRecord],
) -> Option<(&'a CanonicalRecord, f64)> {
    let mut best: Option<(&CanonicalRecord, f64)> = None;
    for record in records {
        let score = scorer.score(candidate, record);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((record, score)),
        }
    }
    best
}

/// [`nearest`] as a serializable [`NearestMatch`].
pub fn nearest_match(
    scorer: &dyn SimilarityScorer,
    candidate: &CandidateRecord,
    records: &[CanonicalRecord],
) -> Option<NearestMatch> {
    nearest(scorer, candidate, records).map(|(record, similarity)| NearestMatch {
        record_id: record.id.clone(),
        similarity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{candidate, canonical};

    #[test]
    fn normalizes_before_comparing() {
        assert_eq!(normalize_text("  T-45_Power   ARMOR "), "t 45 power armor");
        assert_eq!(text_similarity("laser_pistol", "Laser Pistol"), 1.0);
        assert_eq!(text_similarity("", ""), 1.0);
        assert!(text_similarity("laser pistol", "plasma rifle") < 0.5);
    }

    #[test]
    fn levenshtein_scorer_weights_id_and_name() {
        let scorer = LevenshteinScorer::default();
        let c = candidate("c:0", "weapons", "laser_pistol", "LASER PISTOL");
        assert_eq!(scorer.score(&c, &canonical("laser_pistol", "LASER PISTOL")), 1.0);

        let partial = scorer.score(&c, &canonical("laser_pistol", "WATTZ 1000"));
        assert!(partial > 0.5 && partial < 1.0, "score {partial}");
    }

    #[test]
    fn nearest_prefers_first_on_ties() {
        let records = vec![canonical("a", "A"), canonical("b", "B"), canonical("c", "C")];
        let c = candidate("c:0", "weapons", "x", "X");
        let fixed = |_: &CandidateRecord, r: &CanonicalRecord| if r.id == "a" { 0.2 } else { 0.7 };

        let (record, score) = nearest(&fixed, &c, &records).unwrap();
        assert_eq!(record.id, "b");
        assert_eq!(score, 0.7);
        assert!(nearest(&fixed, &c, &[]).is_none());

        let m = nearest_match(&fixed, &c, &records).unwrap();
        assert_eq!(m.record_id, "b");
    }
}
