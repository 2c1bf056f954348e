use std::collections::BTreeSet;

use crate::database::{MatchType, PersonalStory};

/// Weight of the directed need/offer component versus pure topical overlap.
const NEED_WEIGHT: f64 = 0.7;
const TOPICAL_WEIGHT: f64 = 0.3;

/// Counterpart `current_focus` counts toward the offer side at half the
/// weight of declared expertise.
const FOCUS_AS_OFFER_WEIGHT: f64 = 0.5;

/// Dominant directed-overlap thresholds for the categorical tag.
const TARGETED_THRESHOLD: f64 = 0.55;
const EXPLORATORY_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredPair {
    pub score: f64,
    pub match_type: MatchType,
}

/// Score two stories for match potential. Pure and deterministic: the same
/// inputs always produce the same output, so re-running pairing for a date
/// is reproducible. Returns None when either story is empty; such users
/// sit out the night and the caller logs the skip.
pub fn score_pair(a: &PersonalStory, b: &PersonalStory) -> Option<ScoredPair> {
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let a_seeking = normalize(&a.seeking_connections);
    let b_seeking = normalize(&b.seeking_connections);
    let a_offering = normalize(&a.offering_expertise);
    let b_offering = normalize(&b.offering_expertise);
    let a_focus = normalize(&a.current_focus);
    let b_focus = normalize(&b.current_focus);

    let a_to_b = directed_overlap(&a_seeking, &b_offering, &b_focus);
    let b_to_a = directed_overlap(&b_seeking, &a_offering, &a_focus);
    let need = (a_to_b + b_to_a) / 2.0;
    let topical = jaccard(&a_focus, &b_focus);

    let score = (NEED_WEIGHT * need + TOPICAL_WEIGHT * topical).clamp(0.0, 1.0);

    let dominant = a_to_b.max(b_to_a);
    let match_type = if dominant >= TARGETED_THRESHOLD {
        MatchType::Targeted
    } else if dominant >= EXPLORATORY_THRESHOLD {
        MatchType::Exploratory
    } else {
        MatchType::Serendipitous
    };

    Some(ScoredPair { score, match_type })
}

/// Fraction of the seeker's needs covered by the provider's expertise,
/// with the provider's current focus counting at reduced weight.
fn directed_overlap(
    seeking: &BTreeSet<String>,
    offering: &BTreeSet<String>,
    focus: &BTreeSet<String>,
) -> f64 {
    if seeking.is_empty() {
        return 0.0;
    }
    let direct = seeking.intersection(offering).count() as f64;
    let via_focus = seeking
        .iter()
        .filter(|term| focus.contains(*term) && !offering.contains(*term))
        .count() as f64;
    ((direct + FOCUS_AS_OFFER_WEIGHT * via_focus) / seeking.len() as f64).clamp(0.0, 1.0)
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

fn normalize(terms: &[String]) -> BTreeSet<String> {
    terms
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
