use std::cmp::Ordering;
use std::collections::HashSet;

use crate::database::{normalize_pair, MatchType, PersonalStory};
use crate::scoring::score_pair;

/// Ephemeral pairing decision for one run date. Consumed by the
/// orchestrator; only promoted to a durable match once a dialogue runs.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub user_a: String,
    pub user_b: String,
    pub match_type: MatchType,
    pub compatibility: f64,
}

impl MatchCandidate {
    pub fn pair_key(&self) -> String {
        let (a, b) = normalize_pair(&self.user_a, &self.user_b);
        format!("{}|{}", a, b)
    }
}

#[derive(Debug, Default)]
pub struct PairingPlan {
    pub pairs: Vec<MatchCandidate>,
    /// Users excluded because their story has no structured fields.
    pub skipped_empty: Vec<String>,
    /// Candidate pairs dropped by the cool-down rule.
    pub cooldown_excluded: usize,
}

/// Select tonight's pairs: greedy maximum-weight matching over all scored
/// candidate pairs, one conversation per user per night, pairs inside the
/// cool-down window excluded. Greedy is not optimal, but its output is
/// exactly predictable for a fixed input set, which is what the nightly
/// report pipeline needs to stay explainable.
pub fn plan_pairs(stories: &[PersonalStory], recent_pairs: &HashSet<(String, String)>) -> PairingPlan {
    let mut plan = PairingPlan::default();

    let mut eligible: Vec<&PersonalStory> = Vec::new();
    for story in stories {
        if story.is_empty() {
            plan.skipped_empty.push(story.user_id.clone());
        } else {
            eligible.push(story);
        }
    }

    if eligible.len() < 2 {
        return plan;
    }

    let mut candidates: Vec<MatchCandidate> = Vec::new();
    for (i, a) in eligible.iter().enumerate() {
        for b in eligible.iter().skip(i + 1) {
            if recent_pairs.contains(&normalize_pair(&a.user_id, &b.user_id)) {
                plan.cooldown_excluded += 1;
                continue;
            }
            if let Some(scored) = score_pair(a, b) {
                if scored.score > 0.0 {
                    // Stored in normalized order so the per-date unique
                    // index holds no matter how the inputs were iterated.
                    let (user_a, user_b) = normalize_pair(&a.user_id, &b.user_id);
                    candidates.push(MatchCandidate {
                        user_a,
                        user_b,
                        match_type: scored.match_type,
                        compatibility: scored.score,
                    });
                }
            }
        }
    }

    // Highest score first; ties broken by user ids so the plan is
    // deterministic for a fixed input set.
    candidates.sort_by(|x, y| {
        y.compatibility
            .partial_cmp(&x.compatibility)
            .unwrap_or(Ordering::Equal)
            .then_with(|| x.user_a.cmp(&y.user_a))
            .then_with(|| x.user_b.cmp(&y.user_b))
    });

    let mut assigned: HashSet<String> = HashSet::new();
    for candidate in candidates {
        if assigned.contains(&candidate.user_a) || assigned.contains(&candidate.user_b) {
            continue;
        }
        assigned.insert(candidate.user_a.clone());
        assigned.insert(candidate.user_b.clone());
        plan.pairs.push(candidate);
    }

    plan
}
