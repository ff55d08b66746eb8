//! Accept/reject policy over a verification result.

use crate::types::{AttemptOutcome, MatchCandidate};
use serde::Deserialize;

/// Default cosine-distance cutoff.
pub const DEFAULT_THRESHOLD: f32 = 1.0;

/// What to do when the service returned candidates but none carries a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDistancePolicy {
    /// Fail closed.
    #[default]
    Deny,
    /// Grant the first candidate. Accepts a degraded service response as a
    /// match; only for deployments that rely on the service's own filtering.
    Grant,
}

/// Pure threshold policy: no I/O, same input always gives the same outcome.
#[derive(Debug, Clone, Copy)]
pub struct DecisionEngine {
    threshold: f32,
    missing_distance: MissingDistancePolicy,
}

impl DecisionEngine {
    pub fn new(threshold: f32, missing_distance: MissingDistancePolicy) -> Self {
        Self {
            threshold,
            missing_distance,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Decide one attempt.
    ///
    /// The top match is the candidate with the smallest usable distance;
    /// ties go to the earliest candidate. Rows without a finite distance are
    /// skipped unless no row has one, in which case the
    /// [`MissingDistancePolicy`] applies.
    pub fn decide(&self, candidates: &[MatchCandidate]) -> AttemptOutcome {
        let Some(first) = candidates.first() else {
            return AttemptOutcome::Denied;
        };

        let top = candidates
            .iter()
            .filter_map(|c| usable_distance(c).map(|d| (c, d)))
            .fold(None::<(&MatchCandidate, f32)>, |best, (c, d)| match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((c, d)),
            });

        match (top, self.missing_distance) {
            (Some((candidate, distance)), _) if distance <= self.threshold => {
                AttemptOutcome::Granted(candidate.label())
            }
            (Some(_), _) | (None, MissingDistancePolicy::Deny) => AttemptOutcome::Denied,
            (None, MissingDistancePolicy::Grant) => AttemptOutcome::Granted(first.label()),
        }
    }

    /// Smallest usable distance among `candidates`, as `decide` sees it.
    pub fn best_distance(candidates: &[MatchCandidate]) -> Option<f32> {
        candidates.iter().filter_map(usable_distance).reduce(f32::min)
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, MissingDistancePolicy::default())
    }
}

fn usable_distance(candidate: &MatchCandidate) -> Option<f32> {
    candidate.distance.filter(|d| d.is_finite())
}
