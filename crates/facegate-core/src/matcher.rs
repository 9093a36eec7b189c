//! Two-threshold identity matching with an ambiguity dead zone.

use crate::gallery::{GallerySnapshot, IdentityId};
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.45;
pub const DEFAULT_REJECT_THRESHOLD: f32 = 0.30;
pub const DEFAULT_AMBIGUITY_EPSILON: f32 = 0.03;

#[derive(Error, Debug, PartialEq)]
pub enum MatcherError {
    #[error("reject threshold {reject} is above accept threshold {accept}")]
    InvertedThresholds { accept: f32, reject: f32 },
    #[error("ambiguity epsilon must be non-negative, got {0}")]
    NegativeEpsilon(f32),
    #[error("thresholds must be finite")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
    Ambiguous,
}

/// One gallery identity and its best similarity to the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub identity_id: IdentityId,
    pub name: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub decision: Decision,
    /// Set only when the decision is `Accept`.
    pub identity: Option<Candidate>,
    /// Highest-scoring identity, whatever the decision.
    pub best: Option<Candidate>,
    /// Top score, 0.0 for an empty gallery.
    pub score: f32,
    pub runner_up_score: Option<f32>,
}

impl MatchResult {
    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }

    fn reject(best: Option<Candidate>, runner_up_score: Option<f32>) -> Self {
        Self {
            decision: Decision::Reject,
            identity: None,
            score: best.as_ref().map_or(0.0, |c| c.score),
            best,
            runner_up_score,
        }
    }
}

pub trait Matcher: Send + Sync {
    fn decide(&self, probe: &Embedding, gallery: &GallerySnapshot) -> MatchResult;
}

/// Cosine-similarity matcher over a linear scan of the gallery.
///
/// Every reference embedding is compared, so cost grows with gallery size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineMatcher {
    accept_threshold: f32,
    reject_threshold: f32,
    ambiguity_epsilon: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            reject_threshold: DEFAULT_REJECT_THRESHOLD,
            ambiguity_epsilon: DEFAULT_AMBIGUITY_EPSILON,
        }
    }
}

impl CosineMatcher {
    pub fn new(accept_threshold: f32, reject_threshold: f32, ambiguity_epsilon: f32) -> Result<Self, MatcherError> {
        if !(accept_threshold.is_finite() && reject_threshold.is_finite() && ambiguity_epsilon.is_finite()) {
            return Err(MatcherError::NonFinite);
        }
        if reject_threshold > accept_threshold {
            return Err(MatcherError::InvertedThresholds {
                accept: accept_threshold,
                reject: reject_threshold,
            });
        }
        if ambiguity_epsilon < 0.0 {
            return Err(MatcherError::NegativeEpsilon(ambiguity_epsilon));
        }
        Ok(Self { accept_threshold, reject_threshold, ambiguity_epsilon })
    }

    pub fn accept_threshold(&self) -> f32 {
        self.accept_threshold
    }

    pub fn reject_threshold(&self) -> f32 {
        self.reject_threshold
    }

    pub fn ambiguity_epsilon(&self) -> f32 {
        self.ambiguity_epsilon
    }

    /// Identities ranked by their best score, highest first. Equal scores are
    /// ordered by identity id so the ranking does not depend on gallery order.
    pub fn rank(&self, probe: &Embedding, gallery: &GallerySnapshot) -> Vec<Candidate> {
        let mut best: BTreeMap<&IdentityId, f32> = BTreeMap::new();
        let mut skipped = 0usize;

        for (id, reference) in gallery.iter() {
            let reference = reference.embedding();
            if reference.dimension() != probe.dimension() {
                skipped += 1;
                continue;
            }
            let score = probe.similarity(reference);
            best.entry(id)
                .and_modify(|s| *s = s.max(score))
                .or_insert(score);
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                probe_dim = probe.dimension(),
                "reference embeddings with a different dimension were ignored"
            );
        }

        let mut ranked: Vec<Candidate> = best
            .into_iter()
            .map(|(id, score)| Candidate {
                identity_id: id.clone(),
                name: gallery.get(id).map(|i| i.name().to_string()).unwrap_or_default(),
                score,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        ranked
    }
}

impl Matcher for CosineMatcher {
    fn decide(&self, probe: &Embedding, gallery: &GallerySnapshot) -> MatchResult {
        let mut ranked = self.rank(probe, gallery).into_iter();
        let best = ranked.next();
        let runner_up_score = ranked.next().map(|c| c.score);

        let Some(top) = best.as_ref().map(|c| c.score) else {
            return MatchResult::reject(None, None);
        };
        if top < self.reject_threshold {
            return MatchResult::reject(best, runner_up_score);
        }

        let tied = runner_up_score.is_some_and(|second| top - second <= self.ambiguity_epsilon);
        let decision = if tied {
            Decision::Ambiguous
        } else if top >= self.accept_threshold {
            Decision::Accept
        } else {
            Decision::Ambiguous
        };

        MatchResult {
            decision,
            identity: if decision == Decision::Accept { best.clone() } else { None },
            best,
            score: top,
            runner_up_score,
        }
    }
}
