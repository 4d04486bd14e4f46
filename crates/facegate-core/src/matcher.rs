//! Gallery matching: score a probe against every enrolled record and pick
//! the best identity.
//!
//! Scoring fans out across a rayon pool when one is attached; results are
//! collected back in gallery order before aggregation, so the outcome never
//! depends on which worker finishes first.

use crate::similarity::{normalize, DimensionMismatch, Scorer};
use crate::types::{Embedding, GalleryRecord, IdentityScore, MatchResult};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("unknown aggregation policy: {0} (expected single-best or grouped-average)")]
    UnknownAggregation(String),
}

/// How per-record scores become one score per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    /// Every record competes on its own score.
    SingleBest,
    /// Records sharing a name are averaged; identities compete on their means.
    #[default]
    GroupedAverage,
}

impl FromStr for Aggregation {
    type Err = MatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "single-best" | "single" => Ok(Self::SingleBest),
            "grouped-average" | "grouped" | "average" => Ok(Self::GroupedAverage),
            _ => Err(MatcherError::UnknownAggregation(s.to_string())),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleBest => "single-best",
            Self::GroupedAverage => "grouped-average",
        })
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Best-scoring identity regardless of any threshold, or `None` when
    /// nothing in the gallery could be scored.
    fn best_match(&self, probe: &Embedding, gallery: &[GalleryRecord]) -> Option<MatchResult>;

    /// Best match only if its score is strictly above `threshold`.
    fn verify(
        &self,
        probe: &Embedding,
        gallery: &[GalleryRecord],
        threshold: f32,
    ) -> Option<MatchResult> {
        self.best_match(probe, gallery)
            .filter(|m| m.passes(threshold))
    }
}

/// One aggregated contender, anchored at its first record in gallery order.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    first: usize,
    score: f32,
    samples: usize,
}

/// Combined-similarity matcher with selectable aggregation.
///
/// Always scores every gallery entry; there is no early exit on a strong
/// match.
#[derive(Clone, Default)]
pub struct GalleryMatcher {
    scorer: Scorer,
    aggregation: Aggregation,
    pool: Option<Arc<ThreadPool>>,
}

impl GalleryMatcher {
    /// Sequential matcher. Attach workers with [`with_workers`](Self::with_workers).
    pub fn new(scorer: Scorer, aggregation: Aggregation) -> Self {
        Self {
            scorer,
            aggregation,
            pool: None,
        }
    }

    /// Score records on a dedicated pool of `workers` threads.
    ///
    /// One worker keeps scoring on the calling thread.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, MatcherError> {
        if workers <= 1 {
            self.pool = None;
            return Ok(self);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("facegate-match-{i}"))
            .build()?;
        self.pool = Some(Arc::new(pool));
        Ok(self)
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// Per-record scores in gallery order. `None` marks a skipped record.
    pub fn score_all(&self, probe: &Embedding, gallery: &[GalleryRecord]) -> Vec<Option<f32>> {
        let probe_unit = normalize(probe.as_slice());
        let score = |record: &GalleryRecord| self.score_record(&probe_unit, record);

        match &self.pool {
            Some(pool) if gallery.len() > 1 => {
                pool.install(|| gallery.par_iter().map(score).collect())
            }
            _ => gallery.iter().map(score).collect(),
        }
    }

    fn score_record(&self, probe_unit: &[f32], record: &GalleryRecord) -> Option<f32> {
        let stored = normalize(record.embedding.as_slice());
        match self.scorer.combined_unit(probe_unit, &stored) {
            Ok(score) if score.is_finite() => Some(score),
            Ok(score) => {
                tracing::warn!(
                    id = record.id,
                    name = %record.name,
                    score,
                    "gallery record produced a non-finite score; skipping"
                );
                None
            }
            Err(DimensionMismatch { expected, actual }) => {
                tracing::warn!(
                    id = record.id,
                    name = %record.name,
                    expected,
                    actual,
                    "gallery record embedding has mismatched length; skipping"
                );
                None
            }
        }
    }

    /// Every identity's aggregated score, highest first. Equal scores keep
    /// gallery order.
    pub fn rank(&self, probe: &Embedding, gallery: &[GalleryRecord]) -> Vec<IdentityScore> {
        let scores = self.score_all(probe, gallery);
        let mut ranked: Vec<IdentityScore> = aggregate(self.aggregation, gallery, &scores)
            .into_iter()
            .map(|c| {
                let record = &gallery[c.first];
                IdentityScore {
                    id: record.id,
                    name: record.name.clone(),
                    score: c.score,
                    samples: c.samples,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }
}

impl Matcher for GalleryMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[GalleryRecord]) -> Option<MatchResult> {
        if gallery.is_empty() {
            return None;
        }

        let scores = self.score_all(probe, gallery);
        let candidates = aggregate(self.aggregation, gallery, &scores);
        let best = pick_best(&candidates)?;
        let record = &gallery[best.first];

        tracing::debug!(
            id = record.id,
            name = %record.name,
            similarity = best.score,
            samples = best.samples,
            aggregation = %self.aggregation,
            "best gallery match"
        );

        Some(MatchResult {
            id: record.id,
            name: record.name.clone(),
            path: record.path.clone(),
            similarity: best.score,
        })
    }
}

/// Collapse per-record scores into candidates, in gallery order.
fn aggregate(
    aggregation: Aggregation,
    gallery: &[GalleryRecord],
    scores: &[Option<f32>],
) -> Vec<Candidate> {
    match aggregation {
        Aggregation::SingleBest => scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.map(|score| Candidate {
                    first: i,
                    score,
                    samples: 1,
                })
            })
            .collect(),
        Aggregation::GroupedAverage => {
            // (first index, running sum, count), in first-seen order
            let mut groups: Vec<(usize, f64, usize)> = Vec::new();
            let mut by_name: HashMap<&str, usize> = HashMap::new();

            for (i, score) in scores.iter().enumerate() {
                let Some(score) = score else {
                    continue;
                };
                let slot = *by_name.entry(gallery[i].name.as_str()).or_insert_with(|| {
                    groups.push((i, 0.0, 0));
                    groups.len() - 1
                });
                let group = &mut groups[slot];
                group.1 += f64::from(*score);
                group.2 += 1;
            }

            groups
                .into_iter()
                .map(|(first, sum, count)| Candidate {
                    first,
                    score: (sum / count as f64) as f32,
                    samples: count,
                })
                .collect()
        }
    }
}

/// Highest score wins; on a tie the earlier candidate is kept.
fn pick_best(candidates: &[Candidate]) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for c in candidates {
        match best {
            Some(b) if c.score > b.score => best = Some(*c),
            None => best = Some(*c),
            _ => {}
        }
    }
    best
}
