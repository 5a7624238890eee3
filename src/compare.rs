//! Per-frame pose scoring.
//!
//! A frame where either pose is missing produces the "no-data" result: score
//! 0, nothing flagged, and [`ComparisonResult::detected`] set to false.
//! Averages built with [`ScoreSummary`] leave such frames out instead of
//! counting them as fully wrong.

use crate::{config::ComparatorConfig, pose::KeypointSet};
use bitvec::vec::BitVec;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    score: f32,
    wrong: BitVec,
    detected: bool,
}

impl ComparisonResult {
    pub fn no_data() -> Self {
        Self {
            score: 0.0,
            wrong: BitVec::new(),
            detected: false,
        }
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    /// Whether both poses were present and actually compared.
    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn is_wrong(&self, index: usize) -> bool {
        self.wrong.get(index).map_or(false, |bit| *bit)
    }

    pub fn wrong_count(&self) -> usize {
        self.wrong.count_ones()
    }

    /// Flagged indices in ascending order.
    pub fn wrong_keypoints(&self) -> Vec<usize> {
        self.wrong.iter_ones().collect()
    }
}

/// Compare two poses point by point.
///
/// Index `i` is wrong when the Euclidean distance between the two points
/// exceeds `threshold`. Missing poses, or poses of different lengths, give
/// [`ComparisonResult::no_data`].
pub fn compare(
    a: Option<&KeypointSet>,
    b: Option<&KeypointSet>,
    threshold: f32,
) -> ComparisonResult {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) if a.len() == b.len() && !a.is_empty() => (a, b),
        _ => return ComparisonResult::no_data(),
    };

    let mut wrong = BitVec::repeat(false, a.len());
    for (i, (p, q)) in a.iter().zip(b.iter()).enumerate() {
        if p.distance(q) > threshold {
            wrong.set(i, true);
        }
    }

    let total = a.len();
    let correct = total - wrong.count_ones();
    ComparisonResult {
        score: correct as f32 / total as f32,
        wrong,
        detected: true,
    }
}

/// [`compare`] bound to a validated configuration.
#[derive(Debug, Clone)]
pub struct Comparator {
    config: ComparatorConfig,
}

impl Comparator {
    pub fn new(config: ComparatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComparatorConfig {
        &self.config
    }

    /// Poses whose length differs from the configured keypoint count are
    /// treated as missing.
    pub fn compare(
        &self,
        user: Option<&KeypointSet>,
        reference: Option<&KeypointSet>,
    ) -> ComparisonResult {
        let expected = self.config.keypoint_count;
        let fits = |set: &&KeypointSet| set.len() == expected;
        compare(
            user.filter(fits),
            reference.filter(fits),
            self.config.threshold,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreSummary {
    /// Mean over compared frames only, 0 when none were compared.
    pub mean_score: f32,
    pub compared_frames: usize,
    pub no_data_frames: usize,
}

impl ScoreSummary {
    pub fn add(&mut self, result: &ComparisonResult) {
        if result.detected() {
            self.compared_frames += 1;
            self.mean_score += (result.score() - self.mean_score) / self.compared_frames as f32;
        } else {
            self.no_data_frames += 1;
        }
    }
}

impl<'a> FromIterator<&'a ComparisonResult> for ScoreSummary {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = &'a ComparisonResult>,
    {
        let mut summary = Self::default();
        for result in iter {
            summary.add(result);
        }
        summary
    }
}
