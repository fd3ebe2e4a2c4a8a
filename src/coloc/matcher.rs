//! Pairwise threshold-bounded matching between two detection sets.
//!
//! Candidates are all pairs within the threshold, found through a
//! [`SpatialGrid`]. They are committed greedily, closest first, with ties
//! broken by the first set's id and then the second set's id, so the result
//! depends only on the inputs and never on iteration order.

use std::collections::HashSet;

use log::debug;
use serde::{Deserialize, Serialize};

use super::grid::SpatialGrid;
use crate::data::model::{ChannelPair, ChannelSection, Detection};
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Threshold
// ---------------------------------------------------------------------------

/// A matching radius in pixels: finite and ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Threshold(f64);

impl Threshold {
    pub fn new(pixels: f64) -> Result<Self, ConfigError> {
        if !pixels.is_finite() {
            return Err(ConfigError::Threshold {
                value: pixels,
                reason: "must be a finite number",
            });
        }
        if pixels < 0.0 {
            return Err(ConfigError::Threshold {
                value: pixels,
                reason: "must not be negative",
            });
        }
        Ok(Threshold(pixels))
    }

    pub fn pixels(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Threshold {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Threshold::new(value)
    }
}

impl From<Threshold> for f64 {
    fn from(t: Threshold) -> f64 {
        t.0
    }
}

// ---------------------------------------------------------------------------
// Match / PairwiseResult
// ---------------------------------------------------------------------------

/// One committed correspondence. `distance <= threshold` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id_a: usize,
    pub id_b: usize,
    pub distance: f64,
}

/// Outcome of matching set A against set B.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PairwiseResult {
    /// In commit order: ascending distance, then id A, then id B.
    pub matches: Vec<Match>,
    /// Ascending ids of A without a partner.
    pub unmatched_a: Vec<usize>,
    /// Ascending ids of B without a partner.
    pub unmatched_b: Vec<usize>,
}

impl PairwiseResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Lookup of the match that connects `id_a` to `id_b`, if any.
    pub fn find(&self, id_a: usize, id_b: usize) -> Option<&Match> {
        self.matches
            .iter()
            .find(|m| m.id_a == id_a && m.id_b == id_b)
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Match two point sets under `threshold`.
///
/// Ids must be unique within each set. An empty set yields zero matches and
/// leaves the whole other set unmatched; a zero threshold only pairs exactly
/// coincident points.
pub fn match_detections(a: &[Detection], b: &[Detection], threshold: Threshold) -> PairwiseResult {
    let radius = threshold.pixels();

    let mut candidates: Vec<Match> = Vec::new();
    if !a.is_empty() && !b.is_empty() {
        let grid = SpatialGrid::new(b, radius);
        for pa in a {
            for pb in grid.neighbours(pa.x, pa.y) {
                let distance = pa.distance_to(pb);
                if distance <= radius {
                    candidates.push(Match {
                        id_a: pa.id,
                        id_b: pb.id,
                        distance,
                    });
                }
            }
        }
    }
    debug!(
        "{} candidate pairs for {}×{} points at {radius} px",
        candidates.len(),
        a.len(),
        b.len()
    );

    candidates.sort_by(|x, y| {
        x.distance
            .total_cmp(&y.distance)
            .then(x.id_a.cmp(&y.id_a))
            .then(x.id_b.cmp(&y.id_b))
    });

    let mut claimed_a: HashSet<usize> = HashSet::new();
    let mut claimed_b: HashSet<usize> = HashSet::new();
    let mut matches = Vec::new();
    for c in candidates {
        if claimed_a.contains(&c.id_a) || claimed_b.contains(&c.id_b) {
            continue;
        }
        claimed_a.insert(c.id_a);
        claimed_b.insert(c.id_b);
        matches.push(c);
    }

    let unclaimed = |set: &[Detection], claimed: &HashSet<usize>| {
        let mut ids: Vec<usize> = set
            .iter()
            .map(|d| d.id)
            .filter(|id| !claimed.contains(id))
            .collect();
        ids.sort_unstable();
        ids
    };

    PairwiseResult {
        unmatched_a: unclaimed(a, &claimed_a),
        unmatched_b: unclaimed(b, &claimed_b),
        matches,
    }
}

/// Match two channel collections, orienting the result so that side A is
/// the pair's canonical first channel. `None` when both collections are the
/// same channel.
pub fn match_channels(
    x: &ChannelSection,
    y: &ChannelSection,
    threshold: Threshold,
) -> Option<(ChannelPair, PairwiseResult)> {
    let pair = ChannelPair::new(x.channel, y.channel)?;
    let (a, b) = if x.channel == pair.first() { (x, y) } else { (y, x) };
    Some((pair, match_detections(a.detections(), b.detections(), threshold)))
}
