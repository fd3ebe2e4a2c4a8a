//! Nearest-neighbour distance histograms, used to pick a sensible threshold.

use serde::{Deserialize, Serialize};

use super::grid::SpatialGrid;
use crate::data::model::{ChannelPair, Detection};

/// Per-bin increase (percent of the reference channel) below which a bin
/// counts as flat.
const PLATEAU_INCREASE_PCT: f64 = 0.5;
/// Consecutive flat bins that make a plateau.
const PLATEAU_RUN: usize = 3;
/// Largest histogram a report may ask for, in 1-unit bins.
pub const MAX_DISTANCE_BINS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceReportConfig {
    /// Upper end of the histogram, in report units (µm when the section has
    /// a pixel size and the run is in micron mode, pixels otherwise).
    pub max_distance: f64,
    #[serde(default)]
    pub stop_at_plateau: bool,
}

impl DistanceReportConfig {
    /// Whether `max_distance` gives a usable histogram of at most
    /// [`MAX_DISTANCE_BINS`] bins.
    pub fn is_valid(&self) -> bool {
        self.max_distance.is_finite()
            && self.max_distance > 0.0
            && self.max_distance.ceil() <= MAX_DISTANCE_BINS as f64
    }

    fn bins(&self) -> usize {
        (self.max_distance.max(0.0).ceil() as usize).min(MAX_DISTANCE_BINS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceBin {
    pub start: f64,
    pub end: f64,
    pub count: usize,
    pub cumulative: usize,
    /// Percent of the reference channel's detections.
    pub percent: f64,
    pub cumulative_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceDistribution {
    pub pair: ChannelPair,
    pub unit: String,
    /// Number of detections of the pair's first channel.
    pub reference_total: usize,
    pub bins: Vec<DistanceBin>,
    /// Start of the bin where the table was cut off, when a plateau was hit.
    pub plateau_at: Option<f64>,
}

/// Distance from each point of `a` to its nearest point of `b`, for the
/// points that have a neighbour within `max_px`.
pub fn nearest_distances(a: &[Detection], b: &[Detection], max_px: f64) -> Vec<f64> {
    if a.is_empty() || b.is_empty() || !(max_px >= 0.0) {
        return Vec::new();
    }
    let grid = SpatialGrid::new(b, max_px);
    a.iter()
        .filter_map(|pa| {
            grid.neighbours(pa.x, pa.y)
                .map(|pb| pa.distance_to(pb))
                .filter(|&d| d <= max_px)
                .min_by(f64::total_cmp)
        })
        .collect()
}

/// Histogram of nearest-neighbour distances from the pair's first channel
/// (`a`) to its second (`b`), in 1-unit bins from 0 to
/// `config.max_distance`.
///
/// `units_per_px` converts pixel distances into report units (the pixel
/// size in µm, or 1.0 for pixel reports).
pub fn distance_distribution(
    pair: ChannelPair,
    a: &[Detection],
    b: &[Detection],
    units_per_px: f64,
    unit: &str,
    config: &DistanceReportConfig,
) -> DistanceDistribution {
    let n_bins = config.bins();
    let max_px = if units_per_px > 0.0 {
        n_bins as f64 / units_per_px
    } else {
        0.0
    };

    let mut counts = vec![0usize; n_bins];
    for d in nearest_distances(a, b, max_px) {
        let scaled = d * units_per_px;
        // The last bin is closed on the right.
        let idx = (scaled.floor() as usize).min(n_bins.saturating_sub(1));
        if n_bins > 0 && scaled <= n_bins as f64 {
            counts[idx] += 1;
        }
    }

    let reference_total = a.len();
    let pct = |n: usize| {
        if reference_total == 0 {
            0.0
        } else {
            n as f64 / reference_total as f64 * 100.0
        }
    };

    let plateau = if config.stop_at_plateau {
        find_plateau(&counts, reference_total)
    } else {
        None
    };
    let kept = plateau.unwrap_or(n_bins);

    let mut cumulative = 0usize;
    let bins = counts
        .iter()
        .take(kept)
        .enumerate()
        .map(|(i, &count)| {
            cumulative += count;
            DistanceBin {
                start: i as f64,
                end: (i + 1) as f64,
                count,
                cumulative,
                percent: pct(count),
                cumulative_percent: pct(cumulative),
            }
        })
        .collect();

    DistanceDistribution {
        pair,
        unit: unit.to_string(),
        reference_total,
        bins,
        plateau_at: plateau.map(|i| i as f64),
    }
}

/// Index of the first bin that ends a run of [`PLATEAU_RUN`] flat bins,
/// once at least one neighbour has been counted.
fn find_plateau(counts: &[usize], reference_total: usize) -> Option<usize> {
    if reference_total == 0 {
        return None;
    }
    let increase = |n: usize| n as f64 / reference_total as f64 * 100.0;
    (PLATEAU_RUN..counts.len()).find(|&i| {
        let seen: usize = counts[..=i - PLATEAU_RUN].iter().sum();
        seen > 0
            && (0..PLATEAU_RUN).all(|j| increase(counts[i - j]) < PLATEAU_INCREASE_PCT)
    })
}
