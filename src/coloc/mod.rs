/// Colocalization core: pairwise matching and group construction.
///
/// ```text
///   ChannelSection A ─┐
///                     ├─ matcher ─▶ PairwiseResult ─┐
///   ChannelSection B ─┘                             ├─ combiner ─▶ Colocalization
///                          (up to three pairs) ─────┘
/// ```
///
/// `grid` provides the spatial binning both the matcher and the distance
/// histograms use.

pub mod combiner;
pub mod distribution;
pub mod grid;
pub mod matcher;

pub use combiner::{combine, unmatched, CombinationRequest, Colocalization, ColocalizationGroup, UnmatchedDetection};
pub use matcher::{match_channels, match_detections, Match, PairwiseResult, Threshold};
