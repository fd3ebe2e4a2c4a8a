//! Per-section tallies and their mouse- and run-level aggregates.
//!
//! Aggregates only ever sum raw counts. Percentages and mean distances are
//! recomputed from the sums on demand, never averaged across sections.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ResolvedThreshold;
use crate::data::model::{Channel, CombinationKind, SectionKey};
use crate::error::Issue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Loaded,
    /// No localization source for the section.
    Missing,
    /// A source exists but could not be read.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelTally {
    pub status: ChannelStatus,
    pub detections: usize,
    /// Rows dropped as malformed.
    pub dropped: usize,
}

impl ChannelTally {
    pub fn loaded(detections: usize, dropped: usize) -> Self {
        ChannelTally {
            status: ChannelStatus::Loaded,
            detections,
            dropped,
        }
    }

    pub fn unavailable(status: ChannelStatus) -> Self {
        ChannelTally {
            status,
            detections: 0,
            dropped: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.status == ChannelStatus::Loaded
    }
}

// ---------------------------------------------------------------------------
// CombinationTally
// ---------------------------------------------------------------------------

/// Raw counts for one combination kind, summable across sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombinationTally {
    /// Sections in which the combination could be evaluated.
    pub evaluated: usize,
    /// Detections per participating channel, over evaluated sections only.
    pub channel_totals: BTreeMap<Channel, usize>,
    /// Groups of this kind.
    pub groups: usize,
    /// Pairwise matches before 3-way absorption. Equal to `groups` for the
    /// triple.
    pub pairwise_matches: usize,
    /// Sum of group distances in pixels.
    pub distance_sum_px: f64,
    /// Sum of group distances in µm, over groups whose section had a pixel
    /// size.
    pub distance_sum_um: f64,
    pub groups_with_um: usize,
}

impl CombinationTally {
    /// Tally for a combination evaluated in one section.
    pub fn evaluated(channel_totals: BTreeMap<Channel, usize>) -> Self {
        CombinationTally {
            evaluated: 1,
            channel_totals,
            ..Default::default()
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated > 0
    }

    /// Total of the rarer participating channel.
    pub fn reference_total(&self) -> Option<usize> {
        self.channel_totals.values().copied().min()
    }

    /// Groups as a percentage of the rarer channel's detections. `None`
    /// when the combination was never evaluated; `0.0` when the rarer
    /// channel had no detections.
    pub fn percentage(&self) -> Option<f64> {
        if !self.is_evaluated() {
            return None;
        }
        match self.reference_total() {
            Some(total) if total > 0 => Some(self.groups as f64 / total as f64 * 100.0),
            _ => Some(0.0),
        }
    }

    pub fn mean_distance_px(&self) -> Option<f64> {
        (self.groups > 0).then(|| self.distance_sum_px / self.groups as f64)
    }

    pub fn mean_distance_um(&self) -> Option<f64> {
        (self.groups_with_um > 0).then(|| self.distance_sum_um / self.groups_with_um as f64)
    }

    pub fn absorb(&mut self, other: &CombinationTally) {
        if !other.is_evaluated() {
            return;
        }
        self.evaluated += other.evaluated;
        for (&channel, &n) in &other.channel_totals {
            *self.channel_totals.entry(channel).or_default() += n;
        }
        self.groups += other.groups;
        self.pairwise_matches += other.pairwise_matches;
        self.distance_sum_px += other.distance_sum_px;
        self.distance_sum_um += other.distance_sum_um;
        self.groups_with_um += other.groups_with_um;
    }
}

// ---------------------------------------------------------------------------
// SectionSummary / AggregateSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionSummary {
    pub key: SectionKey,
    /// `None` when the section was skipped for lack of a threshold.
    pub threshold: Option<ResolvedThreshold>,
    pub channels: BTreeMap<Channel, ChannelTally>,
    /// One entry per requested kind, evaluated or not.
    pub combinations: BTreeMap<CombinationKind, CombinationTally>,
}

impl SectionSummary {
    pub fn new(key: SectionKey, threshold: Option<ResolvedThreshold>) -> Self {
        SectionSummary {
            key,
            threshold,
            channels: BTreeMap::new(),
            combinations: BTreeMap::new(),
        }
    }

    pub fn skipped(&self) -> bool {
        self.threshold.is_none()
    }

    /// Whether anything was left out of this section.
    pub fn is_partial(&self) -> bool {
        self.skipped()
            || self.channels.values().any(|c| !c.is_loaded() || c.dropped > 0)
            || self.combinations.values().any(|c| !c.is_evaluated())
    }

    pub fn channel_status(&self, channel: Channel) -> Option<ChannelStatus> {
        self.channels.get(&channel).map(|c| c.status)
    }

    pub fn tally(&self, kind: CombinationKind) -> Option<&CombinationTally> {
        self.combinations.get(&kind)
    }
}

/// Sums over any set of sections (one mouse, or the whole run).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub sections: usize,
    pub skipped_sections: usize,
    /// Loaded detections per channel.
    pub detections: BTreeMap<Channel, usize>,
    pub dropped: BTreeMap<Channel, usize>,
    pub combinations: BTreeMap<CombinationKind, CombinationTally>,
}

impl AggregateSummary {
    pub fn absorb(&mut self, section: &SectionSummary) {
        self.sections += 1;
        if section.skipped() {
            self.skipped_sections += 1;
        }
        for (&channel, tally) in &section.channels {
            *self.detections.entry(channel).or_default() += tally.detections;
            *self.dropped.entry(channel).or_default() += tally.dropped;
        }
        for (&kind, tally) in &section.combinations {
            self.combinations.entry(kind).or_default().absorb(tally);
        }
    }

    pub fn tally(&self, kind: CombinationKind) -> Option<&CombinationTally> {
        self.combinations.get(&kind)
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Sorted by key.
    pub sections: Vec<SectionSummary>,
    pub mice: BTreeMap<String, AggregateSummary>,
    pub totals: AggregateSummary,
    pub issues: Vec<Issue>,
    /// Sections never started because the run was cancelled.
    pub unprocessed: Vec<SectionKey>,
    pub cancelled: bool,
}

impl RunSummary {
    /// Fold one finished section in. Callers feed sections in key order.
    pub fn record(&mut self, summary: SectionSummary, issues: impl IntoIterator<Item = Issue>) {
        self.mice
            .entry(summary.key.mouse.clone())
            .or_default()
            .absorb(&summary);
        self.totals.absorb(&summary);
        self.issues.extend(issues);
        self.sections.push(summary);
    }

    pub fn mark_cancelled(&mut self, unprocessed: Vec<SectionKey>) {
        self.cancelled = true;
        self.unprocessed = unprocessed;
    }

    /// Sections that were skipped or lost a channel, a combination or rows.
    pub fn partial_sections(&self) -> impl Iterator<Item = &SectionSummary> + '_ {
        self.sections.iter().filter(|s| s.is_partial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coloc::Threshold;
    use crate::data::model::ChannelPair;

    const WFA_PV: CombinationKind = CombinationKind::Pair(ChannelPair::WFA_PV);

    fn threshold() -> Option<ResolvedThreshold> {
        Some(ResolvedThreshold {
            pixels: Threshold::new(5.0).unwrap(),
            microns: None,
            pixel_size: None,
        })
    }

    fn section(mouse: &str, name: &str, wfa: usize, pv: usize, groups: usize) -> SectionSummary {
        let mut s = SectionSummary::new(SectionKey::new(mouse, name), threshold());
        s.channels.insert(Channel::Wfa, ChannelTally::loaded(wfa, 0));
        s.channels.insert(Channel::Pv, ChannelTally::loaded(pv, 0));
        let mut tally =
            CombinationTally::evaluated(BTreeMap::from([(Channel::Wfa, wfa), (Channel::Pv, pv)]));
        tally.groups = groups;
        tally.pairwise_matches = groups;
        tally.distance_sum_px = groups as f64 * 2.0;
        s.combinations.insert(WFA_PV, tally);
        s
    }

    #[test]
    fn percentage_uses_rarer_channel() {
        let s = section("m1", "s1", 10, 4, 2);
        assert_eq!(s.tally(WFA_PV).unwrap().percentage(), Some(50.0));
    }

    #[test]
    fn aggregates_recompute_from_sums() {
        let mut run = RunSummary::default();
        // 1/1 = 100 % and 1/9 ≈ 11 %; the aggregate is 2/10, not their mean.
        run.record(section("m1", "s1", 1, 1, 1), []);
        run.record(section("m1", "s2", 9, 20, 1), []);
        run.record(section("m2", "s1", 5, 5, 5), []);

        let m1 = run.mice["m1"].tally(WFA_PV).unwrap();
        assert_eq!(m1.groups, 2);
        assert_eq!(m1.channel_totals[&Channel::Wfa], 10);
        assert_eq!(m1.percentage(), Some(20.0));
        assert_eq!(m1.mean_distance_px(), Some(2.0));

        let totals = run.totals.tally(WFA_PV).unwrap();
        let summed: usize = run.sections.iter().map(|s| s.tally(WFA_PV).unwrap().groups).sum();
        assert_eq!(totals.groups, summed);
        assert_eq!(totals.evaluated, 3);
        assert_eq!(run.totals.detections[&Channel::Pv], 26);
    }

    #[test]
    fn unevaluated_sections_do_not_dilute() {
        let mut run = RunSummary::default();
        run.record(section("m1", "s1", 4, 4, 2), []);

        let mut skipped = SectionSummary::new(SectionKey::new("m1", "s2"), threshold());
        skipped.channels.insert(Channel::Wfa, ChannelTally::loaded(100, 0));
        skipped
            .channels
            .insert(Channel::Pv, ChannelTally::unavailable(ChannelStatus::Missing));
        skipped.combinations.insert(WFA_PV, CombinationTally::default());
        assert!(skipped.is_partial());
        run.record(skipped, []);

        let tally = run.mice["m1"].tally(WFA_PV).unwrap();
        assert_eq!(tally.percentage(), Some(50.0));
        assert_eq!(run.partial_sections().count(), 1);
    }

    #[test]
    fn empty_channel_gives_zero_percent() {
        let s = section("m1", "s1", 0, 3, 0);
        assert_eq!(s.tally(WFA_PV).unwrap().percentage(), Some(0.0));
        assert_eq!(CombinationTally::default().percentage(), None);
    }
}
