//! Section-level orchestration.
//!
//! Every section is processed independently into an immutable
//! [`SectionResult`]. [`run_with`] spreads batches of sections over a rayon
//! pool and folds the results into a [`RunSummary`] on the calling thread, in
//! key order, so the summary does not depend on scheduling.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::coloc::distribution::{distance_distribution, DistanceDistribution};
use crate::coloc::{combine, match_channels, unmatched, Colocalization, PairwiseResult, UnmatchedDetection};
use crate::config::{ResolvedThreshold, UnitMode, ValidatedConfig};
use crate::data::model::{Channel, ChannelPair, ChannelSection, CombinationKind, SectionKey};
use crate::data::source::DetectionSource;
use crate::error::{Issue, LoadError};
use crate::stats::{ChannelStatus, ChannelTally, CombinationTally, RunSummary, SectionSummary};

/// Malformed row numbers kept per issue.
const REPORTED_ROWS: usize = 5;

/// Everything computed for one section.
#[derive(Debug, Clone)]
pub struct SectionResult {
    pub key: SectionKey,
    /// Channels that loaded.
    pub channels: BTreeMap<Channel, ChannelSection>,
    /// Pairwise results of the evaluated pairs, in canonical orientation.
    pub pairwise: BTreeMap<ChannelPair, PairwiseResult>,
    pub colocalization: Colocalization,
    /// Filled only when unmatched output is requested.
    pub unmatched: Vec<UnmatchedDetection>,
    pub distances: Vec<DistanceDistribution>,
    pub summary: SectionSummary,
    pub issues: Vec<Issue>,
}

impl SectionResult {
    pub fn threshold(&self) -> Option<&ResolvedThreshold> {
        self.summary.threshold.as_ref()
    }

    fn skipped(key: &SectionKey, issue: Issue) -> Self {
        SectionResult {
            key: key.clone(),
            channels: BTreeMap::new(),
            pairwise: BTreeMap::new(),
            colocalization: Colocalization::default(),
            unmatched: Vec::new(),
            distances: Vec::new(),
            summary: SectionSummary::new(key.clone(), None),
            issues: vec![issue],
        }
    }
}

/// Load, match, combine and tally one section. Never fails: every problem
/// ends up in [`SectionResult::issues`].
pub fn process_section<S>(source: &S, key: &SectionKey, config: &ValidatedConfig) -> SectionResult
where
    S: DetectionSource + ?Sized,
{
    let request = &config.request;
    let Some(threshold) = config.thresholds.resolve(key) else {
        warn!("{key}: no pixel size and no pixel fallback threshold, skipping");
        return SectionResult::skipped(key, Issue::NoThreshold { section: key.clone() });
    };

    let mut summary = SectionSummary::new(key.clone(), Some(threshold));
    let mut issues = Vec::new();
    let mut channels = BTreeMap::new();

    for channel in request.channels() {
        let tally = match source.load(key, channel) {
            Ok(loaded) => {
                if !loaded.dropped.is_empty() {
                    warn!(
                        "{key}: dropped {} malformed {channel} rows",
                        loaded.dropped.len()
                    );
                    issues.push(Issue::MalformedRecords {
                        section: key.clone(),
                        channel,
                        dropped: loaded.dropped.len(),
                        first_rows: loaded.dropped.iter().take(REPORTED_ROWS).map(|r| r.row).collect(),
                    });
                }
                let tally = ChannelTally::loaded(loaded.section.len(), loaded.dropped.len());
                channels.insert(channel, loaded.section);
                tally
            }
            Err(LoadError::MissingSource { .. }) => {
                warn!("{key}: no {channel} source, channel skipped");
                issues.push(Issue::MissingSource {
                    section: key.clone(),
                    channel,
                });
                ChannelTally::unavailable(ChannelStatus::Missing)
            }
            Err(e) => {
                warn!("{key}: {channel} failed to load: {e}");
                issues.push(Issue::LoadFailed {
                    section: key.clone(),
                    channel,
                    reason: e.to_string(),
                });
                ChannelTally::unavailable(ChannelStatus::Failed)
            }
        };
        summary.channels.insert(channel, tally);
    }

    let mut pairwise = BTreeMap::new();
    for pair in request.pairs() {
        let (Some(a), Some(b)) = (channels.get(&pair.first()), channels.get(&pair.second())) else {
            continue;
        };
        if let Some((pair, result)) = match_channels(a, b, threshold.pixels) {
            debug!("{key}: {pair} {} matches", result.len());
            pairwise.insert(pair, result);
        }
    }

    for kind in request.kinds() {
        let missing: Vec<Channel> = kind
            .channels()
            .into_iter()
            .filter(|c| !channels.contains_key(c))
            .collect();
        if !missing.is_empty() {
            warn!("{key}: {kind} not evaluated");
            issues.push(Issue::EmptyCombination {
                section: key.clone(),
                combination: kind,
                missing,
            });
        }
    }

    let colocalization = combine(request, &pairwise);
    summary.combinations = tally_combinations(config, &channels, &pairwise, &colocalization, &threshold);

    let unmatched = if config.emit_unmatched {
        unmatched(request, &channels, &colocalization)
    } else {
        Vec::new()
    };

    let distances = match &config.distance_report {
        Some(report) => {
            let (scale, unit) = match (config.thresholds.unit(), threshold.pixel_size) {
                (UnitMode::Microns, Some(ps)) => (ps, "um"),
                _ => (1.0, "px"),
            };
            pairwise
                .keys()
                .filter_map(|&pair| {
                    let a = channels.get(&pair.first())?;
                    let b = channels.get(&pair.second())?;
                    Some(distance_distribution(
                        pair,
                        a.detections(),
                        b.detections(),
                        scale,
                        unit,
                        report,
                    ))
                })
                .collect()
        }
        None => Vec::new(),
    };

    info!(
        "{key}: {} groups at {:.2} px",
        colocalization.groups.len(),
        threshold.pixels.pixels()
    );

    SectionResult {
        key: key.clone(),
        channels,
        pairwise,
        colocalization,
        unmatched,
        distances,
        summary,
        issues,
    }
}

fn tally_combinations(
    config: &ValidatedConfig,
    channels: &BTreeMap<Channel, ChannelSection>,
    pairwise: &BTreeMap<ChannelPair, PairwiseResult>,
    coloc: &Colocalization,
    threshold: &ResolvedThreshold,
) -> BTreeMap<CombinationKind, CombinationTally> {
    let mut out = BTreeMap::new();
    for kind in config.request.kinds() {
        let totals: Option<BTreeMap<Channel, usize>> = kind
            .channels()
            .into_iter()
            .map(|c| channels.get(&c).map(|s| (c, s.len())))
            .collect();
        let Some(totals) = totals else {
            out.insert(kind, CombinationTally::default());
            continue;
        };

        let mut tally = CombinationTally::evaluated(totals);
        for group in coloc.of_kind(kind) {
            let mean = group.mean_distance();
            tally.groups += 1;
            tally.distance_sum_px += mean;
            if let Some(um) = threshold.to_microns(mean) {
                tally.distance_sum_um += um;
                tally.groups_with_um += 1;
            }
        }
        tally.pairwise_matches = match kind {
            CombinationKind::Pair(pair) => pairwise.get(&pair).map_or(0, |r| r.len()),
            CombinationKind::Triple => tally.groups,
        };
        out.insert(kind, tally);
    }
    out
}

// ---------------------------------------------------------------------------
// Running many sections
// ---------------------------------------------------------------------------

/// Shared flag checked before each section starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// In key order.
    pub results: Vec<SectionResult>,
    pub summary: RunSummary,
}

/// Sections processed per batch and worker thread before their results are
/// handed on.
const SECTIONS_PER_THREAD: usize = 2;

/// Process every selected section of `source` and keep all results.
pub fn run<S>(source: &S, config: &ValidatedConfig, cancel: &CancelToken) -> RunOutput
where
    S: DetectionSource + ?Sized,
{
    let mut results = Vec::new();
    let summary = run_with(source, config, cancel, |result| {
        results.push(result);
        Ok::<_, Infallible>(())
    });
    let summary = match summary {
        Ok(summary) => summary,
        Err(never) => match never {},
    };
    RunOutput { results, summary }
}

/// Process every selected section of `source`, handing each result to
/// `on_section` in key order as soon as its batch is done.
///
/// Only one batch of results is held at a time. The first error from
/// `on_section` stops the run and is returned.
pub fn run_with<S, F, E>(
    source: &S,
    config: &ValidatedConfig,
    cancel: &CancelToken,
    mut on_section: F,
) -> Result<RunSummary, E>
where
    S: DetectionSource + ?Sized,
    F: FnMut(SectionResult) -> Result<(), E>,
{
    let all = source.sections();
    for mouse in config.selection.unknown_mice(&all) {
        warn!("selected mouse {mouse} has no sections");
    }
    let keys = config.selection.apply(&all);
    info!("processing {} of {} sections", keys.len(), all.len());

    let pool = config.workers.and_then(|n| {
        match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("could not build a {n}-thread pool ({e}), using the global pool");
                None
            }
        }
    });
    let threads = pool
        .as_ref()
        .map_or_else(rayon::current_num_threads, |p| p.current_num_threads());
    let batch_size = (threads * SECTIONS_PER_THREAD).max(1);

    let mut summary = RunSummary::default();
    let mut unprocessed = Vec::new();
    for batch in keys.chunks(batch_size) {
        let work = || -> Vec<Option<SectionResult>> {
            batch
                .par_iter()
                .map(|key| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(process_section(source, key, config))
                })
                .collect()
        };
        let slots = match &pool {
            Some(pool) => pool.install(work),
            None => work(),
        };

        for (key, slot) in batch.iter().zip(slots) {
            match slot {
                Some(result) => {
                    summary.record(result.summary.clone(), result.issues.iter().cloned());
                    on_section(result)?;
                }
                None => unprocessed.push(key.clone()),
            }
        }
    }
    if cancel.is_cancelled() {
        warn!("run cancelled, {} sections not processed", unprocessed.len());
        summary.mark_cancelled(unprocessed);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PixelSizeTable, RunConfig};
    use crate::data::filter::SectionFilter;
    use crate::data::source::MemorySource;
    use crate::error::MalformedRecord;

    const WFA_PV: CombinationKind = CombinationKind::Pair(ChannelPair::WFA_PV);

    fn config(threshold: f64, combinations: &[&str]) -> ValidatedConfig {
        RunConfig {
            threshold,
            combinations: combinations.iter().map(|s| s.to_string()).collect(),
            emit_unmatched: true,
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn key(mouse: &str, section: &str) -> SectionKey {
        SectionKey::new(mouse, section)
    }

    #[test]
    fn missing_agg_keeps_wfa_pv() {
        let k = key("m1", "s1");
        let source = MemorySource::new()
            .with(&k, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0), (20.0, 20.0)]))
            .with(&k, ChannelSection::from_points(Channel::Pv, &[(1.0, 1.0)]));

        let result = process_section(&source, &k, &config(5.0, &["all"]));

        assert_eq!(result.summary.channel_status(Channel::Agg), Some(ChannelStatus::Missing));
        let wfa_pv = result.summary.tally(WFA_PV).unwrap();
        assert!(wfa_pv.is_evaluated());
        assert_eq!(wfa_pv.groups, 1);
        assert_eq!(wfa_pv.percentage(), Some(100.0));

        assert!(!result.summary.tally(CombinationKind::Triple).unwrap().is_evaluated());
        assert!(result
            .issues
            .iter()
            .any(|i| matches!(i, Issue::MissingSource { channel: Channel::Agg, .. })));
        // WFA-Agg, Agg-PV and the triple are reported as not evaluated.
        let empty = result
            .issues
            .iter()
            .filter(|i| matches!(i, Issue::EmptyCombination { .. }))
            .count();
        assert_eq!(empty, 3);
        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.unmatched[0].id, 1);
    }

    #[test]
    fn no_triple_without_full_agreement() {
        let k = key("m1", "s1");
        // w–p 2, w–a 3, a–p ≈ 3.6 but with threshold 3 Agg-PV fails.
        let source = MemorySource::new()
            .with(&k, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0)]))
            .with(&k, ChannelSection::from_points(Channel::Agg, &[(3.0, 0.0)]))
            .with(&k, ChannelSection::from_points(Channel::Pv, &[(0.0, 2.0)]));
        let result = process_section(&source, &k, &config(3.0, &["all"]));
        assert_eq!(result.colocalization.count(CombinationKind::Triple), 0);
        assert_eq!(result.colocalization.count(WFA_PV), 1);
        assert_eq!(
            result.colocalization.count(CombinationKind::Pair(ChannelPair::WFA_AGG)),
            1
        );
        assert!(result.issues.is_empty());
    }

    #[test]
    fn malformed_rows_are_reported() {
        let k = key("m1", "s1");
        let mut source = MemorySource::new();
        let dropped = (0..8)
            .map(|row| MalformedRecord {
                row,
                reason: "bad x".into(),
            })
            .collect();
        source.insert_with_drops(k.clone(), ChannelSection::from_points(Channel::Wfa, &[]), dropped);
        source.insert(k.clone(), ChannelSection::from_points(Channel::Pv, &[]));

        let result = process_section(&source, &k, &config(5.0, &["WFA-PV"]));
        match &result.issues[..] {
            [Issue::MalformedRecords {
                dropped,
                first_rows,
                ..
            }] => {
                assert_eq!(*dropped, 8);
                assert_eq!(first_rows, &vec![0, 1, 2, 3, 4]);
            }
            other => panic!("unexpected issues {other:?}"),
        }
        assert_eq!(result.summary.channels[&Channel::Wfa].dropped, 8);
    }

    #[test]
    fn micron_mode_without_pixel_size_skips() {
        let k = key("m1", "s1");
        let source = MemorySource::new()
            .with(&k, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0)]))
            .with(&k, ChannelSection::from_points(Channel::Pv, &[(0.0, 0.0)]));
        let cfg = RunConfig {
            unit: UnitMode::Microns,
            ..Default::default()
        }
        .validate()
        .unwrap();
        let result = process_section(&source, &k, &cfg);
        assert!(result.summary.skipped());
        assert!(matches!(&result.issues[..], [Issue::NoThreshold { .. }]));
    }

    #[test]
    fn micron_distances_and_report() {
        let k = key("m1", "s1");
        let source = MemorySource::new()
            .with(&k, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0)]))
            .with(&k, ChannelSection::from_points(Channel::Pv, &[(4.0, 0.0)]));
        let cfg = RunConfig {
            threshold: 3.0,
            unit: UnitMode::Microns,
            pixel_sizes: PixelSizeTable::uniform(0.5),
            combinations: vec!["WFA-PV".into()],
            distance_report: Some(crate::coloc::distribution::DistanceReportConfig {
                max_distance: 5.0,
                stop_at_plateau: false,
            }),
            ..Default::default()
        }
        .validate()
        .unwrap();
        let result = process_section(&source, &k, &cfg);
        // 3 µm at 0.5 µm/px is 6 px.
        assert_eq!(result.threshold().unwrap().pixels.pixels(), 6.0);
        let tally = result.summary.tally(WFA_PV).unwrap();
        assert_eq!(tally.mean_distance_px(), Some(4.0));
        assert_eq!(tally.mean_distance_um(), Some(2.0));
        assert_eq!(result.distances.len(), 1);
        assert_eq!(result.distances[0].unit, "um");
        assert_eq!(result.distances[0].bins[2].count, 1);
    }

    fn multi_section_source() -> MemorySource {
        let mut source = MemorySource::new();
        for (mouse, section, offset) in [("m2", "b", 1.0), ("m1", "b", 2.0), ("m1", "a", 9.0)] {
            let k = key(mouse, section);
            source.insert(k.clone(), ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0), (30.0, 30.0)]));
            source.insert(k, ChannelSection::from_points(Channel::Pv, &[(offset, 0.0), (30.0, 31.0)]));
        }
        source
    }

    #[test]
    fn run_is_ordered_and_sums() {
        let source = multi_section_source();
        let cfg = config(5.0, &["WFA-PV"]);
        let out = run(&source, &cfg, &CancelToken::new());

        let keys: Vec<String> = out.summary.sections.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(keys, ["m1/a", "m1/b", "m2/b"]);
        assert_eq!(out.results.len(), 3);

        let total = out.summary.totals.tally(WFA_PV).unwrap();
        assert_eq!(total.groups, 5);
        assert_eq!(total.channel_totals[&Channel::Wfa], 6);
        assert_eq!(out.summary.mice["m1"].tally(WFA_PV).unwrap().groups, 3);
        assert!(!out.summary.cancelled);

        let single = RunConfig {
            threshold: 5.0,
            combinations: vec!["WFA-PV".into()],
            workers: Some(1),
            ..Default::default()
        }
        .validate()
        .unwrap();
        let again = run(&source, &single, &CancelToken::new());
        assert_eq!(again.summary, out.summary);
    }

    #[test]
    fn streamed_sections_arrive_in_key_order() {
        let source = multi_section_source();
        let mut cfg = config(5.0, &["WFA-PV"]);
        cfg.workers = Some(1);

        let mut seen = Vec::new();
        let summary = run_with(&source, &cfg, &CancelToken::new(), |result| {
            seen.push(result.key.to_string());
            Ok::<_, String>(())
        })
        .unwrap();
        assert_eq!(seen, ["m1/a", "m1/b", "m2/b"]);
        assert_eq!(summary, run(&source, &cfg, &CancelToken::new()).summary);
    }

    #[test]
    fn sink_error_stops_the_run() {
        let source = multi_section_source();
        let mut calls = 0;
        let err = run_with(&source, &config(5.0, &["WFA-PV"]), &CancelToken::new(), |result| {
            calls += 1;
            if result.key.to_string() == "m1/b" {
                return Err(format!("cannot write {}", result.key));
            }
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err, "cannot write m1/b");
        assert_eq!(calls, 2);
    }

    #[test]
    fn cancelled_run_lists_unprocessed() {
        let source = multi_section_source();
        let token = CancelToken::new();
        token.cancel();
        let out = run(&source, &config(5.0, &["WFA-PV"]), &token);
        assert!(out.summary.cancelled);
        assert_eq!(out.summary.unprocessed.len(), 3);
        assert!(out.summary.sections.is_empty());
    }

    #[test]
    fn selection_limits_mice() {
        let source = multi_section_source();
        let mut cfg = config(5.0, &["WFA-PV"]);
        cfg.selection = SectionFilter::mice(["m2"]);
        let out = run(&source, &cfg, &CancelToken::new());
        assert_eq!(out.summary.sections.len(), 1);
        assert_eq!(out.summary.mice.len(), 1);
    }
}
