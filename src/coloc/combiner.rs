//! Turning pairwise matches into 2-way and 3-way colocalization groups.
//!
//! A 3-way group needs all three pairwise results to connect exactly the same
//! ids; two agreeing matches are not enough, because each pair was
//! thresholded independently. Ids that end up in a 3-way group are not
//! counted again in 2-way groups.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::matcher::PairwiseResult;
use crate::data::model::{Channel, ChannelPair, ChannelSection, CombinationKind};
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// CombinationRequest
// ---------------------------------------------------------------------------

/// Which colocalizations a run asks for. Asking for the triple implies all
/// three pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinationRequest {
    pairs: BTreeSet<ChannelPair>,
    triple: bool,
}

impl CombinationRequest {
    pub fn new<I>(kinds: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = CombinationKind>,
    {
        let mut pairs = BTreeSet::new();
        let mut triple = false;
        for kind in kinds {
            match kind {
                CombinationKind::Pair(p) => {
                    pairs.insert(p);
                }
                CombinationKind::Triple => triple = true,
            }
        }
        if triple {
            pairs.extend(ChannelPair::ALL);
        }
        if pairs.is_empty() {
            return Err(ConfigError::EmptyRequest);
        }
        Ok(CombinationRequest { pairs, triple })
    }

    /// Parse names such as `WFA-PV`, `agg_pv` or `all`.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let kinds = names
            .iter()
            .map(|n| n.as_ref().parse::<CombinationKind>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(kinds)
    }

    pub fn all() -> Self {
        CombinationRequest {
            pairs: ChannelPair::ALL.into_iter().collect(),
            triple: true,
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = ChannelPair> + '_ {
        self.pairs.iter().copied()
    }

    pub fn includes_triple(&self) -> bool {
        self.triple
    }

    /// Every kind that gets a tally: the pairs, then the triple.
    pub fn kinds(&self) -> Vec<CombinationKind> {
        let mut kinds: Vec<CombinationKind> = self.pairs().map(CombinationKind::Pair).collect();
        if self.triple {
            kinds.push(CombinationKind::Triple);
        }
        kinds
    }

    /// Channels the request touches.
    pub fn channels(&self) -> BTreeSet<Channel> {
        self.pairs
            .iter()
            .flat_map(|p| [p.first(), p.second()])
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ColocalizationGroup
// ---------------------------------------------------------------------------

/// A validated set of mutually matched detections from 2 or 3 channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColocalizationGroup {
    pub kind: CombinationKind,
    pub members: BTreeMap<Channel, usize>,
    /// The pairwise distances supporting the group (one for a 2-way group,
    /// three for a 3-way group).
    pub distances: BTreeMap<ChannelPair, f64>,
}

impl ColocalizationGroup {
    pub fn member(&self, channel: Channel) -> Option<usize> {
        self.members.get(&channel).copied()
    }

    /// Mean of the supporting distances.
    pub fn mean_distance(&self) -> f64 {
        if self.distances.is_empty() {
            return 0.0;
        }
        self.distances.values().sum::<f64>() / self.distances.len() as f64
    }
}

/// All groups found for one section.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Colocalization {
    /// 3-way groups first, then 2-way groups per pair in canonical pair
    /// order; within a kind, in the commit order of the underlying matches.
    pub groups: Vec<ColocalizationGroup>,
}

impl Colocalization {
    pub fn of_kind(&self, kind: CombinationKind) -> impl Iterator<Item = &ColocalizationGroup> + '_ {
        self.groups.iter().filter(move |g| g.kind == kind)
    }

    pub fn count(&self, kind: CombinationKind) -> usize {
        self.of_kind(kind).count()
    }

    /// Ids of `channel` that belong to at least one group.
    pub fn grouped_ids(&self, channel: Channel) -> HashSet<usize> {
        self.groups
            .iter()
            .filter_map(|g| g.member(channel))
            .collect()
    }
}

/// A detection that ended up in no group of the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedDetection {
    pub channel: Channel,
    pub id: usize,
    pub x: f64,
    pub y: f64,
}

// ---------------------------------------------------------------------------
// Combining
// ---------------------------------------------------------------------------

/// Build the groups for `request` from the pairwise results that could be
/// computed. Results must be oriented by the pair's canonical channel order
/// (as [`match_channels`](super::matcher::match_channels) produces them).
/// Pairs absent from `pairwise` contribute nothing.
pub fn combine(
    request: &CombinationRequest,
    pairwise: &BTreeMap<ChannelPair, PairwiseResult>,
) -> Colocalization {
    let mut groups = Vec::new();
    let mut absorbed: BTreeMap<Channel, HashSet<usize>> = BTreeMap::new();

    if request.includes_triple() {
        if let (Some(wa), Some(wp), Some(ap)) = (
            pairwise.get(&ChannelPair::WFA_AGG),
            pairwise.get(&ChannelPair::WFA_PV),
            pairwise.get(&ChannelPair::AGG_PV),
        ) {
            let wfa_pv: HashMap<usize, (usize, f64)> =
                wp.matches.iter().map(|m| (m.id_a, (m.id_b, m.distance))).collect();
            let agg_pv: HashMap<usize, (usize, f64)> =
                ap.matches.iter().map(|m| (m.id_a, (m.id_b, m.distance))).collect();

            for m in &wa.matches {
                let (w, a) = (m.id_a, m.id_b);
                let Some(&(p, d_wp)) = wfa_pv.get(&w) else { continue };
                let Some(&(p_from_agg, d_ap)) = agg_pv.get(&a) else { continue };
                if p != p_from_agg {
                    continue;
                }
                for (channel, id) in [(Channel::Wfa, w), (Channel::Agg, a), (Channel::Pv, p)] {
                    absorbed.entry(channel).or_default().insert(id);
                }
                groups.push(ColocalizationGroup {
                    kind: CombinationKind::Triple,
                    members: BTreeMap::from([(Channel::Wfa, w), (Channel::Agg, a), (Channel::Pv, p)]),
                    distances: BTreeMap::from([
                        (ChannelPair::WFA_AGG, m.distance),
                        (ChannelPair::WFA_PV, d_wp),
                        (ChannelPair::AGG_PV, d_ap),
                    ]),
                });
            }
        }
    }

    let is_absorbed = |channel: Channel, id: usize| {
        absorbed
            .get(&channel)
            .map_or(false, |ids| ids.contains(&id))
    };

    for pair in request.pairs() {
        let Some(result) = pairwise.get(&pair) else { continue };
        for m in &result.matches {
            if is_absorbed(pair.first(), m.id_a) || is_absorbed(pair.second(), m.id_b) {
                continue;
            }
            groups.push(ColocalizationGroup {
                kind: CombinationKind::Pair(pair),
                members: BTreeMap::from([(pair.first(), m.id_a), (pair.second(), m.id_b)]),
                distances: BTreeMap::from([(pair, m.distance)]),
            });
        }
    }

    Colocalization { groups }
}

/// Detections of the request's channels that belong to no group, per
/// channel in ascending id order. Channels missing from `sections` are
/// skipped.
pub fn unmatched(
    request: &CombinationRequest,
    sections: &BTreeMap<Channel, ChannelSection>,
    coloc: &Colocalization,
) -> Vec<UnmatchedDetection> {
    let mut out = Vec::new();
    for channel in request.channels() {
        let Some(section) = sections.get(&channel) else { continue };
        let grouped = coloc.grouped_ids(channel);
        out.extend(
            section
                .detections()
                .iter()
                .filter(|d| !grouped.contains(&d.id))
                .map(|d| UnmatchedDetection {
                    channel,
                    id: d.id,
                    x: d.x,
                    y: d.y,
                }),
        );
    }
    out
}
