use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Channel – one marker's detection stream
// ---------------------------------------------------------------------------

/// A staining channel. Declaration order is the canonical order used for
/// pair normalisation, file names and report columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "WFA")]
    Wfa,
    #[serde(rename = "Agg")]
    Agg,
    #[serde(rename = "PV")]
    Pv,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Wfa, Channel::Agg, Channel::Pv];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Wfa => "WFA",
            Channel::Agg => "Agg",
            Channel::Pv => "PV",
        }
    }

    /// Directory name used by the upstream folder layout.
    pub fn default_dir(self) -> &'static str {
        match self {
            Channel::Wfa => "Mice_WFA",
            Channel::Agg => "Mice_Agg",
            Channel::Pv => "PV_Mice",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wfa" => Ok(Channel::Wfa),
            "agg" | "aggrecan" => Ok(Channel::Agg),
            "pv" => Ok(Channel::Pv),
            _ => Err(ConfigError::UnknownChannel(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelPair / CombinationKind
// ---------------------------------------------------------------------------

/// An unordered pair of distinct channels, stored in canonical order.
/// Serialized as its display name (`WFA-PV`) so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelPair {
    first: Channel,
    second: Channel,
}

impl ChannelPair {
    pub const WFA_AGG: ChannelPair = ChannelPair { first: Channel::Wfa, second: Channel::Agg };
    pub const WFA_PV: ChannelPair = ChannelPair { first: Channel::Wfa, second: Channel::Pv };
    pub const AGG_PV: ChannelPair = ChannelPair { first: Channel::Agg, second: Channel::Pv };

    pub const ALL: [ChannelPair; 3] = [Self::WFA_AGG, Self::WFA_PV, Self::AGG_PV];

    /// Returns `None` when both channels are the same.
    pub fn new(a: Channel, b: Channel) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(ChannelPair { first: a, second: b }),
            std::cmp::Ordering::Greater => Some(ChannelPair { first: b, second: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn first(self) -> Channel {
        self.first
    }

    pub fn second(self) -> Channel {
        self.second
    }

    pub fn contains(self, channel: Channel) -> bool {
        self.first == channel || self.second == channel
    }

    /// Lowercase file-name fragment, e.g. `wfa_pv`.
    pub fn slug(self) -> String {
        format!(
            "{}_{}",
            self.first.name().to_ascii_lowercase(),
            self.second.name().to_ascii_lowercase()
        )
    }
}

impl fmt::Display for ChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.second)
    }
}

/// What kind of colocalization a group or tally describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CombinationKind {
    Pair(ChannelPair),
    Triple,
}

impl CombinationKind {
    pub fn channels(self) -> Vec<Channel> {
        match self {
            CombinationKind::Pair(p) => vec![p.first(), p.second()],
            CombinationKind::Triple => Channel::ALL.to_vec(),
        }
    }
}

impl fmt::Display for CombinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombinationKind::Pair(p) => write!(f, "{p}"),
            CombinationKind::Triple => f.write_str("WFA-Agg-PV"),
        }
    }
}

impl FromStr for CombinationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(['-', '_', '+']).map(str::trim).collect();
        match parts.as_slice() {
            [a, b] => {
                let a: Channel = a.parse().map_err(|_| ConfigError::UnknownCombination(s.to_string()))?;
                let b: Channel = b.parse().map_err(|_| ConfigError::UnknownCombination(s.to_string()))?;
                ChannelPair::new(a, b)
                    .map(CombinationKind::Pair)
                    .ok_or_else(|| ConfigError::UnknownCombination(s.to_string()))
            }
            [a, b, c] => {
                let mut channels = [a, b, c]
                    .iter()
                    .map(|c| c.parse::<Channel>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ConfigError::UnknownCombination(s.to_string()))?;
                channels.sort();
                channels.dedup();
                if channels.len() == 3 {
                    Ok(CombinationKind::Triple)
                } else {
                    Err(ConfigError::UnknownCombination(s.to_string()))
                }
            }
            [single] if single.eq_ignore_ascii_case("all") => Ok(CombinationKind::Triple),
            _ => Err(ConfigError::UnknownCombination(s.to_string())),
        }
    }
}

impl FromStr for ChannelPair {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<CombinationKind>()? {
            CombinationKind::Pair(p) => Ok(p),
            CombinationKind::Triple => Err(ConfigError::UnknownCombination(s.to_string())),
        }
    }
}

// -- String (de)serialization for the pair / kind keys --

macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(ChannelPair);
serde_via_str!(CombinationKind);

// ---------------------------------------------------------------------------
// Detection – one row of a localization file
// ---------------------------------------------------------------------------

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// A single predicted structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `id` column value, or the row's line number in the source file
    /// (header = line 1).
    pub id: usize,
    pub x: f64,
    pub y: f64,
    pub bbox: Option<BoundingBox>,
    pub score: Option<f64>,
}

impl Detection {
    pub fn new(id: usize, x: f64, y: f64) -> Self {
        Detection {
            id,
            x,
            y,
            bbox: None,
            score: None,
        }
    }

    pub fn distance_to(&self, other: &Detection) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

// ---------------------------------------------------------------------------
// SectionKey / ChannelSection
// ---------------------------------------------------------------------------

/// Identifies one tissue section of one mouse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionKey {
    pub mouse: String,
    pub section: String,
}

impl SectionKey {
    pub fn new(mouse: impl Into<String>, section: impl Into<String>) -> Self {
        SectionKey {
            mouse: mouse.into(),
            section: section.into(),
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mouse, self.section)
    }
}

/// All detections of one channel in one section. Ids are unique and the
/// collection is sorted by id.
#[derive(Debug, Clone)]
pub struct ChannelSection {
    pub channel: Channel,
    detections: Vec<Detection>,
}

impl ChannelSection {
    /// Sorts by id and drops later duplicates of an id.
    pub fn new(channel: Channel, mut detections: Vec<Detection>) -> Self {
        detections.sort_by_key(|d| d.id);
        detections.dedup_by_key(|d| d.id);
        ChannelSection { channel, detections }
    }

    /// Convenience for tests and synthetic data: ids follow slice order.
    pub fn from_points(channel: Channel, points: &[(f64, f64)]) -> Self {
        let detections = points
            .iter()
            .enumerate()
            .map(|(id, &(x, y))| Detection::new(id, x, y))
            .collect();
        ChannelSection { channel, detections }
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn get(&self, id: usize) -> Option<&Detection> {
        self.detections
            .binary_search_by_key(&id, |d| d.id)
            .ok()
            .map(|i| &self.detections[i])
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
