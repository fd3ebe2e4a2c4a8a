use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use palette::{Hsl, IntoColor, Srgb};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::data::model::{Channel, CombinationKind, SectionKey};
use crate::pipeline::SectionResult;

// ---------------------------------------------------------------------------
// Color
// ---------------------------------------------------------------------------

/// An 8-bit sRGB colour, written as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const MAGENTA: Color = Color::rgb(255, 0, 255);
    pub const GRAY: Color = Color::rgb(128, 128, 128);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }
}

impl From<Srgb<u8>> for Color {
    fn from(c: Srgb<u8>) -> Self {
        Color::rgb(c.red, c.green, c.blue)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rgb: Srgb<u8> = s
            .trim()
            .parse()
            .map_err(|e| format!("invalid colour '{s}': {e}"))?;
        Ok(rgb.into())
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Color palette generator
// ---------------------------------------------------------------------------

/// Generates `n` visually distinct colours using evenly spaced hues.
pub fn generate_palette(n: usize) -> Vec<Color> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| {
            let hue = (i as f32 / n as f32) * 360.0;
            let hsl = Hsl::new(hue, 0.75, 0.55);
            let rgb: Srgb = hsl.into_color();
            rgb.into_format::<u8>().into()
        })
        .collect()
}

/// Channel colours: the palette, with any configured overrides on top.
pub fn channel_colors(overrides: &BTreeMap<Channel, Color>) -> BTreeMap<Channel, Color> {
    Channel::ALL
        .into_iter()
        .zip(generate_palette(Channel::ALL.len()))
        .map(|(channel, default)| {
            (channel, overrides.get(&channel).copied().unwrap_or(default))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationSettings {
    /// Circle radius in pixels.
    pub circle_radius: f64,
    pub outline_width: f64,
    /// Outline width for detections that belong to a group.
    pub group_outline_width: f64,
    pub colors: BTreeMap<Channel, Color>,
    pub pair_color: Color,
    pub triple_color: Color,
    /// Weight of each channel image in the composite.
    pub blend_weights: BTreeMap<Channel, f64>,
    /// Opacity of the drawn overlay over the composite.
    pub overlay_alpha: f64,
}

impl Default for VisualizationSettings {
    fn default() -> Self {
        VisualizationSettings {
            circle_radius: 17.5,
            outline_width: 2.0,
            group_outline_width: 3.0,
            colors: BTreeMap::new(),
            pair_color: Color::WHITE,
            triple_color: Color::MAGENTA,
            blend_weights: Channel::ALL.into_iter().map(|c| (c, 1.0)).collect(),
            overlay_alpha: 0.9,
        }
    }
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayCircle {
    pub channel: Channel,
    pub id: usize,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub width: f64,
    pub color: Color,
    /// The 3-way kind when the detection is in a triple, else the first
    /// 2-way kind it belongs to.
    pub group: Option<CombinationKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayLink {
    pub kind: CombinationKind,
    pub from: (f64, f64),
    pub to: (f64, f64),
    pub distance: f64,
    pub color: Color,
}

/// Everything a renderer needs to draw one section; no matching is redone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayScene {
    pub section: SectionKey,
    pub circles: Vec<OverlayCircle>,
    pub links: Vec<OverlayLink>,
    pub blend_weights: BTreeMap<Channel, f64>,
    pub overlay_alpha: f64,
    pub legend: Vec<(String, Color)>,
}

pub fn build_overlay(result: &SectionResult, settings: &VisualizationSettings) -> OverlayScene {
    let colors = channel_colors(&settings.colors);

    let mut membership: BTreeMap<(Channel, usize), CombinationKind> = BTreeMap::new();
    for group in &result.colocalization.groups {
        for (&channel, &id) in &group.members {
            membership.entry((channel, id)).or_insert(group.kind);
        }
    }

    let mut circles = Vec::new();
    for (&channel, section) in &result.channels {
        let color = colors.get(&channel).copied().unwrap_or(Color::GRAY);
        for d in section.detections() {
            let group = membership.get(&(channel, d.id)).copied();
            circles.push(OverlayCircle {
                channel,
                id: d.id,
                x: d.x,
                y: d.y,
                radius: settings.circle_radius,
                width: if group.is_some() {
                    settings.group_outline_width
                } else {
                    settings.outline_width
                },
                color,
                group,
            });
        }
    }

    let position = |channel: Channel, id: usize| {
        result
            .channels
            .get(&channel)
            .and_then(|s| s.get(id))
            .map(|d| (d.x, d.y))
    };

    let mut links = Vec::new();
    for group in &result.colocalization.groups {
        let color = match group.kind {
            CombinationKind::Triple => settings.triple_color,
            CombinationKind::Pair(_) => settings.pair_color,
        };
        for (pair, &distance) in &group.distances {
            let (Some(a), Some(b)) = (group.member(pair.first()), group.member(pair.second())) else {
                continue;
            };
            if let (Some(from), Some(to)) = (position(pair.first(), a), position(pair.second(), b)) {
                links.push(OverlayLink {
                    kind: group.kind,
                    from,
                    to,
                    distance,
                    color,
                });
            }
        }
    }

    let mut legend: Vec<(String, Color)> = result
        .channels
        .keys()
        .filter_map(|c| colors.get(c).map(|&color| (c.to_string(), color)))
        .collect();
    legend.push(("2-way colocalized".to_string(), settings.pair_color));
    legend.push(("3-way colocalized".to_string(), settings.triple_color));

    OverlayScene {
        section: result.key.clone(),
        circles,
        links,
        blend_weights: settings.blend_weights.clone(),
        overlay_alpha: settings.overlay_alpha,
        legend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunConfig, ValidatedConfig};
    use crate::data::model::ChannelSection;
    use crate::data::source::MemorySource;
    use crate::pipeline::process_section;

    fn config() -> ValidatedConfig {
        RunConfig {
            threshold: 5.0,
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn palette_is_distinct() {
        let p = generate_palette(3);
        assert_eq!(p.len(), 3);
        assert_ne!(p[0], p[1]);
        assert_ne!(p[1], p[2]);
        assert!(generate_palette(0).is_empty());
    }

    #[test]
    fn color_hex_round_trip() {
        let c: Color = "#ff8000".parse().unwrap();
        assert_eq!(c, Color::rgb(255, 128, 0));
        assert_eq!(c.to_string(), "#ff8000");
        assert!("nope".parse::<Color>().is_err());
    }

    #[test]
    fn overrides_win() {
        let overrides = BTreeMap::from([(Channel::Pv, Color::rgb(0, 0, 255))]);
        let colors = channel_colors(&overrides);
        assert_eq!(colors[&Channel::Pv], Color::rgb(0, 0, 255));
        assert_eq!(colors.len(), 3);
    }

    #[test]
    fn scene_marks_grouped_detections() {
        let key = SectionKey::new("m", "s");
        let source = MemorySource::new()
            .with(&key, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0), (50.0, 50.0)]))
            .with(&key, ChannelSection::from_points(Channel::Agg, &[(1.0, 0.0)]))
            .with(&key, ChannelSection::from_points(Channel::Pv, &[(0.0, 1.0)]));
        let result = process_section(&source, &key, &config());
        let scene = build_overlay(&result, &VisualizationSettings::default());

        assert_eq!(scene.circles.len(), 4);
        let grouped = scene.circles.iter().filter(|c| c.group.is_some()).count();
        assert_eq!(grouped, 3);
        assert!(scene
            .circles
            .iter()
            .filter(|c| c.group.is_some())
            .all(|c| c.group == Some(CombinationKind::Triple) && c.width == 3.0));
        // One triple, three edges.
        assert_eq!(scene.links.len(), 3);
        assert!(scene.links.iter().all(|l| l.color == Color::MAGENTA));
        assert_eq!(scene.legend.len(), 5);
    }
}
