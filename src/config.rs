//! Run configuration.
//!
//! Everything a run needs lives in one [`RunConfig`] that can be read from
//! JSON and overridden from the command line. [`RunConfig::validate`] is the only gate: it either returns a
//! [`ValidatedConfig`] or a fatal [`ConfigError`] before any section is read.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coloc::distribution::DistanceReportConfig;
use crate::coloc::{CombinationRequest, Threshold};
use crate::data::filter::SectionFilter;
use crate::data::model::{Channel, SectionKey};
use crate::error::ConfigError;
use crate::overlay::VisualizationSettings;

/// Threshold used when none is configured, in the run's unit.
pub const DEFAULT_THRESHOLD: f64 = 10.0;

// ---------------------------------------------------------------------------
// Units and pixel sizes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitMode {
    /// `threshold` is in pixels.
    #[default]
    Pixels,
    /// `threshold` is in µm and is converted per section with its pixel
    /// size.
    Microns,
}

/// Pixel sizes in µm/pixel. The most specific entry wins:
/// `sections["mouse/section"]`, then `mice["mouse"]`, then `default`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PixelSizeTable {
    #[serde(default)]
    pub default: Option<f64>,
    #[serde(default)]
    pub mice: BTreeMap<String, f64>,
    #[serde(default)]
    pub sections: BTreeMap<String, f64>,
}

impl PixelSizeTable {
    pub fn uniform(size: f64) -> Self {
        PixelSizeTable {
            default: Some(size),
            ..Default::default()
        }
    }

    pub fn lookup(&self, key: &SectionKey) -> Option<f64> {
        self.sections
            .get(&key.to_string())
            .or_else(|| self.mice.get(&key.mouse))
            .copied()
            .or(self.default)
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.default
            .into_iter()
            .chain(self.mice.values().copied())
            .chain(self.sections.values().copied())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let check = |scope: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::PixelSize {
                    scope: scope.to_string(),
                    value,
                })
            }
        };
        if let Some(d) = self.default {
            check("default", d)?;
        }
        for (scope, &v) in self.mice.iter().chain(self.sections.iter()) {
            check(scope, v)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunConfig – the raw, user-facing configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Colocalization radius, in pixels or µm depending on `unit`.
    pub threshold: f64,
    #[serde(default)]
    pub unit: UnitMode,
    #[serde(default)]
    pub pixel_sizes: PixelSizeTable,
    /// Pixel threshold for micron-mode sections that have no pixel size.
    #[serde(default)]
    pub fallback_pixel_threshold: Option<f64>,
    /// `WFA-PV`, `WFA-Agg`, `Agg-PV`, `all` …
    #[serde(default = "default_combinations")]
    pub combinations: Vec<String>,
    #[serde(default)]
    pub emit_unmatched: bool,
    #[serde(default)]
    pub distance_report: Option<DistanceReportConfig>,
    #[serde(default)]
    pub visualization: Option<VisualizationSettings>,
    /// Worker threads; defaults to the number of cores.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Overrides of the per-channel input directory names.
    #[serde(default)]
    pub channel_dirs: BTreeMap<Channel, String>,
    #[serde(default)]
    pub selection: SectionFilter,
}

fn default_combinations() -> Vec<String> {
    vec!["all".to_string()]
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            threshold: DEFAULT_THRESHOLD,
            unit: UnitMode::Pixels,
            pixel_sizes: PixelSizeTable::default(),
            fallback_pixel_threshold: None,
            combinations: default_combinations(),
            emit_unmatched: false,
            distance_report: None,
            visualization: None,
            workers: None,
            channel_dirs: BTreeMap::new(),
            selection: SectionFilter::default(),
        }
    }
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field and resolve the derived settings.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let threshold = positive_threshold(self.threshold)?;
        let fallback = self
            .fallback_pixel_threshold
            .map(positive_threshold)
            .transpose()?;
        self.pixel_sizes.validate()?;

        if self.unit == UnitMode::Microns {
            for size in self.pixel_sizes.values() {
                positive_threshold(threshold / size)?;
            }
        }

        if let Some(report) = &self.distance_report {
            if !report.is_valid() {
                return Err(ConfigError::DistanceRange(report.max_distance));
            }
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Workers);
        }

        Ok(ValidatedConfig {
            request: CombinationRequest::parse(&self.combinations)?,
            thresholds: ThresholdPolicy {
                unit: self.unit,
                value: threshold,
                pixel_sizes: self.pixel_sizes.clone(),
                fallback_pixels: fallback,
            },
            emit_unmatched: self.emit_unmatched,
            distance_report: self.distance_report,
            visualization: self.visualization.clone(),
            workers: self.workers,
            selection: self.selection.clone(),
        })
    }
}

/// Thresholds must be strictly positive for a run, even though the matcher
/// itself accepts zero.
fn positive_threshold(value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::Threshold {
            value,
            reason: "must be a finite number",
        });
    }
    if value <= 0.0 {
        return Err(ConfigError::Threshold {
            value,
            reason: "must be positive",
        });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// ValidatedConfig / ThresholdPolicy
// ---------------------------------------------------------------------------

/// Configuration that passed [`RunConfig::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub request: CombinationRequest,
    pub thresholds: ThresholdPolicy,
    pub emit_unmatched: bool,
    pub distance_report: Option<DistanceReportConfig>,
    pub visualization: Option<VisualizationSettings>,
    pub workers: Option<usize>,
    pub selection: SectionFilter,
}

/// The threshold that applies to one section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedThreshold {
    pub pixels: Threshold,
    /// The same radius in µm, when the section has a pixel size.
    pub microns: Option<f64>,
    /// µm per pixel, when known.
    pub pixel_size: Option<f64>,
}

impl ResolvedThreshold {
    /// Convert a pixel distance to µm when the pixel size is known.
    pub fn to_microns(&self, pixels: f64) -> Option<f64> {
        self.pixel_size.map(|ps| pixels * ps)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    unit: UnitMode,
    value: f64,
    pixel_sizes: PixelSizeTable,
    fallback_pixels: Option<f64>,
}

impl ThresholdPolicy {
    pub fn pixels(value: f64) -> Result<Self, ConfigError> {
        Ok(ThresholdPolicy {
            unit: UnitMode::Pixels,
            value: positive_threshold(value)?,
            pixel_sizes: PixelSizeTable::default(),
            fallback_pixels: None,
        })
    }

    pub fn unit(&self) -> UnitMode {
        self.unit
    }

    pub fn pixel_sizes(&self) -> &PixelSizeTable {
        &self.pixel_sizes
    }

    /// `None` when the run is in micron mode, the section has no pixel size
    /// and no fallback pixel threshold is configured.
    pub fn resolve(&self, key: &SectionKey) -> Option<ResolvedThreshold> {
        let pixel_size = self.pixel_sizes.lookup(key);
        let (pixels, microns) = match (self.unit, pixel_size) {
            (UnitMode::Pixels, ps) => (self.value, ps.map(|ps| self.value * ps)),
            (UnitMode::Microns, Some(ps)) => (self.value / ps, Some(self.value)),
            (UnitMode::Microns, None) => (self.fallback_pixels?, None),
        };
        // Validation checked the ratio for every configured pixel size.
        let pixels = Threshold::new(pixels).ok()?;
        Some(ResolvedThreshold {
            pixels,
            microns,
            pixel_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SectionKey {
        SectionKey::new("IB60", "IB60_CA1_1L")
    }

    #[test]
    fn defaults_validate() {
        let v = RunConfig::default().validate().unwrap();
        assert!(v.request.includes_triple());
        let r = v.thresholds.resolve(&key()).unwrap();
        assert_eq!(r.pixels.pixels(), DEFAULT_THRESHOLD);
        assert_eq!(r.microns, None);
    }

    #[test]
    fn non_positive_threshold_is_fatal() {
        for bad in [0.0, -3.0, f64::NAN] {
            let cfg = RunConfig {
                threshold: bad,
                ..Default::default()
            };
            assert!(matches!(cfg.validate(), Err(ConfigError::Threshold { .. })));
        }
    }

    #[test]
    fn bad_combination_is_fatal() {
        let cfg = RunConfig {
            combinations: vec!["WFA-GFP".into()],
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownCombination(_))
        ));
    }

    #[test]
    fn micron_conversion_per_section() {
        let mut sizes = PixelSizeTable::uniform(0.5);
        sizes.mice.insert("IB61".into(), 0.25);
        sizes.sections.insert("IB60/IB60_CA1_1L".into(), 2.0);
        let cfg = RunConfig {
            threshold: 10.0,
            unit: UnitMode::Microns,
            pixel_sizes: sizes,
            ..Default::default()
        };
        let policy = cfg.validate().unwrap().thresholds;

        let r = policy.resolve(&key()).unwrap();
        assert_eq!(r.pixels.pixels(), 5.0);
        assert_eq!(r.microns, Some(10.0));
        assert_eq!(r.to_microns(3.0), Some(6.0));

        let r = policy.resolve(&SectionKey::new("IB61", "x")).unwrap();
        assert_eq!(r.pixels.pixels(), 40.0);

        let r = policy.resolve(&SectionKey::new("IB70", "x")).unwrap();
        assert_eq!(r.pixels.pixels(), 20.0);
    }

    #[test]
    fn micron_mode_without_pixel_size() {
        let cfg = RunConfig {
            unit: UnitMode::Microns,
            ..Default::default()
        };
        let policy = cfg.validate().unwrap().thresholds;
        assert!(policy.resolve(&key()).is_none());

        let cfg = RunConfig {
            unit: UnitMode::Microns,
            fallback_pixel_threshold: Some(12.0),
            ..Default::default()
        };
        let r = cfg.validate().unwrap().thresholds.resolve(&key()).unwrap();
        assert_eq!(r.pixels.pixels(), 12.0);
        assert_eq!(r.pixel_size, None);
    }

    #[test]
    fn rejects_bad_pixel_size() {
        let cfg = RunConfig {
            pixel_sizes: PixelSizeTable::uniform(-1.0),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::PixelSize { .. })));
    }

    #[test]
    fn micron_ratio_must_stay_positive_and_finite() {
        // 10 / 1e-320 overflows to infinity; 1e-320 / 1e10 underflows to 0.
        for (threshold, size) in [(10.0, 1e-320), (1e-320, 1e10)] {
            let mut sizes = PixelSizeTable::default();
            sizes.mice.insert("IB60".into(), size);
            let cfg = RunConfig {
                threshold,
                unit: UnitMode::Microns,
                pixel_sizes: sizes,
                ..Default::default()
            };
            assert!(
                matches!(cfg.validate(), Err(ConfigError::Threshold { .. })),
                "{threshold} um at {size} um/px"
            );
        }
        // Pixel mode never divides by the pixel size.
        let cfg = RunConfig {
            pixel_sizes: PixelSizeTable::uniform(1e-320),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_oversized_distance_report() {
        for max_distance in [1e19, 1e9, f64::INFINITY, 0.0] {
            let cfg = RunConfig {
                distance_report: Some(DistanceReportConfig {
                    max_distance,
                    stop_at_plateau: false,
                }),
                ..Default::default()
            };
            assert!(matches!(cfg.validate(), Err(ConfigError::DistanceRange(_))));
        }
    }

    #[test]
    fn parses_json() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{
                "threshold": 8.5,
                "unit": "microns",
                "pixel_sizes": { "default": 0.65 },
                "combinations": ["WFA-PV", "agg-pv"],
                "emit_unmatched": true,
                "distance_report": { "max_distance": 30 },
                "channel_dirs": { "Agg": "Aggrecan" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.unit, UnitMode::Microns);
        assert_eq!(cfg.channel_dirs[&Channel::Agg], "Aggrecan");
        let v = cfg.validate().unwrap();
        assert_eq!(v.request.kinds().len(), 2);
        assert!(!v.distance_report.unwrap().stop_at_plateau);
    }
}
