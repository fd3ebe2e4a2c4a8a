//! Writing section and run results to an output directory.
//!
//! ```text
//! <out>/<mouse>/<section>/groups.csv
//!                         unmatched.csv         (emit_unmatched)
//!                         distance_<pair>.csv   (distance report)
//!                         section.json
//!                         overlay.json          (visualization)
//! <out>/sections.csv  mice.csv  totals.csv  issues.csv  run_summary.json
//! ```
//!
//! CSV files start with `# ` comment lines (threshold, generation time)
//! before the header row.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::{ResolvedThreshold, UnitMode, ValidatedConfig};
use crate::data::model::{Channel, ChannelPair, CombinationKind};
use crate::error::Issue;
use crate::overlay::{build_overlay, VisualizationSettings};
use crate::pipeline::SectionResult;
use crate::stats::{CombinationTally, RunSummary};

pub struct Exporter {
    out_dir: PathBuf,
    generated: DateTime<Local>,
    unit: UnitMode,
    emit_unmatched: bool,
    visualization: Option<VisualizationSettings>,
}

impl Exporter {
    pub fn new(out_dir: impl Into<PathBuf>, config: &ValidatedConfig) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("creating output directory {}", out_dir.display()))?;
        Ok(Exporter {
            out_dir,
            generated: Local::now(),
            unit: config.thresholds.unit(),
            emit_unmatched: config.emit_unmatched,
            visualization: config.visualization.clone(),
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn timestamp(&self) -> String {
        self.generated.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Per-section files. Skipped sections only get `section.json`.
    pub fn write_section(&self, result: &SectionResult) -> Result<()> {
        let dir = self
            .out_dir
            .join(&result.key.mouse)
            .join(&result.key.section);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating section directory {}", dir.display()))?;

        write_json(
            &dir.join("section.json"),
            &SectionReport {
                generated: self.timestamp(),
                unit: self.unit,
                summary: &result.summary,
                issues: &result.issues,
            },
        )?;

        let Some(threshold) = result.threshold() else {
            return Ok(());
        };
        let header = self.header(&result.key.to_string(), Some(threshold));

        let groups: Vec<GroupRow> = result
            .colocalization
            .groups
            .iter()
            .map(|g| GroupRow {
                kind: g.kind.to_string(),
                wfa_id: g.member(Channel::Wfa),
                agg_id: g.member(Channel::Agg),
                pv_id: g.member(Channel::Pv),
                wfa_agg_px: g.distances.get(&ChannelPair::WFA_AGG).copied(),
                wfa_pv_px: g.distances.get(&ChannelPair::WFA_PV).copied(),
                agg_pv_px: g.distances.get(&ChannelPair::AGG_PV).copied(),
                mean_px: g.mean_distance(),
                mean_um: threshold.to_microns(g.mean_distance()),
            })
            .collect();
        write_csv(&dir.join("groups.csv"), &header, GROUP_COLUMNS, &groups)?;

        if self.emit_unmatched {
            write_csv(&dir.join("unmatched.csv"), &header, UNMATCHED_COLUMNS, &result.unmatched)?;
        }

        for dist in &result.distances {
            let mut lines = header.clone();
            lines.push(format!(
                "Nearest {} distances from {} ({} detections), unit {}",
                dist.pair,
                dist.pair.first(),
                dist.reference_total,
                dist.unit
            ));
            if let Some(at) = dist.plateau_at {
                lines.push(format!("Plateau reached at {at} {}", dist.unit));
            }
            let path = dir.join(format!("distance_{}.csv", dist.pair.slug()));
            write_csv(&path, &lines, DISTANCE_COLUMNS, &dist.bins)?;
        }

        if let Some(settings) = &self.visualization {
            write_json(&dir.join("overlay.json"), &build_overlay(result, settings))?;
        }
        Ok(())
    }

    /// Run-level tables and the JSON summary.
    pub fn write_run(&self, summary: &RunSummary) -> Result<()> {
        let header = self.header("run", None);

        let sections: Vec<TallyRow> = summary
            .sections
            .iter()
            .flat_map(|s| {
                s.combinations.iter().map(move |(&kind, tally)| {
                    let section = Some(s.key.section.as_str());
                    TallyRow::new(Some(s.key.mouse.as_str()), section, kind, tally)
                })
            })
            .collect();
        write_csv(&self.out_dir.join("sections.csv"), &header, TALLY_COLUMNS, &sections)?;

        let mice: Vec<TallyRow> = summary
            .mice
            .iter()
            .flat_map(|(mouse, agg)| {
                agg.combinations.iter().map(move |(&kind, tally)| {
                    TallyRow::new(Some(mouse.as_str()), None, kind, tally)
                })
            })
            .collect();
        write_csv(&self.out_dir.join("mice.csv"), &header, TALLY_COLUMNS, &mice)?;

        // Run totals get their own file so no mouse name can collide with them.
        let totals: Vec<TallyRow> = summary
            .totals
            .combinations
            .iter()
            .map(|(&kind, tally)| TallyRow::new(None, None, kind, tally))
            .collect();
        write_csv(&self.out_dir.join("totals.csv"), &header, TALLY_COLUMNS, &totals)?;

        let issues: Vec<IssueRow> = summary.issues.iter().map(IssueRow::from).collect();
        write_csv(&self.out_dir.join("issues.csv"), &header, ISSUE_COLUMNS, &issues)?;

        write_json(
            &self.out_dir.join("run_summary.json"),
            &RunReport {
                generated: self.timestamp(),
                unit: self.unit,
                summary,
            },
        )
    }

    fn header(&self, scope: &str, threshold: Option<&ResolvedThreshold>) -> Vec<String> {
        let mut lines = vec![format!("Colocalization results: {scope}")];
        if let Some(t) = threshold {
            let mut line = format!("Threshold: {:.3} px", t.pixels.pixels());
            if let Some(um) = t.microns {
                line.push_str(&format!(" ({um:.3} um)"));
            }
            if let Some(ps) = t.pixel_size {
                line.push_str(&format!(", pixel size {ps} um/px"));
            }
            lines.push(line);
        }
        lines.push(format!("Generated: {}", self.timestamp()));
        lines
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

// Column names are written explicitly so empty tables still get a header.
const GROUP_COLUMNS: &[&str] = &[
    "kind", "wfa_id", "agg_id", "pv_id", "wfa_agg_px", "wfa_pv_px", "agg_pv_px", "mean_px",
    "mean_um",
];
const UNMATCHED_COLUMNS: &[&str] = &["channel", "id", "x", "y"];
const DISTANCE_COLUMNS: &[&str] = &[
    "start", "end", "count", "cumulative", "percent", "cumulative_percent",
];
const TALLY_COLUMNS: &[&str] = &[
    "mouse", "section", "combination", "evaluated", "wfa_total", "agg_total", "pv_total",
    "groups", "pairwise_matches", "percent", "mean_distance_px", "mean_distance_um",
];
const ISSUE_COLUMNS: &[&str] = &["mouse", "section", "kind", "channel", "message"];

#[derive(Debug, Serialize)]
struct GroupRow {
    kind: String,
    wfa_id: Option<usize>,
    agg_id: Option<usize>,
    pv_id: Option<usize>,
    wfa_agg_px: Option<f64>,
    wfa_pv_px: Option<f64>,
    agg_pv_px: Option<f64>,
    mean_px: f64,
    mean_um: Option<f64>,
}

#[derive(Debug, Serialize)]
struct TallyRow {
    mouse: Option<String>,
    section: Option<String>,
    combination: String,
    evaluated: usize,
    wfa_total: Option<usize>,
    agg_total: Option<usize>,
    pv_total: Option<usize>,
    groups: usize,
    pairwise_matches: usize,
    percent: Option<f64>,
    mean_distance_px: Option<f64>,
    mean_distance_um: Option<f64>,
}

impl TallyRow {
    fn new(
        mouse: Option<&str>,
        section: Option<&str>,
        kind: CombinationKind,
        tally: &CombinationTally,
    ) -> Self {
        let total = |c: Channel| tally.channel_totals.get(&c).copied();
        TallyRow {
            mouse: mouse.map(str::to_string),
            section: section.map(str::to_string),
            combination: kind.to_string(),
            evaluated: tally.evaluated,
            wfa_total: total(Channel::Wfa),
            agg_total: total(Channel::Agg),
            pv_total: total(Channel::Pv),
            groups: tally.groups,
            pairwise_matches: tally.pairwise_matches,
            percent: tally.percentage(),
            mean_distance_px: tally.mean_distance_px(),
            mean_distance_um: tally.mean_distance_um(),
        }
    }
}

#[derive(Debug, Serialize)]
struct IssueRow {
    mouse: String,
    section: String,
    kind: &'static str,
    channel: Option<Channel>,
    message: String,
}

impl From<&Issue> for IssueRow {
    fn from(issue: &Issue) -> Self {
        let channel = match issue {
            Issue::MissingSource { channel, .. }
            | Issue::LoadFailed { channel, .. }
            | Issue::MalformedRecords { channel, .. } => Some(*channel),
            Issue::EmptyCombination { .. } | Issue::NoThreshold { .. } => None,
        };
        IssueRow {
            mouse: issue.section().mouse.clone(),
            section: issue.section().section.clone(),
            kind: issue.kind(),
            channel,
            message: issue.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SectionReport<'a> {
    generated: String,
    unit: UnitMode,
    summary: &'a crate::stats::SectionSummary,
    issues: &'a [Issue],
}

#[derive(Serialize)]
struct RunReport<'a> {
    generated: String,
    unit: UnitMode,
    summary: &'a RunSummary,
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

fn write_csv<T: Serialize>(
    path: &Path,
    comments: &[String],
    columns: &[&str],
    rows: &[T],
) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for line in comments {
        writeln!(out, "# {line}").with_context(|| format!("writing {}", path.display()))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(out);
    writer
        .write_record(columns)
        .with_context(|| format!("writing header to {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value)
        .with_context(|| format!("writing {}", path.display()))?;
    out.flush()
        .with_context(|| format!("flushing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::data::model::{ChannelSection, SectionKey};
    use crate::data::source::MemorySource;
    use crate::pipeline::{run, CancelToken};

    fn data_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn writes_section_and_run_files() {
        let key = SectionKey::new("IB60", "CA1");
        let source = MemorySource::new()
            .with(&key, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0), (40.0, 0.0)]))
            .with(&key, ChannelSection::from_points(Channel::Pv, &[(3.0, 4.0)]));
        let config = RunConfig {
            threshold: 5.0,
            combinations: vec!["all".into()],
            emit_unmatched: true,
            visualization: Some(VisualizationSettings::default()),
            ..Default::default()
        }
        .validate()
        .unwrap();
        let out = run(&source, &config, &CancelToken::new());

        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(dir.path(), &config).unwrap();
        for result in &out.results {
            exporter.write_section(result).unwrap();
        }
        exporter.write_run(&out.summary).unwrap();

        let section = dir.path().join("IB60").join("CA1");
        let groups = data_lines(&section.join("groups.csv"));
        assert_eq!(groups[0], GROUP_COLUMNS.join(","));
        assert_eq!(groups[1], "WFA-PV,0,,0,,5.0,,5.0,");

        let header = std::fs::read_to_string(section.join("groups.csv")).unwrap();
        assert!(header.starts_with("# Colocalization results: IB60/CA1"));
        assert!(header.contains("# Threshold: 5.000 px"));

        assert_eq!(data_lines(&section.join("unmatched.csv")), ["channel,id,x,y", "WFA,1,40.0,0.0"]);
        assert!(section.join("overlay.json").exists());
        assert!(section.join("section.json").exists());

        // Agg is missing: one source issue plus three unevaluated kinds.
        assert_eq!(data_lines(&dir.path().join("issues.csv")).len(), 5);
        let mice = data_lines(&dir.path().join("mice.csv"));
        assert!(mice.iter().any(|l| l.starts_with("IB60,,WFA-PV,1,2,,1,1,1,100.0,5.0,")));
        let totals = data_lines(&dir.path().join("totals.csv"));
        assert!(totals.iter().any(|l| l.starts_with(",,WFA-PV,1,2,,1,1,1,100.0,5.0,")));

        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("run_summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["summary"]["cancelled"], false);
        assert_eq!(summary["unit"], "pixels");
    }

    #[test]
    fn mouse_named_all_keeps_its_own_rows() {
        let all = SectionKey::new("ALL", "s1");
        let other = SectionKey::new("IB61", "s1");
        let source = MemorySource::new()
            .with(&all, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0)]))
            .with(&all, ChannelSection::from_points(Channel::Pv, &[(1.0, 0.0)]))
            .with(&other, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0), (9.0, 9.0)]))
            .with(&other, ChannelSection::from_points(Channel::Pv, &[(50.0, 0.0)]));
        let config = RunConfig {
            threshold: 5.0,
            combinations: vec!["WFA-PV".into()],
            ..Default::default()
        }
        .validate()
        .unwrap();
        let out = run(&source, &config, &CancelToken::new());

        let dir = tempfile::tempdir().unwrap();
        Exporter::new(dir.path(), &config)
            .unwrap()
            .write_run(&out.summary)
            .unwrap();

        let mice = data_lines(&dir.path().join("mice.csv"));
        let rows: Vec<&String> = mice.iter().filter(|l| l.starts_with("ALL,")).collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].starts_with("ALL,,WFA-PV,1,1,,1,1,1,100.0,"));

        let totals = data_lines(&dir.path().join("totals.csv"));
        assert_eq!(totals.len(), 2);
        assert!(totals[1].starts_with(",,WFA-PV,2,3,,2,1,1,50.0,"));
    }
}
