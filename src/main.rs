use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use pnn_coloc::coloc::{match_detections, Threshold};
use pnn_coloc::config::{PixelSizeTable, RunConfig, UnitMode};
use pnn_coloc::data::filter::{sections_by_mouse, SectionFilter};
use pnn_coloc::data::loader::load_detections;
use pnn_coloc::data::source::{DetectionSource, DirectorySource};
use pnn_coloc::export::Exporter;
use pnn_coloc::{run_with, CancelToken, Channel};

#[derive(Parser)]
#[command(name = "pnn-coloc", version, about = "Colocalize PNN / PV detections across channels")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Colocalize every section under a detection tree.
    Run(RunArgs),
    /// List mice, sections and the channels present for each.
    Discover {
        #[arg(long)]
        root: PathBuf,
    },
    /// Match two localization files and print the result as JSON.
    Match {
        #[arg(long)]
        a: PathBuf,
        #[arg(long)]
        b: PathBuf,
        /// Radius in pixels.
        #[arg(long)]
        threshold: f64,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    root: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// JSON run configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    threshold: Option<f64>,
    /// WFA-PV, WFA-Agg, Agg-PV or all. Repeatable.
    #[arg(long = "combination")]
    combinations: Vec<String>,
    /// Interpret the threshold in µm.
    #[arg(long)]
    microns: bool,
    /// µm per pixel for every section.
    #[arg(long)]
    pixel_size: Option<f64>,
    #[arg(long)]
    emit_unmatched: bool,
    /// Only process these mice. Repeatable.
    #[arg(long = "mouse")]
    mice: Vec<String>,
    #[arg(long)]
    workers: Option<usize>,
}

impl RunArgs {
    fn into_config(self) -> Result<(PathBuf, PathBuf, RunConfig)> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(t) = self.threshold {
            config.threshold = t;
        }
        if !self.combinations.is_empty() {
            config.combinations = self.combinations;
        }
        if self.microns {
            config.unit = UnitMode::Microns;
        }
        if let Some(ps) = self.pixel_size {
            config.pixel_sizes = PixelSizeTable {
                default: Some(ps),
                ..config.pixel_sizes
            };
        }
        if self.emit_unmatched {
            config.emit_unmatched = true;
        }
        if !self.mice.is_empty() {
            config.selection = SectionFilter {
                mice: self.mice.into_iter().collect(),
                ..config.selection
            };
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        Ok((self.root, self.out, config))
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Run(args) => run_command(args),
        Commands::Discover { root } => discover(root),
        Commands::Match { a, b, threshold } => match_files(a, b, threshold),
    }
}

fn run_command(args: RunArgs) -> Result<()> {
    let (root, out, config) = args.into_config()?;
    let validated = config.validate()?;

    let source = DirectorySource::with_channel_dirs(&root, config.channel_dirs.clone())
        .with_context(|| format!("scanning {}", root.display()))?;
    let exporter = Exporter::new(&out, &validated)?;

    let summary = run_with(&source, &validated, &CancelToken::new(), |result| {
        exporter.write_section(&result)
    })?;
    exporter.write_run(&summary)?;

    let partial = summary.partial_sections().count();
    info!(
        "{} sections processed, {} partial, {} issues, results in {}",
        summary.sections.len(),
        partial,
        summary.issues.len(),
        exporter.out_dir().display()
    );
    for issue in &summary.issues {
        warn!("{}: {issue}", issue.section());
    }
    Ok(())
}

fn discover(root: PathBuf) -> Result<()> {
    let source =
        DirectorySource::open(&root).with_context(|| format!("scanning {}", root.display()))?;
    let keys = source.sections();
    if keys.is_empty() {
        bail!("no sections found under {}", root.display());
    }

    for (mouse, sections) in sections_by_mouse(&keys) {
        println!("{mouse}");
        for section in sections {
            let key = pnn_coloc::SectionKey::new(mouse.clone(), section);
            let present = source.channels_for(&key);
            let names: Vec<&str> = Channel::ALL
                .iter()
                .map(|c| if present.contains(c) { c.name() } else { "-" })
                .collect();
            println!("  {:<40} {}", key.section, names.join(" "));
            if present.len() < Channel::ALL.len() {
                warn!("{key}: only {} of {} channels present", present.len(), Channel::ALL.len());
            }
        }
    }
    Ok(())
}

fn match_files(a: PathBuf, b: PathBuf, threshold: f64) -> Result<()> {
    let threshold = Threshold::new(threshold)?;
    let left = load_detections(&a).with_context(|| format!("loading {}", a.display()))?;
    let right = load_detections(&b).with_context(|| format!("loading {}", b.display()))?;
    for (path, loaded) in [(&a, &left), (&b, &right)] {
        if !loaded.dropped.is_empty() {
            warn!("{}: dropped {} malformed rows", path.display(), loaded.dropped.len());
        }
    }

    let result = match_detections(&left.detections, &right.detections, threshold);
    let stdout = std::io::stdout();
    serde_json::to_writer_pretty(stdout.lock(), &result).context("writing JSON")?;
    println!();
    Ok(())
}
