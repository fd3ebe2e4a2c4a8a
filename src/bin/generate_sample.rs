use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::Float64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Parser;
use parquet::arrow::ArrowWriter;
use serde::Serialize;

use pnn_coloc::Channel;

/// Write a synthetic detection tree in the upstream folder layout.
#[derive(Parser)]
#[command(name = "generate_sample")]
struct Args {
    /// Root of the tree to create.
    #[arg(long, default_value = "sample_tree")]
    out: PathBuf,
    #[arg(long, default_value_t = 2)]
    mice: usize,
    #[arg(long, default_value_t = 3)]
    sections: usize,
    /// Cells per section.
    #[arg(long, default_value_t = 200)]
    cells: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Image side in pixels.
const FIELD: f64 = 2048.0;
/// Half-width of the bounding boxes written to the CSV files.
const BOX_HALF: f64 = 17.0;

/// Chance that a cell is visible in each channel.
const VISIBILITY: [(Channel, f64); 3] = [(Channel::Wfa, 0.8), (Channel::Agg, 0.6), (Channel::Pv, 0.5)];

#[derive(Serialize)]
struct CsvRow {
    x: f64,
    y: f64,
    score: f64,
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// Detections of every channel for one section: shared cells seen with
/// per-channel jitter, plus channel-specific background.
fn generate_section(rng: &mut SimpleRng, cells: usize) -> Vec<(Channel, Vec<(f64, f64, f64)>)> {
    let centres: Vec<(f64, f64)> = (0..cells)
        .map(|_| (rng.next_f64() * FIELD, rng.next_f64() * FIELD))
        .collect();

    VISIBILITY
        .iter()
        .map(|&(channel, p)| {
            let mut points = Vec::new();
            for &(cx, cy) in &centres {
                if rng.next_f64() < p {
                    let x = (cx + rng.gauss(0.0, 2.0)).clamp(0.0, FIELD);
                    let y = (cy + rng.gauss(0.0, 2.0)).clamp(0.0, FIELD);
                    points.push((x, y, 0.5 + rng.next_f64() * 0.5));
                }
            }
            for _ in 0..cells / 10 {
                points.push((rng.next_f64() * FIELD, rng.next_f64() * FIELD, rng.next_f64() * 0.5));
            }
            (channel, points)
        })
        .collect()
}

fn write_csv(path: &Path, points: &[(f64, f64, f64)]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for &(x, y, score) in points {
        writer.serialize(CsvRow {
            x,
            y,
            score,
            xmin: x - BOX_HALF,
            ymin: y - BOX_HALF,
            xmax: x + BOX_HALF,
            ymax: y + BOX_HALF,
        })?;
    }
    writer.flush()?;
    Ok(())
}

fn write_parquet(path: &Path, points: &[(f64, f64, f64)]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("x", DataType::Float64, false),
        Field::new("y", DataType::Float64, false),
        Field::new("score", DataType::Float64, false),
    ]));
    let column = |f: fn(&(f64, f64, f64)) -> f64| Float64Array::from(points.iter().map(f).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(column(|p| p.0)),
            Arc::new(column(|p| p.1)),
            Arc::new(column(|p| p.2)),
        ],
    )
    .context("building record batch")?;

    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut rng = SimpleRng::new(args.seed);

    let mut files = 0usize;
    for m in 0..args.mice {
        let mouse = format!("IB{}", 60 + m);
        for s in 0..args.sections {
            let section = format!("{mouse}_CA1_{}", s + 1);
            for (channel, points) in generate_section(&mut rng, args.cells) {
                // The last section of the last mouse has no Agg channel.
                if channel == Channel::Agg && m + 1 == args.mice && s + 1 == args.sections {
                    continue;
                }
                let folder = format!("{section}_{}", channel.name());
                let dir = args.out.join(channel.default_dir()).join(&mouse).join(&folder);
                std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
                match channel {
                    Channel::Agg => {
                        write_parquet(&dir.join(format!("localizations_{folder}.parquet")), &points)?
                    }
                    _ => write_csv(&dir.join(format!("localizations_{folder}.csv")), &points)?,
                }
                files += 1;
            }
        }
    }

    println!(
        "Wrote {files} localization files for {} mice × {} sections to {}",
        args.mice,
        args.sections,
        args.out.display()
    );
    Ok(())
}
