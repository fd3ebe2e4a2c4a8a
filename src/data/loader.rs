use std::path::Path;

use arrow::array::{Array, Float64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use log::debug;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Map, Value as JsonValue};

use super::model::{BoundingBox, Detection};
use crate::error::{LoadError, MalformedRecord};

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Detections parsed from one localization file, plus the rows that had to
/// be dropped.
#[derive(Debug, Clone, Default)]
pub struct LoadedDetections {
    pub detections: Vec<Detection>,
    pub dropped: Vec<MalformedRecord>,
}

/// File extensions the loader understands, in lookup preference order.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["csv", "json", "parquet", "pq"];

/// Load detections from a localization file.  Dispatch by extension.
///
/// Supported formats:
/// * `.csv`     – header row with `X`, `Y` and optional `score` /
///   bounding-box columns
/// * `.json`    – `[{ "X": .., "Y": .., "score": .. }, ...]`
/// * `.parquet` – numeric columns with the same names
///
/// Column names are matched case-insensitively. The detection id comes
/// from an `id` column when the file has one. Otherwise it is the row's
/// line number in the tabular file, counting the header as line 1, so the
/// first data row is id 2 and malformed rows leave gaps. Dropped rows are
/// reported with the same line numbers.
pub fn load_detections(path: &Path) -> Result<LoadedDetections, LoadError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let loaded = match ext.as_str() {
        "csv" => load_csv(path)?,
        "json" => load_json(path)?,
        "parquet" | "pq" => load_parquet(path)?,
        _ => {
            return Err(LoadError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
        }
    };
    debug!(
        "{}: {} detections, {} dropped",
        path.display(),
        loaded.detections.len(),
        loaded.dropped.len()
    );
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// Column resolution shared by all formats
// ---------------------------------------------------------------------------

/// Line number of the first data row; the header is line 1.
pub const FIRST_DATA_ROW: usize = 2;

/// Largest id taken verbatim from an `id` column (exact in `f64`).
const MAX_EXPLICIT_ID: f64 = 9_007_199_254_740_992.0;

const BBOX_NAMES: [[&str; 4]; 2] = [["xmin", "ymin", "xmax", "ymax"], ["x1", "y1", "x2", "y2"]];

/// Positions of the known columns within a header.
#[derive(Debug, Clone)]
struct Columns {
    id: Option<usize>,
    x: usize,
    y: usize,
    score: Option<usize>,
    bbox: Option<[usize; 4]>,
}

impl Columns {
    fn resolve(names: &[String], path: &Path) -> Result<Self, LoadError> {
        let find = |wanted: &str| names.iter().position(|n| n.trim().eq_ignore_ascii_case(wanted));
        let x = find("x").ok_or_else(|| LoadError::MissingColumn {
            path: path.to_path_buf(),
            column: "X",
        })?;
        let y = find("y").ok_or_else(|| LoadError::MissingColumn {
            path: path.to_path_buf(),
            column: "Y",
        })?;
        let bbox = BBOX_NAMES.iter().find_map(|set| {
            let idx: Vec<usize> = set.iter().filter_map(|n| find(*n)).collect();
            <[usize; 4]>::try_from(idx).ok()
        });
        Ok(Columns {
            id: find("id"),
            x,
            y,
            score: find("score"),
            bbox,
        })
    }
}

/// Turn the parsed fields of one row into a detection. Only the
/// coordinates are required; unusable score / box values are ignored.
fn assemble(
    row: usize,
    id: Option<Result<f64, String>>,
    x: Result<f64, String>,
    y: Result<f64, String>,
    score: Option<f64>,
    bbox: Option<[f64; 4]>,
) -> Result<Detection, MalformedRecord> {
    let malformed = |reason: String| MalformedRecord { row, reason };
    let id = match id {
        None => row,
        Some(raw) => explicit_id(raw).map_err(|e| malformed(format!("id: {e}")))?,
    };
    let x = x.map_err(|e| malformed(format!("X: {e}")))?;
    let y = y.map_err(|e| malformed(format!("Y: {e}")))?;
    if !x.is_finite() || !y.is_finite() {
        return Err(malformed(format!("non-finite coordinate ({x}, {y})")));
    }
    let bbox = bbox
        .filter(|b| b.iter().all(|v| v.is_finite()))
        .map(|[x_min, y_min, x_max, y_max]| BoundingBox {
            x_min,
            y_min,
            x_max,
            y_max,
        });
    Ok(Detection {
        id,
        x,
        y,
        bbox,
        score: score.filter(|s| s.is_finite()),
    })
}

fn explicit_id(raw: Result<f64, String>) -> Result<usize, String> {
    let v = raw?;
    if v.fract() != 0.0 || !(0.0..=MAX_EXPLICIT_ID).contains(&v) {
        return Err(format!("{v} is not a non-negative integer"));
    }
    Ok(v as usize)
}

fn push_row(out: &mut LoadedDetections, parsed: Result<Detection, MalformedRecord>) {
    match parsed {
        Ok(d) => out.detections.push(d),
        Err(m) => out.dropped.push(m),
    }
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout: header row with column names, one detection per row, e.g.
/// `Y,X,score` as written by the upstream PNN counter.
fn load_csv(path: &Path) -> Result<LoadedDetections, LoadError> {
    let csv_err = |source| LoadError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| match e.kind() {
            csv::ErrorKind::Io(io) => LoadError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(io.kind(), io.to_string()),
            },
            _ => csv_err(e),
        })?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let cols = Columns::resolve(&headers, path)?;

    let mut out = LoadedDetections::default();
    for (index, result) in reader.records().enumerate() {
        let row = index + FIRST_DATA_ROW;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                out.dropped.push(MalformedRecord {
                    row,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let field = |idx: usize| parse_field(record.get(idx));
        let score = cols.score.and_then(|i| field(i).ok());
        let bbox = cols.bbox.and_then(|idx| {
            let vals: Option<Vec<f64>> = idx.iter().map(|&i| field(i).ok()).collect();
            vals.and_then(|v| <[f64; 4]>::try_from(v).ok())
        });
        let id = cols.id.map(field);
        push_row(&mut out, assemble(row, id, field(cols.x), field(cols.y), score, bbox));
    }
    Ok(out)
}

fn parse_field(raw: Option<&str>) -> Result<f64, String> {
    match raw {
        None => Err("missing value".to_string()),
        Some(s) if s.is_empty() => Err("empty value".to_string()),
        Some(s) => s.parse::<f64>().map_err(|_| format!("'{s}' is not a number")),
    }
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, `df.to_json(orient='records')`):
///
/// ```json
/// [
///   { "X": 812.5, "Y": 100.0, "score": 0.93 },
///   ...
/// ]
/// ```
fn load_json(path: &Path) -> Result<LoadedDetections, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let root: JsonValue = serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let records = root.as_array().ok_or_else(|| LoadError::NotRecords {
        path: path.to_path_buf(),
    })?;

    // Column presence is decided from the union of keys, so a file whose
    // records never carry X fails as a whole rather than row by row.
    let mut names: Vec<String> = Vec::new();
    for rec in records {
        if let Some(obj) = rec.as_object() {
            for key in obj.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }
    }
    let cols = Columns::resolve(&names, path)?;

    let mut out = LoadedDetections::default();
    for (index, rec) in records.iter().enumerate() {
        let row = index + FIRST_DATA_ROW;
        let Some(obj) = rec.as_object() else {
            out.dropped.push(MalformedRecord {
                row,
                reason: "not a JSON object".to_string(),
            });
            continue;
        };
        let field = |idx: usize| json_number(obj, &names[idx]);
        let score = cols.score.and_then(|i| field(i).ok());
        let bbox = cols.bbox.and_then(|idx| {
            let vals: Option<Vec<f64>> = idx.iter().map(|&i| field(i).ok()).collect();
            vals.and_then(|v| <[f64; 4]>::try_from(v).ok())
        });
        let id = cols.id.map(field);
        push_row(&mut out, assemble(row, id, field(cols.x), field(cols.y), score, bbox));
    }
    Ok(out)
}

fn json_number(obj: &Map<String, JsonValue>, key: &str) -> Result<f64, String> {
    match obj.get(key) {
        None | Some(JsonValue::Null) => Err("missing value".to_string()),
        Some(JsonValue::Number(n)) => n.as_f64().ok_or_else(|| format!("'{n}' out of range")),
        Some(JsonValue::String(s)) => parse_field(Some(s.trim())),
        Some(other) => Err(format!("'{other}' is not a number")),
    }
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file of detections.
///
/// Any integer or float column type is accepted for the coordinate, score
/// and box columns; values are cast to `f64`. Nulls in `X` / `Y` make the
/// row malformed.
fn load_parquet(path: &Path) -> Result<LoadedDetections, LoadError> {
    let parquet_err = |source| LoadError::Parquet {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;
    let names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let cols = Columns::resolve(&names, path)?;
    let reader = builder.build().map_err(parquet_err)?;

    let mut out = LoadedDetections::default();
    // Row numbers continue across record batches.
    let mut offset = FIRST_DATA_ROW;

    for batch_result in reader {
        let batch = batch_result.map_err(|source| LoadError::Arrow {
            path: path.to_path_buf(),
            source,
        })?;
        let as_f64 = |idx: usize| -> Result<Float64Array, LoadError> {
            let casted = cast(batch.column(idx), &DataType::Float64).map_err(|source| {
                LoadError::Arrow {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            Ok(casted
                .as_any()
                .downcast_ref::<Float64Array>()
                .cloned()
                .unwrap_or_else(|| Float64Array::new_null(casted.len())))
        };
        let x_col = as_f64(cols.x)?;
        let y_col = as_f64(cols.y)?;
        let id_col = cols.id.map(|i| as_f64(i)).transpose()?;
        let score_col = cols.score.map(|i| as_f64(i)).transpose()?;
        let bbox_cols = match cols.bbox {
            Some(idx) => Some(
                idx.iter()
                    .map(|&i| as_f64(i))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        for r in 0..batch.num_rows() {
            let value = |arr: &Float64Array| -> Result<f64, String> {
                if arr.is_null(r) {
                    Err("null value".to_string())
                } else {
                    Ok(arr.value(r))
                }
            };
            let score = score_col.as_ref().and_then(|a| value(a).ok());
            let bbox = bbox_cols.as_ref().and_then(|cols| {
                let vals: Option<Vec<f64>> = cols.iter().map(|a| value(a).ok()).collect();
                vals.and_then(|v| <[f64; 4]>::try_from(v).ok())
            });
            push_row(
                &mut out,
                assemble(
                    offset + r,
                    id_col.as_ref().map(value),
                    value(&x_col),
                    value(&y_col),
                    score,
                    bbox,
                ),
            );
        }
        offset += batch.num_rows();
    }
    Ok(out)
}
