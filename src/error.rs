//! Typed errors and the non-fatal issue log.
//!
//! Configuration errors abort a run before any section is touched. Everything
//! that goes wrong inside a section is recorded as an [`Issue`] instead, so
//! the final summary can enumerate every skipped or partial section.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::data::model::{Channel, CombinationKind, SectionKey};

/// Fatal configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid threshold {value}: {reason}")]
    Threshold { value: f64, reason: &'static str },

    #[error("invalid pixel size {value} for {scope}: must be a positive number")]
    PixelSize { scope: String, value: f64 },

    #[error("invalid distance report range {0}: must be a positive number of at most {max} bins", max = crate::coloc::distribution::MAX_DISTANCE_BINS)]
    DistanceRange(f64),

    #[error("invalid worker count 0")]
    Workers,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unknown channel combination: {0}")]
    UnknownCombination(String),

    #[error("no channel combination requested")]
    EmptyRequest,

    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to produce a channel's detections for one section.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no {channel} localization source for {section}")]
    MissingSource { channel: Channel, section: SectionKey },

    #[error("{path}: missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("{path}: unsupported file extension")]
    UnsupportedFormat { path: PathBuf },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("{path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("{path}: expected a top-level array of records")]
    NotRecords { path: PathBuf },
}

/// A row that could not be turned into a [`Detection`](crate::data::model::Detection).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MalformedRecord {
    pub row: usize,
    pub reason: String,
}

/// Something non-fatal that happened while processing a section.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    MissingSource {
        section: SectionKey,
        channel: Channel,
    },
    LoadFailed {
        section: SectionKey,
        channel: Channel,
        reason: String,
    },
    MalformedRecords {
        section: SectionKey,
        channel: Channel,
        dropped: usize,
        first_rows: Vec<usize>,
    },
    EmptyCombination {
        section: SectionKey,
        combination: CombinationKind,
        missing: Vec<Channel>,
    },
    NoThreshold {
        section: SectionKey,
    },
}

impl Issue {
    pub fn section(&self) -> &SectionKey {
        match self {
            Issue::MissingSource { section, .. }
            | Issue::LoadFailed { section, .. }
            | Issue::MalformedRecords { section, .. }
            | Issue::EmptyCombination { section, .. }
            | Issue::NoThreshold { section } => section,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Issue::MissingSource { .. } => "missing_source",
            Issue::LoadFailed { .. } => "load_failed",
            Issue::MalformedRecords { .. } => "malformed_records",
            Issue::EmptyCombination { .. } => "empty_combination",
            Issue::NoThreshold { .. } => "no_threshold",
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::MissingSource { channel, .. } => write!(f, "{channel} source missing"),
            Issue::LoadFailed { channel, reason, .. } => {
                write!(f, "{channel} failed to load: {reason}")
            }
            Issue::MalformedRecords {
                channel,
                dropped,
                first_rows,
                ..
            } => {
                let rows: Vec<String> = first_rows.iter().map(|r| r.to_string()).collect();
                write!(
                    f,
                    "{channel}: dropped {dropped} malformed rows (first: {})",
                    rows.join(", ")
                )
            }
            Issue::EmptyCombination {
                combination,
                missing,
                ..
            } => {
                let names: Vec<&str> = missing.iter().map(|c| c.name()).collect();
                write!(f, "{combination} not evaluated, missing {}", names.join(", "))
            }
            Issue::NoThreshold { .. } => {
                write!(f, "no pixel size and no pixel fallback threshold, section skipped")
            }
        }
    }
}
