//! Spatial colocalization of per-channel detections (WFA, Aggrecan, PV)
//! across the sections of many mice.
//!
//! ```text
//!   DetectionSource ─▶ pipeline::process_section ─▶ SectionResult ─┬─▶ export
//!        (data)          matcher / combiner (coloc)                 ├─▶ overlay
//!                                                                   └─▶ stats::RunSummary
//! ```

pub mod coloc;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod overlay;
pub mod pipeline;
pub mod stats;

pub use config::{RunConfig, ValidatedConfig};
pub use data::model::{Channel, ChannelPair, CombinationKind, Detection, SectionKey};
pub use pipeline::{process_section, run, run_with, CancelToken, RunOutput, SectionResult};
