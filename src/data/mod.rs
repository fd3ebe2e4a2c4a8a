/// Data layer: core types, loading, and section selection.
///
/// Architecture:
/// ```text
///  localizations_<section>_<channel>.csv / .json / .parquet
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → Vec<Detection> + dropped rows
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  source   │  (section, channel) → ChannelSection
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  mouse / section selection → SectionKeys to run
///   └──────────┘
/// ```

pub mod filter;
pub mod loader;
pub mod model;
pub mod source;
