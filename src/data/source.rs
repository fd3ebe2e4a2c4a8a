use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::loader::{load_detections, LoadedDetections, SUPPORTED_EXTENSIONS};
use super::model::{Channel, ChannelSection, SectionKey};
use crate::error::{LoadError, MalformedRecord};

// ---------------------------------------------------------------------------
// DetectionSource – where per-channel detections come from
// ---------------------------------------------------------------------------

/// A channel's detections for one section, as handed to the matcher.
#[derive(Debug, Clone)]
pub struct LoadedChannel {
    pub section: ChannelSection,
    pub dropped: Vec<MalformedRecord>,
    /// Where the detections were read from, when they came from a file.
    pub origin: Option<PathBuf>,
}

/// Provider of per-channel, per-section detections.
///
/// Implementations must be shareable across worker threads: sections are
/// loaded concurrently.
pub trait DetectionSource: Sync {
    /// All sections this source knows about, sorted.
    fn sections(&self) -> Vec<SectionKey>;

    /// Load one channel of one section. A channel that simply has no data
    /// for the section reports [`LoadError::MissingSource`].
    fn load(&self, key: &SectionKey, channel: Channel) -> Result<LoadedChannel, LoadError>;
}

// ---------------------------------------------------------------------------
// DirectorySource – the upstream folder layout
// ---------------------------------------------------------------------------

/// Reads the layout produced by the detection stage:
///
/// ```text
/// <root>/Mice_WFA/<mouse>/<section>_WFA/localizations_<section>_WFA.csv
/// <root>/Mice_Agg/<mouse>/<section>_Agg/localizations_<section>_Agg.csv
/// <root>/PV_Mice/<mouse>/<section>_PV/localizations_<section>_PV.csv
/// ```
///
/// The section name is the folder name minus its trailing `_<channel>`
/// component. `.json` and `.parquet` localization files are accepted too.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    channel_dirs: BTreeMap<Channel, String>,
    /// (section, channel) → section folder, filled by the initial scan.
    index: BTreeMap<(SectionKey, Channel), PathBuf>,
}

impl DirectorySource {
    /// Scan `root` using the default channel directory names.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_channel_dirs(root, BTreeMap::new())
    }

    /// Scan `root`; `overrides` replaces the directory name of some channels.
    pub fn with_channel_dirs(
        root: impl Into<PathBuf>,
        overrides: BTreeMap<Channel, String>,
    ) -> std::io::Result<Self> {
        let root = root.into();
        let channel_dirs: BTreeMap<Channel, String> = Channel::ALL
            .iter()
            .map(|&c| {
                let dir = overrides
                    .get(&c)
                    .cloned()
                    .unwrap_or_else(|| c.default_dir().to_string());
                (c, dir)
            })
            .collect();

        let mut index = BTreeMap::new();
        for (&channel, dir) in &channel_dirs {
            let channel_root = root.join(dir);
            if !channel_root.is_dir() {
                warn!("{} not found, no {channel} data", channel_root.display());
                continue;
            }
            for mouse_dir in sorted_subdirs(&channel_root)? {
                let Some(mouse) = file_name(&mouse_dir) else { continue };
                for section_dir in sorted_subdirs(&mouse_dir)? {
                    let Some(folder) = file_name(&section_dir) else { continue };
                    let Some(section) = strip_channel_suffix(&folder) else {
                        debug!("skipping folder without channel suffix: {}", section_dir.display());
                        continue;
                    };
                    index.insert(
                        (SectionKey::new(mouse.clone(), section), channel),
                        section_dir,
                    );
                }
            }
        }
        Ok(DirectorySource {
            root,
            channel_dirs,
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_dir(&self, channel: Channel) -> &str {
        self.channel_dirs
            .get(&channel)
            .map(String::as_str)
            .unwrap_or_else(|| channel.default_dir())
    }

    /// Channels with a section folder for `key`.
    pub fn channels_for(&self, key: &SectionKey) -> BTreeSet<Channel> {
        Channel::ALL
            .iter()
            .copied()
            .filter(|&c| self.index.contains_key(&(key.clone(), c)))
            .collect()
    }

    /// The localization file for a section folder, trying each supported
    /// extension in turn.
    fn localization_file(section_dir: &Path) -> Option<PathBuf> {
        let folder = file_name(section_dir)?;
        SUPPORTED_EXTENSIONS
            .iter()
            .map(|ext| section_dir.join(format!("localizations_{folder}.{ext}")))
            .find(|p| p.is_file())
    }
}

impl DetectionSource for DirectorySource {
    fn sections(&self) -> Vec<SectionKey> {
        let keys: BTreeSet<SectionKey> = self.index.keys().map(|(k, _)| k.clone()).collect();
        keys.into_iter().collect()
    }

    fn load(&self, key: &SectionKey, channel: Channel) -> Result<LoadedChannel, LoadError> {
        let missing = || LoadError::MissingSource {
            channel,
            section: key.clone(),
        };
        let section_dir = self.index.get(&(key.clone(), channel)).ok_or_else(missing)?;
        let path = Self::localization_file(section_dir).ok_or_else(missing)?;
        let LoadedDetections {
            detections,
            dropped,
        } = load_detections(&path)?;
        Ok(LoadedChannel {
            section: ChannelSection::new(channel, detections),
            dropped,
            origin: Some(path),
        })
    }
}

/// `IB60_CA1_1L_WFA` → `IB60_CA1_1L`. Folders without an underscore carry
/// no channel suffix and are ignored.
fn strip_channel_suffix(folder: &str) -> Option<String> {
    let (section, suffix) = folder.rsplit_once('_')?;
    if section.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(section.to_string())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
}

fn sorted_subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

// ---------------------------------------------------------------------------
// MemorySource – pre-built collections
// ---------------------------------------------------------------------------

/// Detections held in memory; used by tests and by callers that already
/// have point sets.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: BTreeMap<(SectionKey, Channel), LoadedChannel>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: SectionKey, section: ChannelSection) {
        self.insert_with_drops(key, section, Vec::new());
    }

    pub fn insert_with_drops(
        &mut self,
        key: SectionKey,
        section: ChannelSection,
        dropped: Vec<MalformedRecord>,
    ) {
        let channel = section.channel;
        self.entries.insert(
            (key, channel),
            LoadedChannel {
                section,
                dropped,
                origin: None,
            },
        );
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, key: &SectionKey, section: ChannelSection) -> Self {
        self.insert(key.clone(), section);
        self
    }
}

impl DetectionSource for MemorySource {
    fn sections(&self) -> Vec<SectionKey> {
        let keys: BTreeSet<SectionKey> = self.entries.keys().map(|(k, _)| k.clone()).collect();
        keys.into_iter().collect()
    }

    fn load(&self, key: &SectionKey, channel: Channel) -> Result<LoadedChannel, LoadError> {
        self.entries
            .get(&(key.clone(), channel))
            .cloned()
            .ok_or_else(|| LoadError::MissingSource {
                channel,
                section: key.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_channel_suffix("IB60_CA1_1L_WFA").as_deref(), Some("IB60_CA1_1L"));
        assert_eq!(strip_channel_suffix("plain"), None);
        assert_eq!(strip_channel_suffix("_WFA"), None);
    }

    #[test]
    fn directory_layout_is_indexed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write(
            &root.join("Mice_WFA/IB60/IB60_CA1_1L_WFA/localizations_IB60_CA1_1L_WFA.csv"),
            "X,Y\n1,1\n2,2\n",
        );
        write(
            &root.join("PV_Mice/IB60/IB60_CA1_1L_PV/localizations_IB60_CA1_1L_PV.json"),
            r#"[{"X": 1, "Y": 1}]"#,
        );
        // Agg folder exists but holds no localization file.
        std::fs::create_dir_all(root.join("Mice_Agg/IB60/IB60_CA1_1L_Agg")).unwrap();

        let source = DirectorySource::open(root).unwrap();
        let key = SectionKey::new("IB60", "IB60_CA1_1L");
        assert_eq!(source.sections(), vec![key.clone()]);
        assert_eq!(source.channels_for(&key).len(), 3);

        let wfa = source.load(&key, Channel::Wfa).unwrap();
        assert_eq!(wfa.section.len(), 2);
        assert!(wfa.origin.unwrap().ends_with("localizations_IB60_CA1_1L_WFA.csv"));

        let pv = source.load(&key, Channel::Pv).unwrap();
        assert_eq!(pv.section.len(), 1);

        assert!(matches!(
            source.load(&key, Channel::Agg),
            Err(LoadError::MissingSource { channel: Channel::Agg, .. })
        ));
    }

    #[test]
    fn custom_channel_dir() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            &tmp.path().join("aggrecan/M1/S1_Agg/localizations_S1_Agg.csv"),
            "X,Y\n0,0\n",
        );
        let overrides = BTreeMap::from([(Channel::Agg, "aggrecan".to_string())]);
        let source = DirectorySource::with_channel_dirs(tmp.path(), overrides).unwrap();
        let key = SectionKey::new("M1", "S1");
        assert_eq!(source.sections(), vec![key.clone()]);
        assert_eq!(source.load(&key, Channel::Agg).unwrap().section.len(), 1);
        assert_eq!(source.channel_dir(Channel::Agg), "aggrecan");
    }

    #[test]
    fn memory_source_reports_missing() {
        let key = SectionKey::new("m", "s");
        let source =
            MemorySource::new().with(&key, ChannelSection::from_points(Channel::Wfa, &[(0.0, 0.0)]));
        assert!(source.load(&key, Channel::Wfa).is_ok());
        assert!(matches!(
            source.load(&key, Channel::Pv),
            Err(LoadError::MissingSource { .. })
        ));
    }
}
