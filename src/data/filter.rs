use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::model::SectionKey;

// ---------------------------------------------------------------------------
// Section selection: which mice / sections take part in a run
// ---------------------------------------------------------------------------

/// Selected mice and section names. An empty set means "no filter" for that
/// dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionFilter {
    #[serde(default)]
    pub mice: BTreeSet<String>,
    #[serde(default)]
    pub sections: BTreeSet<String>,
}

impl SectionFilter {
    pub fn mice<I, S>(mice: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SectionFilter {
            mice: mice.into_iter().map(Into::into).collect(),
            sections: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mice.is_empty() && self.sections.is_empty()
    }

    /// A section passes when each non-empty dimension contains its value.
    pub fn matches(&self, key: &SectionKey) -> bool {
        (self.mice.is_empty() || self.mice.contains(&key.mouse))
            && (self.sections.is_empty() || self.sections.contains(&key.section))
    }

    /// Keys that pass, in their original order.
    pub fn apply(&self, keys: &[SectionKey]) -> Vec<SectionKey> {
        keys.iter().filter(|k| self.matches(k)).cloned().collect()
    }

    /// Selected mice that do not occur in `keys`, so callers can warn about
    /// typos instead of silently processing nothing.
    pub fn unknown_mice(&self, keys: &[SectionKey]) -> Vec<String> {
        let present: BTreeSet<&str> = keys.iter().map(|k| k.mouse.as_str()).collect();
        self.mice
            .iter()
            .filter(|m| !present.contains(m.as_str()))
            .cloned()
            .collect()
    }
}

/// Group section keys by mouse: mouse → sorted section names.
pub fn sections_by_mouse(keys: &[SectionKey]) -> BTreeMap<String, BTreeSet<String>> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for key in keys {
        out.entry(key.mouse.clone())
            .or_default()
            .insert(key.section.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<SectionKey> {
        vec![
            SectionKey::new("IB60", "IB60_CA1_1L"),
            SectionKey::new("IB60", "IB60_CA1_2R"),
            SectionKey::new("IB61", "IB61_CA1_1L"),
        ]
    }

    #[test]
    fn empty_filter_passes_everything() {
        assert_eq!(SectionFilter::default().apply(&keys()).len(), 3);
    }

    #[test]
    fn mouse_filter() {
        let f = SectionFilter::mice(["IB61", "IB99"]);
        let kept = f.apply(&keys());
        assert_eq!(kept, vec![SectionKey::new("IB61", "IB61_CA1_1L")]);
        assert_eq!(f.unknown_mice(&keys()), vec!["IB99".to_string()]);
    }

    #[test]
    fn both_dimensions_must_match() {
        let f = SectionFilter {
            mice: BTreeSet::from(["IB60".to_string()]),
            sections: BTreeSet::from(["IB61_CA1_1L".to_string(), "IB60_CA1_2R".to_string()]),
        };
        assert_eq!(f.apply(&keys()), vec![SectionKey::new("IB60", "IB60_CA1_2R")]);
    }

    #[test]
    fn grouping() {
        let grouped = sections_by_mouse(&keys());
        assert_eq!(grouped["IB60"].len(), 2);
        assert_eq!(grouped["IB61"].len(), 1);
    }
}
