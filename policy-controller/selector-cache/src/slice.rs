use crate::selector::CachedSelector;
use serde::{ser::SerializeSeq, Serialize, Serializer};

/// The selectors of a policy rule.
///
/// Holds shared handles, at most one per key. Serializes as the list of selector keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedSelectorSlice(Vec<CachedSelector>);

// === impl CachedSelectorSlice ===

impl CachedSelectorSlice {
    /// Appends a selector, returning false if a selector with the same key is already
    /// present.
    pub fn push(&mut self, selector: CachedSelector) -> bool {
        if self.contains(&selector) {
            return false;
        }
        self.0.push(selector);
        true
    }

    pub fn contains(&self, selector: &CachedSelector) -> bool {
        self.0.iter().any(|s| s == selector)
    }

    /// Orders the selectors by key.
    pub fn sort(&mut self) {
        self.0.sort();
    }

    /// Returns true if the wildcard selector is present.
    pub fn selects_all_endpoints(&self) -> bool {
        self.0.iter().any(CachedSelector::is_wildcard)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CachedSelector> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl std::iter::FromIterator<CachedSelector> for CachedSelectorSlice {
    fn from_iter<T: IntoIterator<Item = CachedSelector>>(iter: T) -> Self {
        let mut slice = Self::default();
        for sel in iter {
            slice.push(sel);
        }
        slice
    }
}

impl<'s> IntoIterator for &'s CachedSelectorSlice {
    type Item = &'s CachedSelector;
    type IntoIter = std::slice::Iter<'s, CachedSelector>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for CachedSelectorSlice {
    type Item = CachedSelector;
    type IntoIter = std::vec::IntoIter<CachedSelector>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for CachedSelectorSlice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for sel in &self.0 {
            seq.serialize_element(sel)?;
        }
        seq.end()
    }
}
