use crate::labels::{Labels, SOURCE_FQDN};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Selects identities allocated for DNS names, either by exact name or by pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FqdnSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
}

/// The name-resolution subsystem's interest registry.
///
/// The selector cache calls back into the notifier while holding its write lock, so
/// implementations must not call into the cache synchronously.
pub trait IdentityNotifier: Send + Sync {
    /// Unregisters interest in the names matched by `selector`. Called exactly once when
    /// the last user of the selector releases it.
    fn unregister_fqdn_selector(&self, selector: &FqdnSelector);
}

// === impl FqdnSelector ===

impl FqdnSelector {
    pub fn name(name: impl AsRef<str>) -> Self {
        Self {
            match_name: Some(name.as_ref().to_ascii_lowercase()),
            match_pattern: None,
        }
    }

    pub fn pattern(pattern: impl AsRef<str>) -> Self {
        Self {
            match_name: None,
            match_pattern: Some(pattern.as_ref().to_ascii_lowercase()),
        }
    }

    /// The label carried by every identity allocated for a name this selector matches.
    pub fn identity_label(&self) -> Labels {
        let (name, pattern) = self.normalized();
        let name = name.or(pattern).unwrap_or_default();
        Some((format!("{SOURCE_FQDN}:{name}"), String::new()))
            .into_iter()
            .collect()
    }

    /// The lower-cased name and pattern. A name takes precedence, so the pattern is
    /// dropped when both are set.
    fn normalized(&self) -> (Option<String>, Option<String>) {
        match (self.match_name.as_deref(), self.match_pattern.as_deref()) {
            (Some(name), _) => (Some(name.to_ascii_lowercase()), None),
            (None, pattern) => (None, pattern.map(str::to_ascii_lowercase)),
        }
    }
}

/// Renders the normalized selector, so selectors that match the same identities render
/// identically.
impl fmt::Display for FqdnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, pattern) = self.normalized();
        write!(
            f,
            "matchName: {}, matchPattern: {}",
            name.unwrap_or_default(),
            pattern.unwrap_or_default(),
        )
    }
}
