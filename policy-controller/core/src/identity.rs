use crate::labels::{Labels, NAMESPACE_LABEL};
use serde::{Deserialize, Serialize};
use std::{fmt, num::ParseIntError, str::FromStr};

/// A compact numeric stand-in for a set of security-relevant labels.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NumericIdentity(pub u32);

/// Describes a single numeric identity as seen by the selector cache.
///
/// Snapshots are immutable; the identity allocator publishes a new snapshot rather than
/// modifying one in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: NumericIdentity,
    pub labels: Labels,

    /// The workload namespace, or empty for identities outside of any namespace (e.g.
    /// CIDR or FQDN identities).
    #[serde(default)]
    pub namespace: String,
}

// === impl NumericIdentity ===

impl From<u32> for NumericIdentity {
    #[inline]
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NumericIdentity {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

// === impl Identity ===

impl Identity {
    /// Builds an identity snapshot, taking its namespace from the namespace label.
    pub fn new(id: impl Into<NumericIdentity>, labels: Labels) -> Self {
        let namespace = labels.get(NAMESPACE_LABEL).unwrap_or_default().to_string();
        Self {
            id: id.into(),
            labels,
            namespace,
        }
    }

    pub fn with_namespace(
        id: impl Into<NumericIdentity>,
        labels: Labels,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            labels,
            namespace: namespace.into(),
        }
    }
}
