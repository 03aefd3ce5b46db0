use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

/// Labels reserved for well-known identities (`host`, `world`, ...).
pub const SOURCE_RESERVED: &str = "reserved";

/// Labels attached to identities allocated for DNS resolution results.
pub const SOURCE_FQDN: &str = "fqdn";

/// Labels parsed without an explicit source.
pub const SOURCE_UNSPEC: &str = "unspec";

/// Selector-only source that matches a key under any source.
pub const SOURCE_ANY: &str = "any";

/// The label key carrying a workload's namespace.
pub const NAMESPACE_LABEL: &str = "k8s:io.kubernetes.pod.namespace";

/// An immutable set of `source:key` labels.
#[derive(Clone, Debug, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default)]
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of identities by their labels.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid label: {0:?}")]
pub struct InvalidLabel(String);

/// Splits a `source:key` label key. Keys without a source are `unspec`.
pub fn split_source(key: &str) -> (&str, &str) {
    key.split_once(':').unwrap_or((SOURCE_UNSPEC, key))
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    /// A selector that never matches any label set.
    pub fn none() -> Self {
        Self::from_expressions(vec![Expression::new(
            format!("{SOURCE_RESERVED}:none"),
            Operator::In,
            std::iter::empty::<String>(),
        )])
    }

    /// Returns true when the selector places no requirements on labels.
    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().map_or(true, Map::is_empty)
            && self.match_expressions.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.get(k) != Some(v.as_str()) {
                    return false;
                }
            }
        }

        true
    }

    /// Every requirement of the selector in a canonical order. Exact label matches are
    /// expressed as single-valued `In` requirements.
    fn requirements(&self) -> BTreeSet<Expression> {
        let labels = self
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| Expression::new(k.clone(), Operator::In, Some(v.clone())));
        self.match_expressions
            .iter()
            .flatten()
            .cloned()
            .chain(labels)
            .collect()
    }
}

/// Renders the selector canonically: two selectors with the same requirements render
/// identically, regardless of how they were constructed.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, expr) in self.requirements().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            expr.fmt(f)?;
        }
        f.write_str("}")
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl Labels {
    /// Gets the value of a `source:key` label. An `any:` source matches the key under
    /// every source.
    pub fn get(&self, key: &str) -> Option<&str> {
        let any = key
            .split_once(':')
            .filter(|(source, _)| *source == SOURCE_ANY)
            .map(|(_, bare)| bare);
        match any {
            Some(bare) => self
                .0
                .iter()
                .find(|(k, _)| split_source(k).1 == bare)
                .map(|(_, v)| v.as_str()),
            None => self.0.get(key).map(String::as_str),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns true if any label in `other` is also in this set with the same value.
    pub fn intersects(&self, other: &Labels) -> bool {
        other
            .0
            .iter()
            .any(|(k, v)| self.0.get(k).map_or(false, |mine| mine == v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Parses a comma-separated list of `source:key=value` labels. The value may be omitted.
impl FromStr for Labels {
    type Err = InvalidLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                let (key, value) = l.split_once('=').unwrap_or((l, ""));
                if key.is_empty() {
                    return Err(InvalidLabel(l.to_string()));
                }
                let (source, key) = split_source(key);
                if source.is_empty() || key.is_empty() {
                    return Err(InvalidLabel(l.to_string()));
                }
                Ok((format!("{source}:{key}"), value.to_string()))
            })
            .collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if v.is_empty() {
                f.write_str(k)?;
            } else {
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

// === Expression ===

impl Expression {
    pub fn new<V: Into<String>>(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, labels: &Labels) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

/// Values are always quoted, and keys are quoted unless they consist only of characters
/// that cannot be confused with the surrounding syntax, so distinct requirements never
/// render identically.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.operator {
            Operator::In => "in",
            Operator::NotIn => "notin",
            Operator::Exists => return write_key(f, &self.key),
            Operator::DoesNotExist => {
                f.write_str("!")?;
                return write_key(f, &self.key);
            }
        };
        write_key(f, &self.key)?;
        write!(f, " {op} (")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v:?}")?;
        }
        f.write_str(")")
    }
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &str) -> fmt::Result {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '-' | '_' | '/'));
    if bare {
        f.write_str(key)
    } else {
        write!(f, "{key:?}")
    }
}
