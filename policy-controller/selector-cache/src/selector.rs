use crate::{
    user::Subscriber,
    versioned::{self, Tx, Value, VersionHandle},
};
use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use policy_selector_core::{
    FqdnSelector, Identity, IdentityNotifier, Labels, NumericIdentity, Selector,
};
use serde::{Serialize, Serializer};
use std::{backtrace::Backtrace, cmp::Ordering, fmt, hash, sync::Arc};
use tracing::error;

/// The key of the selector that selects every identity.
pub const WILDCARD_SELECTOR_KEY: &str = "{}";

/// The key of the selector that never selects any identity.
pub const NONE_SELECTOR_KEY: &str = "{reserved:none in ()}";

/// Identities selected at some version, in ascending order. Shared by every reader, so it
/// is never modified.
pub type Selections = Arc<Vec<NumericIdentity>>;

/// A handle to a selector owned by the selector cache.
///
/// Handles are cheap to clone. Two handles are equal when they have the same key, so a
/// handle may be used as a map key and compared across serialization boundaries.
#[derive(Clone)]
pub struct CachedSelector(Arc<IdentitySelector>);

struct IdentitySelector {
    key: String,
    source: SelectorSource,
    selections: Value<Vec<NumericIdentity>>,
    metadata_labels: Labels,

    /// Only modified while the cache's write lock is held.
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    users: HashSet<Subscriber>,
    cached: HashSet<NumericIdentity>,
}

/// How a selector decides whether it selects an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SelectorSource {
    Label(LabelSelector),
    Fqdn(FqdnSelector),
}

/// Matches identities by label, optionally only within a set of namespaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LabelSelector {
    selector: Selector,

    /// Sorted and deduplicated. Empty when any namespace is allowed.
    namespaces: Vec<String>,
}

/// The identities a selector added and removed at a version.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Delta {
    pub added: Vec<NumericIdentity>,
    pub deleted: Vec<NumericIdentity>,
}

// === impl SelectorSource ===

impl SelectorSource {
    pub(crate) fn label(selector: Selector, namespaces: impl IntoIterator<Item = String>) -> Self {
        let mut namespaces = namespaces
            .into_iter()
            .filter(|ns| !ns.is_empty())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        Self::Label(LabelSelector {
            selector,
            namespaces,
        })
    }

    /// The cache key. Sources that select the same identities have the same key.
    pub(crate) fn key(&self) -> String {
        match self {
            Self::Label(LabelSelector {
                selector,
                namespaces,
            }) if namespaces.is_empty() => selector.to_string(),
            Self::Label(LabelSelector {
                selector,
                namespaces,
            }) => {
                let namespaces = namespaces
                    .iter()
                    .map(|ns| format!("{ns:?}"))
                    .collect::<Vec<_>>();
                format!("{selector} in namespaces [{}]", namespaces.join(", "))
            }
            Self::Fqdn(fqdn) => fqdn.to_string(),
        }
    }

    pub(crate) fn matches(&self, identity: &Identity) -> bool {
        match self {
            Self::Label(l) => {
                l.matches_namespace(&identity.namespace) && l.selector.matches(&identity.labels)
            }
            Self::Fqdn(f) => identity.labels.intersects(&f.identity_label()),
        }
    }

    /// Matches labels regardless of namespace. Slow; only used for policy tracing.
    fn matches_labels(&self, labels: &Labels) -> bool {
        match self {
            Self::Label(l) => l.selector.matches(labels),
            Self::Fqdn(f) => labels.intersects(&f.identity_label()),
        }
    }

    /// Releases any interest registered on behalf of the selector.
    pub(crate) fn remove(&self, notifier: Option<&dyn IdentityNotifier>) {
        if let (Self::Fqdn(f), Some(notifier)) = (self, notifier) {
            notifier.unregister_fqdn_selector(f);
        }
    }
}

// === impl LabelSelector ===

impl LabelSelector {
    fn matches_namespace(&self, ns: &str) -> bool {
        if self.namespaces.is_empty() {
            return true;
        }
        // A namespace is required.
        !ns.is_empty() && self.namespaces.binary_search_by(|n| n.as_str().cmp(ns)).is_ok()
    }
}

// === impl CachedSelector ===

impl CachedSelector {
    pub(crate) fn new(source: SelectorSource, metadata_labels: Labels) -> Self {
        Self(Arc::new(IdentitySelector {
            key: source.key(),
            source,
            selections: Value::new(),
            metadata_labels,
            state: Mutex::new(State::default()),
        }))
    }

    /// Returns the identities selected at `version`.
    ///
    /// The selections may be updated concurrently, in which case either the old or the new
    /// selections are returned; a user that gets the old selections is guaranteed to be
    /// notified of the update. An invalid handle selects nothing.
    pub fn selections(&self, version: &VersionHandle) -> Selections {
        match self.try_selections(version) {
            Ok(selections) => selections,
            Err(error) => {
                error!(
                    selector = %self.0.key,
                    %version,
                    %error,
                    backtrace = %Backtrace::force_capture(),
                    "Invalid version handle finds nothing"
                );
                Selections::default()
            }
        }
    }

    /// Like [`CachedSelector::selections`], but surfaces an invalid handle as an error
    /// rather than an empty selection.
    pub fn try_selections(&self, version: &VersionHandle) -> Result<Selections, versioned::Error> {
        Ok(self.0.selections.at(version)?.unwrap_or_default())
    }

    /// Returns true if the selector selects `id` at `version`.
    pub fn selects(&self, version: &VersionHandle, id: NumericIdentity) -> bool {
        if self.is_wildcard() {
            return true;
        }
        self.selections(version).binary_search(&id).is_ok()
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.key == WILDCARD_SELECTOR_KEY
    }

    pub fn is_none(&self) -> bool {
        self.0.key == NONE_SELECTOR_KEY
    }

    /// Labels describing the policy context that created the selector.
    pub fn metadata_labels(&self) -> &Labels {
        &self.0.metadata_labels
    }

    pub fn key(&self) -> &str {
        &self.0.key
    }

    /// Returns true if the selector matches `labels`, ignoring namespace restrictions.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        !self.is_none() && self.0.source.matches_labels(labels)
    }

    pub fn num_users(&self) -> usize {
        self.0.state.lock().users.len()
    }

    pub(crate) fn source(&self) -> &SelectorSource {
        &self.0.source
    }

    /// Returns true if the user was not already subscribed.
    pub(crate) fn add_user(&self, user: &Subscriber) -> bool {
        self.0.state.lock().users.insert(user.clone())
    }

    /// Returns true if `user` was the selector's last user.
    pub(crate) fn remove_user(&self, user: &Subscriber) -> bool {
        let mut state = self.0.state.lock();
        state.users.remove(user) && state.users.is_empty()
    }

    pub(crate) fn users(&self) -> Vec<Subscriber> {
        self.0.state.lock().users.iter().cloned().collect()
    }

    /// Populates a new selector's selections from every known identity.
    pub(crate) fn seed<'i>(
        &self,
        identities: impl IntoIterator<Item = &'i Identity>,
        tx: &Tx,
    ) -> Result<(), versioned::Error> {
        let mut state = self.0.state.lock();
        state.cached = identities
            .into_iter()
            .filter(|id| self.0.source.matches(id))
            .map(|id| id.id)
            .collect();
        self.commit(&state.cached, tx)
    }

    /// Updates the cached selections for added and deleted identities, committing the
    /// new selections at `tx`. An added identity that no longer matches (because its labels
    /// changed) is deleted. `added` must not repeat an id, and `added` and `deleted` must be
    /// disjoint.
    ///
    /// Returns `None` if the selections are unchanged.
    pub(crate) fn update(
        &self,
        added: &[Identity],
        deleted: &[NumericIdentity],
        tx: &Tx,
    ) -> Option<(Delta, Result<(), versioned::Error>)> {
        let mut state = self.0.state.lock();
        let mut delta = Delta::default();
        for identity in added {
            let matches = self.0.source.matches(identity);
            if matches && state.cached.insert(identity.id) {
                delta.added.push(identity.id);
            } else if !matches && state.cached.remove(&identity.id) {
                delta.deleted.push(identity.id);
            }
        }
        for id in deleted {
            if state.cached.remove(id) {
                delta.deleted.push(*id);
            }
        }

        if delta.added.is_empty() && delta.deleted.is_empty() {
            return None;
        }
        let res = self.commit(&state.cached, tx);
        Some((delta, res))
    }

    fn commit(&self, cached: &HashSet<NumericIdentity>, tx: &Tx) -> Result<(), versioned::Error> {
        if cached.is_empty() {
            return self.0.selections.remove_at(tx);
        }
        // Selections are kept in ascending order.
        let mut selections = cached.iter().copied().collect::<Vec<_>>();
        selections.sort_unstable();
        self.0.selections.set_at(selections, tx)
    }
}

impl PartialEq for CachedSelector {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key
    }
}

impl Eq for CachedSelector {}

impl hash::Hash for CachedSelector {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.key.hash(state)
    }
}

impl PartialOrd for CachedSelector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CachedSelector {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.key.cmp(&other.0.key)
    }
}

impl fmt::Display for CachedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.key)
    }
}

impl fmt::Debug for CachedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CachedSelector").field(&self.0.key).finish()
    }
}

impl Serialize for CachedSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versioned::Coordinator;
    use policy_selector_core::labels::{Expression, Operator};

    fn identity(id: u32, labels: &str) -> Identity {
        Identity::new(NumericIdentity(id), labels.parse().unwrap())
    }

    fn ids(ids: &[u32]) -> Vec<NumericIdentity> {
        ids.iter().copied().map(NumericIdentity).collect()
    }

    #[test]
    fn reserved_keys() {
        assert_eq!(
            SelectorSource::label(Selector::default(), None).key(),
            WILDCARD_SELECTOR_KEY
        );
        assert_eq!(
            SelectorSource::label(Selector::none(), None).key(),
            NONE_SELECTOR_KEY
        );
        assert_ne!(
            SelectorSource::label(Selector::default(), Some("foo".to_string())).key(),
            WILDCARD_SELECTOR_KEY
        );
    }

    #[test]
    fn namespaced_keys_are_canonical() {
        let a = SelectorSource::label(
            Selector::from_iter(Some(("k8s:app", "web"))),
            vec!["b".to_string(), "a".to_string(), "b".to_string()],
        );
        let b = SelectorSource::label(
            Selector::from_iter(Some(Expression::new("k8s:app", Operator::In, ["web"]))),
            vec!["a".to_string(), "b".to_string()],
        );
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), r#"{k8s:app in ("web")} in namespaces ["a", "b"]"#);

        let joined = SelectorSource::label(
            Selector::from_iter(Some(("k8s:app", "web"))),
            Some("a, b".to_string()),
        );
        assert_ne!(a.key(), joined.key());
    }

    #[test]
    fn label_source_matches_namespace() {
        let src = SelectorSource::label(Selector::default(), Some("foo".to_string()));
        assert!(src.matches(&identity(1, "k8s:io.kubernetes.pod.namespace=foo")));
        assert!(!src.matches(&identity(2, "k8s:io.kubernetes.pod.namespace=bar")));
        assert!(!src.matches(&identity(3, "cidr:10.0.0.0/8")));

        let src = SelectorSource::label(Selector::from_iter(Some(("k8s:app", "web"))), None);
        assert!(src.matches(&identity(1, "k8s:app=web,k8s:io.kubernetes.pod.namespace=foo")));
        assert!(!src.matches(&identity(1, "k8s:app=db")));
    }

    #[test]
    fn fqdn_source_matches_identity_label() {
        let src = SelectorSource::Fqdn(FqdnSelector::pattern("*.example.com"));
        assert!(src.matches(&identity(16777217, "fqdn:*.example.com,cidr:192.0.2.1/32")));
        assert!(!src.matches(&identity(16777218, "fqdn:api.example.com")));
    }

    #[test]
    fn matches_labels_ignores_namespaces() {
        let labels = "k8s:app=web,k8s:io.kubernetes.pod.namespace=bar"
            .parse::<Labels>()
            .unwrap();

        let scoped = CachedSelector::new(
            SelectorSource::label(
                Selector::from_iter(Some(("k8s:app", "web"))),
                Some("foo".to_string()),
            ),
            Labels::default(),
        );
        assert!(scoped.matches_labels(&labels));

        let none = CachedSelector::new(
            SelectorSource::label(Selector::none(), None),
            Labels::default(),
        );
        assert!(!none.matches_labels(&labels));
    }

    #[test]
    fn update_selections() {
        let coord = Coordinator::new();
        let sel = CachedSelector::new(
            SelectorSource::label(Selector::from_iter(Some(("k8s:app", "web"))), None),
            Labels::default(),
        );

        let tx = coord.prepare_next_version();
        let (delta, res) = sel
            .update(
                &[
                    identity(3, "k8s:app=web"),
                    identity(1, "k8s:app=web"),
                    identity(2, "k8s:app=db"),
                ],
                &[],
                &tx,
            )
            .expect("selections must change");
        res.unwrap();
        tx.commit();
        assert_eq!(delta.added, ids(&[3, 1]));
        assert!(delta.deleted.is_empty());

        let v1 = coord.version_handle();
        assert_eq!(*sel.selections(&v1), ids(&[1, 3]));
        assert!(sel.selects(&v1, NumericIdentity(3)));
        assert!(!sel.selects(&v1, NumericIdentity(2)));

        // Identities that don't change the selection produce no delta.
        let tx = coord.prepare_next_version();
        assert!(sel.update(&[identity(4, "k8s:app=db")], &[], &tx).is_none());

        // A relabeled identity is deselected.
        let (delta, res) = sel
            .update(&[identity(3, "k8s:app=db")], &[NumericIdentity(1)], &tx)
            .expect("selections must change");
        res.unwrap();
        tx.commit();
        assert!(delta.added.is_empty());
        assert_eq!(delta.deleted, ids(&[3, 1]));

        let v2 = coord.version_handle();
        assert!(sel.selections(&v2).is_empty());
        assert_eq!(*sel.selections(&v1), ids(&[1, 3]));
    }

    #[test]
    fn invalid_handle_selects_nothing() {
        let coord = Coordinator::new();
        let sel = CachedSelector::new(
            SelectorSource::label(Selector::default(), None),
            Labels::default(),
        );
        let tx = coord.prepare_next_version();
        sel.seed(&[identity(1, "k8s:app=web")], &tx).unwrap();
        tx.commit();

        let invalid = VersionHandle::invalid();
        assert!(sel.selections(&invalid).is_empty());
        assert_eq!(
            sel.try_selections(&invalid),
            Err(versioned::Error::InvalidHandle)
        );
        // The wildcard selects everything, even through an invalid handle.
        assert!(sel.is_wildcard());
        assert!(sel.selects(&invalid, NumericIdentity(1)));
    }

    #[test]
    fn users_are_counted_once() {
        struct Noop;
        impl crate::CachedSelectionUser for Noop {
            fn identity_selection_updated(
                &self,
                _: &CachedSelector,
                _: &[NumericIdentity],
                _: &[NumericIdentity],
            ) {
            }
            fn identity_selection_commit(&self, _: versioned::Version) {}
        }

        let sel = CachedSelector::new(
            SelectorSource::Fqdn(FqdnSelector::name("example.com")),
            Labels::default(),
        );
        let a = Subscriber::from(Arc::new(Noop));
        let b = Subscriber::from(Arc::new(Noop));
        assert!(sel.add_user(&a));
        assert!(!sel.add_user(&a));
        assert!(sel.add_user(&b));
        assert_eq!(sel.num_users(), 2);

        assert!(!sel.remove_user(&a));
        assert!(!sel.remove_user(&a));
        assert!(sel.remove_user(&b));
        assert_eq!(sel.num_users(), 0);
    }
}
