use crate::{
    config::Config,
    metrics::CacheMetrics,
    notify::{self, Dispatcher, Queue},
    selector::{CachedSelector, Selections, SelectorSource},
    slice::CachedSelectorSlice,
    user::Subscriber,
    versioned::{self, Coordinator, Version, VersionHandle},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{bail, Result};
use parking_lot::RwLock;
use policy_selector_core::{
    FqdnSelector, Identity, IdentityNotifier, Labels, NumericIdentity, Selector,
};
use serde::Serialize;
use std::{backtrace::Backtrace, sync::Arc};
use tracing::{debug, error, instrument, warn};

/// Maps selectors to the identities they select.
///
/// Selectors are shared: every user of a semantically identical selector gets the same
/// [`CachedSelector`], whose selections are computed once. Identity updates are applied to
/// every cached selector and the resulting changes are queued for each selector's users,
/// to be delivered by the [`Dispatcher`] returned from [`SelectorCache::new`].
///
/// Handles are cheap to clone and share one cache.
#[derive(Clone)]
pub struct SelectorCache(Arc<Inner>);

struct Inner {
    index: RwLock<Index>,
    versions: Coordinator,
    queue: Queue,
    metrics: CacheMetrics,
    wildcard: CachedSelector,
    none: CachedSelector,
}

struct Index {
    selectors: HashMap<String, CachedSelector>,
    identities: HashMap<NumericIdentity, Identity>,
    notifier: Option<Arc<dyn IdentityNotifier>>,
}

/// Describes a cached selector for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SelectorModel {
    pub selector: String,
    pub users: usize,
    pub identities: Vec<NumericIdentity>,
    pub labels: Labels,
}

// === impl SelectorCache ===

impl SelectorCache {
    pub fn new(config: Config, metrics: CacheMetrics) -> (Self, Dispatcher) {
        let (queue, dispatcher) = notify::channel(config.notify_backlog_warn, metrics.clone());

        let wildcard = CachedSelector::new(
            SelectorSource::label(Selector::default(), None),
            Labels::default(),
        );
        let none = CachedSelector::new(
            SelectorSource::label(Selector::none(), None),
            Labels::default(),
        );
        let selectors = [wildcard.clone(), none.clone()]
            .into_iter()
            .map(|s| (s.key().to_string(), s))
            .collect::<HashMap<_, _>>();
        metrics.set_selectors(selectors.len());

        let inner = Inner {
            index: RwLock::new(Index {
                selectors,
                identities: HashMap::new(),
                notifier: None,
            }),
            versions: Coordinator::new(),
            queue,
            metrics,
            wildcard,
            none,
        };
        (Self(Arc::new(inner)), dispatcher)
    }

    /// Sets the name-resolution subsystem that is told when FQDN selectors are released.
    pub fn set_identity_notifier(&self, notifier: Arc<dyn IdentityNotifier>) {
        self.0.index.write().notifier = Some(notifier);
    }

    /// Pins the latest version of every selector's selections.
    pub fn version_handle(&self) -> VersionHandle {
        self.0.versions.version_handle()
    }

    /// The selector that selects every identity. Its selections are maintained like any
    /// other selector's, so its users are notified as identities come and go.
    pub fn wildcard(&self) -> CachedSelector {
        self.0.wildcard.clone()
    }

    /// The selector that selects nothing.
    pub fn none(&self) -> CachedSelector {
        self.0.none.clone()
    }

    /// Gets or creates the cached selector for a label selector, restricted to
    /// `namespaces` if any are given, and subscribes `user` to it.
    ///
    /// Returns the selector and whether `user` was newly subscribed.
    pub fn add_identity_selector(
        &self,
        user: &Subscriber,
        selector: &Selector,
        namespaces: impl IntoIterator<Item = String>,
        metadata: Labels,
    ) -> (CachedSelector, bool) {
        let source = SelectorSource::label(selector.clone(), namespaces);
        self.add_selector(user, source, metadata)
    }

    /// Gets or creates the cached selector for an FQDN selector and subscribes `user` to
    /// it.
    ///
    /// Returns the selector and whether `user` was newly subscribed.
    pub fn add_fqdn_selector(
        &self,
        user: &Subscriber,
        selector: &FqdnSelector,
        metadata: Labels,
    ) -> (CachedSelector, bool) {
        self.add_selector(user, SelectorSource::Fqdn(selector.clone()), metadata)
    }

    #[instrument(skip(self, user, metadata), fields(user = user.id()))]
    fn add_selector(
        &self,
        user: &Subscriber,
        source: SelectorSource,
        metadata: Labels,
    ) -> (CachedSelector, bool) {
        let key = source.key();
        let mut index = self.0.index.write();
        if let Some(sel) = index.selectors.get(&key) {
            let added = sel.add_user(user);
            debug!(selector = %sel, added, "Found cached selector");
            return (sel.clone(), added);
        }

        // A new selector starts out selecting every matching identity that is already
        // known.
        let sel = CachedSelector::new(source, metadata);
        let tx = self.0.versions.prepare_next_version();
        if let Err(error) = sel.seed(index.identities.values(), &tx) {
            self.commit_failed(&sel, error);
        }
        tx.commit();
        sel.add_user(user);
        index.selectors.insert(key, sel.clone());
        self.0.metrics.set_selectors(index.selectors.len());
        debug!(selector = %sel, "Added selector");
        (sel, true)
    }

    /// Unsubscribes `user` from `selector`. The selector is removed from the cache when
    /// its last user is removed; the wildcard and none selectors are never removed.
    #[instrument(skip(self, user), fields(user = user.id()))]
    pub fn remove_selector(&self, selector: &CachedSelector, user: &Subscriber) -> Result<()> {
        let mut index = self.0.index.write();
        self.remove_locked(&mut index, selector, user)
    }

    /// Unsubscribes `user` from every selector in `selectors`.
    pub fn remove_selectors(&self, selectors: &CachedSelectorSlice, user: &Subscriber) {
        let mut index = self.0.index.write();
        for sel in selectors {
            if let Err(error) = self.remove_locked(&mut index, sel, user) {
                warn!(user = user.id(), %error, "Failed to remove selector");
            }
        }
    }

    fn remove_locked(
        &self,
        index: &mut Index,
        selector: &CachedSelector,
        user: &Subscriber,
    ) -> Result<()> {
        let sel = match index.selectors.get(selector.key()) {
            Some(sel) => sel.clone(),
            None => bail!("removing non-existent selector {}", selector),
        };

        if !sel.remove_user(user) || sel.is_wildcard() || sel.is_none() {
            return Ok(());
        }

        index.selectors.remove(sel.key());
        sel.source().remove(index.notifier.as_deref());
        self.0.metrics.set_selectors(index.selectors.len());
        debug!(selector = %sel, "Removed selector");
        Ok(())
    }

    /// Adds a single identity. See [`SelectorCache::update_identities`].
    pub fn add_identity(&self, identity: Identity) -> Version {
        self.update_identities(Some(identity), std::iter::empty())
    }

    /// Removes a single identity. See [`SelectorCache::update_identities`].
    pub fn remove_identity(&self, identity: &Identity) -> Version {
        self.update_identities(std::iter::empty(), Some(identity.id))
    }

    /// Applies a batch of identity changes to every cached selector at a single new
    /// version, returning that version.
    ///
    /// For each selector whose selections changed, each of its users is queued an update
    /// with the identities the selector added and deleted; then each such user is queued a
    /// commit for the version. An identity that is both added and deleted is deleted, and
    /// an identity added more than once takes its last snapshot.
    #[instrument(skip_all)]
    pub fn update_identities(
        &self,
        added: impl IntoIterator<Item = Identity>,
        deleted: impl IntoIterator<Item = NumericIdentity>,
    ) -> Version {
        let mut deleted = deleted.into_iter().collect::<Vec<_>>();
        deleted.sort_unstable();
        deleted.dedup();
        let mut added = added
            .into_iter()
            .filter(|id| deleted.binary_search(&id.id).is_err())
            .map(|id| (id.id, id))
            .collect::<HashMap<_, _>>()
            .into_values()
            .collect::<Vec<_>>();
        added.sort_by_key(|id| id.id);

        let mut index = self.0.index.write();
        let tx = self.0.versions.prepare_next_version();
        for id in &deleted {
            index.identities.remove(id);
        }
        for id in &added {
            index.identities.insert(id.id, id.clone());
        }
        debug!(version = tx.version(), added = added.len(), deleted = deleted.len());

        let mut notified = Vec::new();
        let mut seen = HashSet::new();
        for sel in index.selectors.values() {
            if sel.is_none() {
                continue;
            }
            let (delta, res) = match sel.update(&added, &deleted, &tx) {
                Some(update) => update,
                None => continue,
            };
            if let Err(error) = res {
                self.commit_failed(sel, error);
            }
            debug!(
                selector = %sel,
                added = ?delta.added,
                deleted = ?delta.deleted,
                "Selections updated"
            );

            let sel_added = Arc::<[NumericIdentity]>::from(delta.added);
            let sel_deleted = Arc::<[NumericIdentity]>::from(delta.deleted);
            for user in sel.users() {
                if seen.insert(user.clone()) {
                    notified.push(user.clone());
                }
                self.0
                    .queue
                    .updated(user, sel.clone(), sel_added.clone(), sel_deleted.clone());
            }
        }

        let version = tx.version();
        for user in notified {
            self.0.queue.commit(user, version);
        }
        tx.commit();
        self.0.metrics.set_identities(index.identities.len());
        version
    }

    /// The latest selections of the selector with the given key.
    pub fn get_selections(&self, key: &str) -> Option<Selections> {
        let sel = self.0.index.read().selectors.get(key).cloned()?;
        Some(sel.selections(&self.version_handle()))
    }

    /// Describes every cached selector, ordered by key.
    pub fn get_model(&self) -> Vec<SelectorModel> {
        let version = self.version_handle();
        let mut selectors = self
            .0
            .index
            .read()
            .selectors
            .values()
            .cloned()
            .collect::<Vec<_>>();
        selectors.sort();
        selectors
            .into_iter()
            .map(|sel| SelectorModel {
                selector: sel.key().to_string(),
                users: sel.num_users(),
                identities: sel.selections(&version).to_vec(),
                labels: sel.metadata_labels().clone(),
            })
            .collect()
    }

    /// Every known identity, ordered by id.
    pub fn identities(&self) -> Vec<Identity> {
        let mut ids = self
            .0
            .index
            .read()
            .identities
            .values()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort_by_key(|id| id.id);
        ids
    }

    pub fn num_selectors(&self) -> usize {
        self.0.index.read().selectors.len()
    }

    fn commit_failed(&self, sel: &CachedSelector, error: versioned::Error) {
        self.0.metrics.commit_failed();
        error!(
            selector = %sel,
            %error,
            backtrace = %Backtrace::force_capture(),
            "Failed to commit selections"
        );
    }
}

impl std::fmt::Debug for SelectorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorCache")
            .field("selectors", &self.num_selectors())
            .field("version", &self.0.versions.latest())
            .finish()
    }
}
