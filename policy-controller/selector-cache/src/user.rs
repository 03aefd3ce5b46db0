use crate::{selector::CachedSelector, versioned::Version};
use policy_selector_core::NumericIdentity;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Receives updates as the identities selected by its cached selectors change.
///
/// Callbacks run on the cache's dispatcher, never while the cache is locked, so
/// implementations may call back into the cache.
pub trait CachedSelectionUser: Send + Sync {
    /// The identities selected by `selector` changed. An identity never appears in both
    /// `added` and `deleted`.
    fn identity_selection_updated(
        &self,
        selector: &CachedSelector,
        added: &[NumericIdentity],
        deleted: &[NumericIdentity],
    );

    /// Every `identity_selection_updated` call for `version` has been made.
    fn identity_selection_commit(&self, version: Version);
}

/// A registered user of cached selectors.
///
/// Subscribers are compared by an id assigned at construction, so the same subscriber
/// counts once per selector no matter how often it is added.
#[derive(Clone)]
pub struct Subscriber {
    id: u64,
    user: Arc<dyn CachedSelectionUser>,
}

// === impl Subscriber ===

impl Subscriber {
    pub fn new(user: Arc<dyn CachedSelectionUser>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            user,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn user(&self) -> &dyn CachedSelectionUser {
        self.user.as_ref()
    }
}

impl<U: CachedSelectionUser + 'static> From<Arc<U>> for Subscriber {
    fn from(user: Arc<U>) -> Self {
        Self::new(user)
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl Hash for Subscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscriber").field(&self.id).finish()
    }
}
