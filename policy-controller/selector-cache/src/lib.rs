//! Selector cache
//!
//! Policy rules select the workloads they apply to with label and FQDN selectors. The
//! selector cache maps each distinct selector to the numeric identities it currently
//! selects, and keeps that mapping current as identities are allocated and released:
//!
//! - Semantically identical selectors share one [`CachedSelector`] whose selections are
//!   computed once, no matter how many rules use it. Each selector's users are counted;
//!   when the last user is removed the selector is dropped from the cache.
//! - Selections are versioned. A policy computation pins a [`VersionHandle`] and reads
//!   every selector at that version, seeing one coherent snapshot while updates continue.
//! - Identity updates are applied to every selector at a single new version. Each user of a
//!   changed selector is notified of exactly what it added and deleted, followed by a
//!   commit for the version. Notifications are delivered by a [`Dispatcher`] that never
//!   holds the cache's lock, so users may call back into the cache.
//!
//! ```text
//! [ identity source ] -> [ SelectorCache ] -> [ CachedSelector ] -> [ Dispatcher ] -> [ user ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod config;
mod metrics;
mod notify;
mod selector;
mod slice;
mod user;
pub mod versioned;


pub use self::{
    cache::{SelectorCache, SelectorModel},
    config::Config,
    metrics::CacheMetrics,
    notify::Dispatcher,
    selector::{CachedSelector, Selections, NONE_SELECTOR_KEY, WILDCARD_SELECTOR_KEY},
    slice::CachedSelectorSlice,
    user::{CachedSelectionUser, Subscriber},
    versioned::{Version, VersionHandle},
};
pub use policy_selector_core as core;
