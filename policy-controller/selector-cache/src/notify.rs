use crate::{
    metrics::CacheMetrics, selector::CachedSelector, user::Subscriber, versioned::Version,
};
use policy_selector_core::NumericIdentity;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Queues notifications for delivery by a [`Dispatcher`].
///
/// Notifications are delivered in the order they are queued. The cache queues them while
/// holding its write lock, so every update for a version precedes its commit and commits
/// are delivered in version order.
#[derive(Clone, Debug)]
pub(crate) struct Queue {
    tx: mpsc::UnboundedSender<Notification>,
    backlog: Arc<AtomicUsize>,
    backlog_warn: usize,
    metrics: CacheMetrics,
}

/// Delivers selection notifications to users.
///
/// The dispatcher never holds the cache's lock, so users may call back into the cache from
/// their callbacks.
#[derive(Debug)]
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Notification>,
    backlog: Arc<AtomicUsize>,
}

#[derive(Debug)]
enum Notification {
    Updated {
        user: Subscriber,
        selector: CachedSelector,
        added: Arc<[NumericIdentity]>,
        deleted: Arc<[NumericIdentity]>,
    },
    Commit {
        user: Subscriber,
        version: Version,
    },
}

pub(crate) fn channel(backlog_warn: usize, metrics: CacheMetrics) -> (Queue, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    let q = Queue {
        tx,
        backlog: backlog.clone(),
        backlog_warn,
        metrics,
    };
    (q, Dispatcher { rx, backlog })
}

// === impl Queue ===

impl Queue {
    pub(crate) fn updated(
        &self,
        user: Subscriber,
        selector: CachedSelector,
        added: Arc<[NumericIdentity]>,
        deleted: Arc<[NumericIdentity]>,
    ) {
        self.metrics.notification_queued("update");
        self.push(Notification::Updated {
            user,
            selector,
            added,
            deleted,
        })
    }

    pub(crate) fn commit(&self, user: Subscriber, version: Version) {
        self.metrics.notification_queued("commit");
        self.push(Notification::Commit { user, version })
    }

    fn push(&self, n: Notification) {
        // Counted before sending so the dispatcher never observes a negative backlog.
        let backlog = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(n).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            debug!("Dispatcher dropped; discarding notification");
            return;
        }
        if backlog == self.backlog_warn + 1 {
            warn!(
                backlog,
                "Selection notifications are not being delivered quickly enough"
            );
        }
    }
}

// === impl Dispatcher ===

impl Dispatcher {
    /// Delivers notifications until every handle to the cache has been dropped.
    pub async fn run(mut self) {
        while let Some(n) = self.rx.recv().await {
            self.deliver(n);
        }
        debug!("Selector cache dropped; dispatcher stopping");
    }

    /// Delivers every queued notification without waiting for more, returning how many
    /// were delivered.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(n) = self.rx.try_recv() {
            self.deliver(n);
            delivered += 1;
        }
        delivered
    }

    /// The number of notifications waiting to be delivered.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    fn deliver(&self, n: Notification) {
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        match n {
            Notification::Updated {
                user,
                selector,
                added,
                deleted,
            } => {
                trace!(user = user.id(), %selector, ?added, ?deleted, "Selection updated");
                user.user()
                    .identity_selection_updated(&selector, &added, &deleted);
            }
            Notification::Commit { user, version } => {
                trace!(user = user.id(), version, "Selections committed");
                user.user().identity_selection_commit(version);
            }
        }
    }
}
