use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    selectors: Gauge,
    identities: Gauge,
    notifications: Family<NotificationLabels, Counter>,
    commit_failures: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NotificationLabels {
    kind: &'static str,
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let selectors = Gauge::default();
        reg.register(
            "selectors",
            "Gauge of the number of selectors in the cache",
            selectors.clone(),
        );

        let identities = Gauge::default();
        reg.register(
            "identities",
            "Gauge of the number of identities known to the cache",
            identities.clone(),
        );

        let notifications = Family::<NotificationLabels, Counter>::default();
        reg.register(
            "notifications",
            "Count of notifications queued for selector users",
            notifications.clone(),
        );

        let commit_failures = Counter::default();
        reg.register(
            "commit_failures",
            "Count of selections that could not be committed",
            commit_failures.clone(),
        );

        Self {
            selectors,
            identities,
            notifications,
            commit_failures,
        }
    }

    pub(crate) fn set_selectors(&self, n: usize) {
        self.selectors.set(n as i64);
    }

    pub(crate) fn set_identities(&self, n: usize) {
        self.identities.set(n as i64);
    }

    pub(crate) fn notification_queued(&self, kind: &'static str) {
        self.notifications
            .get_or_create(&NotificationLabels { kind })
            .inc();
    }

    pub(crate) fn commit_failed(&self) {
        self.commit_failures.inc();
    }
}
