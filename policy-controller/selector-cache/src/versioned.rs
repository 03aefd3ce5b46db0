//! Versioned values.
//!
//! A [`Coordinator`] hands out monotonically increasing versions. Writers prepare a [`Tx`],
//! store new values at its version with [`Value::set_at`], and then [`Tx::commit`] it so
//! that new readers observe it. Readers pin a version with a [`VersionHandle`] and read
//! every value at that version, getting a coherent view even while writers move ahead.
//!
//! Values keep only the history that a live handle may still read: on each write, entries
//! older than the oldest pinned version are pruned (keeping the newest entry at or before
//! it).

use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, fmt, sync::Arc};

pub type Version = u64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid version handle")]
    InvalidHandle,

    #[error("version {version} is not newer than stored version {latest}")]
    NotNewer { version: Version, latest: Version },
}

#[derive(Clone, Debug, Default)]
pub struct Coordinator(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    /// The latest committed version.
    latest: Version,

    /// The latest prepared version.
    prepared: Version,

    /// Counts of live handles by version.
    pinned: BTreeMap<Version, usize>,
}

/// Pins a version for reading. Dropping (or closing) the handle releases the pin.
pub struct VersionHandle {
    version: Version,
    coordinator: Option<Coordinator>,
}

/// A version being prepared by a writer.
#[derive(Debug)]
pub struct Tx {
    version: Version,
    oldest: Version,
    coordinator: Coordinator,
}

#[derive(Debug, Default)]
pub struct Value<T> {
    /// Ordered by ascending version.
    entries: RwLock<Vec<Entry<T>>>,
}

#[derive(Debug)]
struct Entry<T> {
    version: Version,
    value: Option<Arc<T>>,
}

// === impl Coordinator ===

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the latest committed version.
    pub fn version_handle(&self) -> VersionHandle {
        let mut state = self.0.lock();
        let version = state.latest;
        *state.pinned.entry(version).or_default() += 1;
        VersionHandle {
            version,
            coordinator: Some(self.clone()),
        }
    }

    pub fn prepare_next_version(&self) -> Tx {
        let mut state = self.0.lock();
        state.prepared = state.prepared.max(state.latest) + 1;
        Tx {
            version: state.prepared,
            oldest: state.oldest(),
            coordinator: self.clone(),
        }
    }

    pub fn latest(&self) -> Version {
        self.0.lock().latest
    }

    /// The oldest version that a live handle may still read.
    pub fn oldest(&self) -> Version {
        self.0.lock().oldest()
    }

    fn pin(&self, version: Version) {
        *self.0.lock().pinned.entry(version).or_default() += 1;
    }

    fn unpin(&self, version: Version) {
        let mut state = self.0.lock();
        if let Some(n) = state.pinned.get_mut(&version) {
            *n -= 1;
            if *n == 0 {
                state.pinned.remove(&version);
            }
        }
    }
}

impl State {
    fn oldest(&self) -> Version {
        self.pinned
            .keys()
            .next()
            .copied()
            .unwrap_or(self.latest)
            .min(self.latest)
    }
}

// === impl VersionHandle ===

impl VersionHandle {
    /// A handle that pins nothing. Reads through it fail.
    pub fn invalid() -> Self {
        Self {
            version: 0,
            coordinator: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_valid(&self) -> bool {
        self.coordinator.is_some()
    }

    /// Releases the pin. The handle is invalid afterwards.
    pub fn close(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.unpin(self.version);
        }
    }
}

impl Clone for VersionHandle {
    fn clone(&self) -> Self {
        if let Some(c) = self.coordinator.as_ref() {
            c.pin(self.version);
        }
        Self {
            version: self.version,
            coordinator: self.coordinator.clone(),
        }
    }
}

impl Drop for VersionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for VersionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionHandle")
            .field("version", &self.version)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl fmt::Display for VersionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "v{}", self.version)
        } else {
            f.write_str("invalid")
        }
    }
}

// === impl Tx ===

impl Tx {
    pub fn version(&self) -> Version {
        self.version
    }

    /// Publishes the version to new readers.
    pub fn commit(self) {
        let mut state = self.coordinator.0.lock();
        state.latest = state.latest.max(self.version);
    }
}

// === impl Value ===

impl<T> Value<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Stores `value` at the transaction's version.
    pub fn set_at(&self, value: T, tx: &Tx) -> Result<(), Error> {
        self.push(Some(Arc::new(value)), tx)
    }

    /// Records that there is no value at the transaction's version.
    pub fn remove_at(&self, tx: &Tx) -> Result<(), Error> {
        self.push(None, tx)
    }

    /// Reads the value at the handle's version. If the handle predates every retained
    /// entry, the oldest retained value is returned.
    pub fn at(&self, handle: &VersionHandle) -> Result<Option<Arc<T>>, Error> {
        if !handle.is_valid() {
            return Err(Error::InvalidHandle);
        }
        let entries = self.entries.read();
        let idx = entries.partition_point(|e| e.version <= handle.version);
        let entry = match idx {
            0 => entries.first(),
            n => entries.get(n - 1),
        };
        Ok(entry.and_then(|e| e.value.clone()))
    }

    /// Reads the most recently stored value, committed or not.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.entries.read().last().and_then(|e| e.value.clone())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn push(&self, value: Option<Arc<T>>, tx: &Tx) -> Result<(), Error> {
        let mut entries = self.entries.write();
        if let Some(last) = entries.last() {
            if last.version >= tx.version {
                return Err(Error::NotNewer {
                    version: tx.version,
                    latest: last.version,
                });
            }
        }
        entries.push(Entry {
            version: tx.version,
            value,
        });

        // Drop everything before the newest entry still visible at the oldest pinned version.
        let visible = entries.partition_point(|e| e.version <= tx.oldest);
        if visible > 1 {
            entries.drain(..visible - 1);
        }
        Ok(())
    }
}
