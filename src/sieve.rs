use std::collections::HashSet;
use std::sync::Mutex;

/// Which poller produced a pipeline value. A scheduled job and a stuck job
/// with the same numeric id are different things.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PollKind {
    Scheduled,
    Stuck,
}

pub(crate) type SieveKey = (PollKind, u64);

/// The set of ids currently traversing the pipeline.
///
/// The dedup forwarder inserts on entry; each consumer removes its previous
/// key only after accepting the next one, so an id stays covered for the
/// whole window between executor start and completion. Publishers snapshot
/// the set to build SQL exclusion lists; a stale snapshot costs at most one
/// wasted round-trip because the forwarder gate re-checks on entry.
#[derive(Debug, Default)]
pub(crate) struct Sieve {
    inner: Mutex<HashSet<SieveKey>>,
}

impl Sieve {
    /// Returns false if the key is already in flight.
    pub(crate) fn insert(&self, key: SieveKey) -> bool {
        self.inner.lock().expect("sieve mutex poisoned").insert(key)
    }

    pub(crate) fn remove(&self, key: &SieveKey) {
        self.inner.lock().expect("sieve mutex poisoned").remove(key);
    }

    /// Snapshot of the ids in flight for one poll kind.
    pub(crate) fn ids(&self, kind: PollKind) -> Vec<u64> {
        self.inner
            .lock()
            .expect("sieve mutex poisoned")
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect()
    }
}
