use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Registry of live connections.
///
/// All access goes through one mutex. The live map never leaves this type:
/// callers that need to iterate get a [`snapshot`](Self::snapshot), a
/// point-in-time `Vec` of shared handles they can walk while other threads
/// keep inserting and removing.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    entries: Mutex<HashMap<u64, Arc<S>>>,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionRegistry<S> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<S>>> {
        // Entries are plain handles; a panic elsewhere cannot leave the map half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `entry` under `id`, replacing any previous entry with that id.
    pub fn insert(&self, id: u64, entry: Arc<S>) {
        let mut entries = self.lock();
        entries.insert(id, entry);
        log::trace!("Registry insert {}. Total connections: {}", id, entries.len());
    }

    /// Removes the entry under `id`. No-op when absent.
    pub fn remove(&self, id: u64) -> Option<Arc<S>> {
        let mut entries = self.lock();
        let removed = entries.remove(&id);
        if removed.is_some() {
            log::trace!("Registry remove {}. Total connections: {}", id, entries.len());
        }
        removed
    }

    /// Removes and returns every entry matching `predicate`, atomically.
    pub fn remove_where(&self, mut predicate: impl FnMut(&S) -> bool) -> Vec<Arc<S>> {
        let mut entries = self.lock();
        let ids: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<Arc<S>> {
        self.lock().drain().map(|(_, entry)| entry).collect()
    }

    /// Copies the current entries out of the registry.
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.lock().values().cloned().collect()
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[derive(Debug)]
    struct Entry {
        id: u64,
        open: bool,
    }

    fn entry(id: u64, open: bool) -> Arc<Entry> {
        Arc::new(Entry { id, open })
    }

    #[test]
    fn test_insert_remove_snapshot() {
        let registry = ConnectionRegistry::new();
        registry.insert(1, entry(1, true));
        registry.insert(2, entry(2, true));

        assert_eq!(registry.len(), 2);

        let removed = registry.remove(1).unwrap();
        assert_eq!(removed.id, 1);
        assert!(registry.remove(1).is_none());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, 2);
    }

    #[test]
    fn test_snapshot_is_independent_of_later_mutation() {
        let registry = ConnectionRegistry::new();
        registry.insert(1, entry(1, true));

        let snapshot = registry.snapshot();
        registry.remove(1);
        registry.insert(3, entry(3, true));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, 1);
    }

    #[test]
    fn test_remove_where() {
        let registry = ConnectionRegistry::new();
        registry.insert(1, entry(1, true));
        registry.insert(2, entry(2, false));
        registry.insert(3, entry(3, false));

        let mut reaped: Vec<u64> = registry.remove_where(|e| !e.open).iter().map(|e| e.id).collect();
        reaped.sort_unstable();

        assert_eq!(reaped, vec![2, 3]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_snapshots_see_no_duplicates() {
        let registry = Arc::new(ConnectionRegistry::new());

        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let id = w * 1000 + i;
                        registry.insert(id, entry(id, true));
                        if i % 2 == 0 {
                            registry.remove(id);
                        }
                    }
                })
            })
            .collect();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = registry.snapshot();
                    let unique: HashSet<u64> = snapshot.iter().map(|e| e.id).collect();
                    assert_eq!(unique.len(), snapshot.len());
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(registry.len(), 4 * 250);
    }
}
