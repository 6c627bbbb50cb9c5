//! Outstanding request table keyed by message id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Maps message ids of in-flight requests to the callbacks that resolve them.
///
/// Ids come from a per-session counter starting at 1 and are never reused. An entry is
/// removed by exactly one [`take`](Self::take); a second acknowledgment for the same id
/// finds nothing.
pub struct CorrelationTable<C> {
    last_id: AtomicU64,
    pending: Mutex<HashMap<u64, C>>,
}

impl<C> CorrelationTable<C> {
    pub fn new() -> Self {
        Self {
            last_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next message id.
    pub fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn insert(&self, id: u64, callback: C) {
        if self.pending.lock().insert(id, callback).is_some() {
            log::error!("message id {} registered twice", id);
        }
    }

    /// Remove and return the entry for `id`.
    pub fn take(&self, id: u64) -> Option<C> {
        self.pending.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_strictly_increasing() {
        let table: CorrelationTable<()> = CorrelationTable::new();
        let ids: Vec<u64> = (0..100).map(|_| table.next_id()).collect();
        assert_eq!(ids[0], 1);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ids_stay_unique_across_threads() {
        let table: Arc<CorrelationTable<()>> = Arc::new(CorrelationTable::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || (0..250).map(|_| table.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn entry_is_consumed_once() {
        let table = CorrelationTable::new();
        let id = table.next_id();
        table.insert(id, "cb");
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(id), Some("cb"));
        assert_eq!(table.take(id), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unknown_id_finds_nothing() {
        let table: CorrelationTable<&str> = CorrelationTable::new();
        assert!(table.take(42).is_none());
    }
}
