use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long an outstanding request is reported as live. Expiry is
/// advisory: expired entries stop showing up in queries but are not
/// automatically re-requested.
pub const REQUEST_MAX_AGE: Duration = Duration::from_secs(3);

/// Set of outstanding `(piece, block offset)` requests, each stamped at
/// issue time. One instance tracks the global outstanding set; every
/// peer session keeps its own for cancel bookkeeping.
#[derive(Debug)]
pub struct RequestMap {
    entries: Mutex<HashMap<u32, HashMap<u32, Instant>>>,
    max_age: Duration,
}

impl RequestMap {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    pub fn set(&self, piece: u32, offset: u32) {
        let mut entries = self.entries.lock().expect("request map lock poisoned");
        entries.entry(piece).or_default().insert(offset, Instant::now());
    }

    pub fn has(&self, piece: u32, offset: u32) -> bool {
        let entries = self.entries.lock().expect("request map lock poisoned");
        entries
            .get(&piece)
            .and_then(|blocks| blocks.get(&offset))
            .is_some_and(|issued| issued.elapsed() < self.max_age)
    }

    /// Removes the entry, reporting whether a live one was present.
    /// Empty per-piece sub-maps are dropped.
    pub fn delete(&self, piece: u32, offset: u32) -> bool {
        let mut entries = self.entries.lock().expect("request map lock poisoned");
        let Some(blocks) = entries.get_mut(&piece) else {
            return false;
        };
        let removed = blocks
            .remove(&offset)
            .is_some_and(|issued| issued.elapsed() < self.max_age);
        if blocks.is_empty() {
            entries.remove(&piece);
        }
        removed
    }

    /// Snapshot of live entries, offsets ascending. Expired entries are
    /// pruned as a side effect and never reported.
    pub fn pieces(&self) -> HashMap<u32, Vec<u32>> {
        let mut entries = self.entries.lock().expect("request map lock poisoned");
        let mut result = HashMap::new();
        entries.retain(|piece, blocks| {
            blocks.retain(|_, issued| issued.elapsed() < self.max_age);
            if blocks.is_empty() {
                return false;
            }
            let mut offsets: Vec<u32> = blocks.keys().copied().collect();
            offsets.sort_unstable();
            result.insert(*piece, offsets);
            true
        });
        result
    }

    /// Count of live entries across all pieces.
    pub fn len(&self) -> usize {
        self.pieces().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestMap {
    fn default() -> Self {
        Self::new(REQUEST_MAX_AGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_has() {
        let map = RequestMap::default();
        map.set(3, 16384);

        assert!(map.has(3, 16384));
        assert!(!map.has(3, 0));
        assert!(!map.has(4, 16384));
    }

    #[test]
    fn test_delete_removes_entry() {
        let map = RequestMap::default();
        map.set(1, 0);
        map.set(1, 16384);

        assert!(map.delete(1, 0));
        assert!(!map.has(1, 0));
        assert!(map.has(1, 16384));

        assert!(!map.delete(1, 0), "second delete is a no-op");
        assert!(!map.delete(9, 0), "unknown piece is a no-op");
    }

    #[test]
    fn test_pieces_snapshot_sorted() {
        let map = RequestMap::default();
        map.set(2, 32768);
        map.set(2, 0);
        map.set(2, 16384);
        map.set(5, 0);

        let pieces = map.pieces();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[&2], vec![0, 16384, 32768]);
        assert_eq!(pieces[&5], vec![0]);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_expired_entries_not_reported() {
        let map = RequestMap::new(Duration::from_millis(20));
        map.set(0, 0);
        map.set(0, 16384);
        assert!(map.has(0, 0));

        std::thread::sleep(Duration::from_millis(30));

        assert!(!map.has(0, 0));
        assert!(!map.has(0, 16384));
        assert!(map.pieces().is_empty());
        assert_eq!(map.len(), 0);
        assert!(!map.delete(0, 0), "expired entry does not count as live");
    }

    #[test]
    fn test_refresh_restarts_the_clock() {
        let map = RequestMap::new(Duration::from_millis(40));
        map.set(0, 0);
        std::thread::sleep(Duration::from_millis(25));
        map.set(0, 0);
        std::thread::sleep(Duration::from_millis(25));

        assert!(map.has(0, 0), "re-set entry should still be live");
    }
}
