use std::hash::Hash;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use rustc_hash::FxHashMap;

/// A copy-on-write map with lock-free reads, for read-mostly lookup tables on
///  the hot path (channel lookup by connection and channel id). Updates clone
///  the whole map, so they must stay rare compared to reads - channel binding
///  happens per connection, lookup per packet.
pub struct AtomicMap<K, V> {
    map: AtomicPtr<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        let map = Arc::new(FxHashMap::<K, V>::default());
        let raw = Box::into_raw(Box::new(map));

        AtomicMap {
            map: AtomicPtr::new(raw),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        unsafe {
            (*self.map.load(Ordering::Acquire))
                .get(key)
                .cloned()
        }
    }

    /// a consistent snapshot of the map's current contents
    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        unsafe {
            (*self.map.load(Ordering::Acquire)).clone()
        }
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            let mut map: FxHashMap<K, V> = unsafe { (**old).clone() };
            f(&mut map);
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self.map.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => {
                    unsafe { drop(Box::from_raw(prev)); }
                    return;
                }
                Err(_) => {
                    unsafe { drop(Box::from_raw(new)); }
                }
            }
        }
    }
}

impl<K, V> Drop for AtomicMap<K, V> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.map.load(Ordering::Acquire);
            drop(Box::from_raw(raw));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert_eq!(None, map.get(&2));
    }

    #[test]
    fn test_snapshot() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| {
            m.insert(1, 2);
            m.insert(3, 4);
        });

        let snapshot = map.snapshot();
        map.update(|m| {
            m.remove(&1);
        });

        assert_eq!(snapshot.len(), 2);
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;

        let map = Arc::new(AtomicMap::<u32, u32>::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    map.update(|m| {
                        m.insert(t * 1000 + i, i);
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.snapshot().len(), 1000);
    }
}
