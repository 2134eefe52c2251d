//! Striped key-range locks
//!
//! Data-type implementations that need an atomic read-modify-write across a
//! metadata record and its sub-keys take the stripe lock for the key before
//! reading. Writers to different stripes proceed in parallel.

use parking_lot::{Mutex, MutexGuard};

/// Default stripe count used by the storage engine
pub const DEFAULT_LOCK_STRIPES: usize = 16;

pub struct LockManager {
    stripes: Vec<Mutex<()>>,
}

impl LockManager {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Block until the stripe owning `key` is acquired; the stripe is
    /// released when the guard drops.
    pub fn lock(&self, key: &[u8]) -> LockGuard<'_> {
        let index = crc32fast::hash(key) as usize % self.stripes.len();
        LockGuard {
            _guard: self.stripes[index].lock(),
        }
    }
}

pub struct LockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_same_key_is_mutually_exclusive() {
        let mgr = Arc::new(LockManager::new(DEFAULT_LOCK_STRIPES));
        let counter = Arc::new(parking_lot::Mutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = mgr.lock(b"contended");
                    let mut c = counter.lock();
                    *c += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 8000);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mgr = LockManager::new(4);
        {
            let _g = mgr.lock(b"k");
        }
        let _g2 = mgr.lock(b"k");
    }
}
