use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

/// Allocator of the numeric identifiers of the sandbox directories.
///
/// Two sandboxes alive at the same time never share an id. The allocator is an explicit value
/// passed to the call sites; cloning it shares the same pool.
#[derive(Debug, Clone)]
pub struct BoxIdAllocator {
    inner: Arc<BoxIdPool>,
}

#[derive(Debug)]
struct BoxIdPool {
    /// The ids currently leased.
    in_use: Mutex<HashSet<u32>>,
    /// Signalled when an id is released.
    released: Condvar,
    /// Number of ids in the pool.
    capacity: u32,
}

/// A leased box id, released back to the pool on drop.
#[derive(Debug)]
pub struct BoxLease {
    id: u32,
    inner: Arc<BoxIdPool>,
}

impl BoxIdAllocator {
    /// Make a new allocator with the given number of ids.
    pub fn new(capacity: u32) -> BoxIdAllocator {
        assert!(capacity > 0, "The box id pool cannot be empty");
        BoxIdAllocator {
            inner: Arc::new(BoxIdPool {
                in_use: Mutex::new(HashSet::new()),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Lease the smallest free id, blocking until one is available.
    pub fn allocate(&self) -> BoxLease {
        let mut in_use = self.inner.in_use.lock().unwrap();
        loop {
            let free = (0..self.inner.capacity).find(|id| !in_use.contains(id));
            if let Some(id) = free {
                in_use.insert(id);
                return BoxLease {
                    id,
                    inner: self.inner.clone(),
                };
            }
            in_use = self.inner.released.wait(in_use).unwrap();
        }
    }
}

impl BoxLease {
    /// The leased id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        let mut in_use = match self.inner.in_use.lock() {
            Ok(guard) => guard,
            Err(_) => return, // may happen if the thread panicked
        };
        in_use.remove(&self.id);
        self.inner.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_allocate_disjoint() {
        let allocator = BoxIdAllocator::new(4);
        let a = allocator.allocate();
        let b = allocator.allocate();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_release_on_drop() {
        let allocator = BoxIdAllocator::new(1);
        let a = allocator.allocate();
        assert_eq!(a.id(), 0);
        drop(a);
        let b = allocator.allocate();
        assert_eq!(b.id(), 0);
    }

    #[test]
    fn test_blocks_until_released() {
        use std::time::{Duration, Instant};

        let allocator = BoxIdAllocator::new(1);
        let lease = allocator.allocate();
        let other = allocator.clone();
        let thr = std::thread::spawn(move || {
            let start = Instant::now();
            let _lease = other.allocate();
            Instant::now() - start
        });
        std::thread::sleep(Duration::from_millis(200));
        drop(lease);
        let waited = thr.join().unwrap();
        assert!(waited >= Duration::from_millis(100));
    }
}
