use std::sync::{Condvar, Mutex};

use crate::pack::Packer;

/// Bounded pool lending packers to writer tasks.
///
/// Each packer is a small owned workspace: exactly one writer holds it at a
/// time, so blob appends need no further locking. `acquire` blocks while all
/// packers are lent out, which is the repository-level backpressure for
/// writers outrunning uploads.
pub struct PackerPool {
    idle: Mutex<Vec<Packer>>,
    returned: Condvar,
    total: usize,
}

impl PackerPool {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            idle: Mutex::new((0..count).map(|_| Packer::new()).collect()),
            returned: Condvar::new(),
            total: count,
        }
    }

    /// Borrow a packer, blocking until one is available.
    pub fn acquire(&self) -> Packer {
        let mut idle = self.idle.lock().unwrap();
        loop {
            if let Some(packer) = idle.pop() {
                return packer;
            }
            idle = self.returned.wait(idle).unwrap();
        }
    }

    /// Return a borrowed packer.
    pub fn release(&self, packer: Packer) {
        self.idle.lock().unwrap().push(packer);
        self.returned.notify_one();
    }

    /// Wait until every packer is back in the pool, then take the non-empty
    /// ones for finalizing. Fresh packers take their place, so the pool stays
    /// at full strength.
    pub fn drain_pending(&self) -> Vec<Packer> {
        let mut idle = self.idle.lock().unwrap();
        while idle.len() < self.total {
            idle = self.returned.wait(idle).unwrap();
        }
        let mut pending = Vec::new();
        for slot in idle.iter_mut() {
            if !slot.is_empty() {
                pending.push(std::mem::take(slot));
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::id::{BlobType, Id};
    use std::sync::Arc;

    #[test]
    fn lends_at_most_count_packers() {
        let pool = PackerPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();

        let pool = Arc::new(pool);
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire())
        };
        // The third acquire blocks until a packer comes back.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(a);
        let c = waiter.join().unwrap();
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn drain_returns_only_pending_packers() {
        let key = Key::generate();
        let pool = PackerPool::new(3);

        let mut packer = pool.acquire();
        packer.add(BlobType::Data, Id::hash(b"x"), &key.seal(b"x"), None);
        pool.release(packer);

        let pending = pool.drain_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].count(), 1);

        // The pool is back at full strength with empty packers.
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert!(a.is_empty() && b.is_empty() && c.is_empty());
    }
}
