use std::sync::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::{FileType, Handle};
use crate::storage::{Backend, FileInfo, ListVisitor};

/// Counting semaphore built on Mutex + Condvar.
pub struct Semaphore {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            freed: Condvar::new(),
        }
    }

    /// Block until a permit is available. The permit is released when the
    /// returned guard drops.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.freed.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphoreGuard { sem: self }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.freed.notify_one();
    }
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// Caps concurrent calls into the inner backend, protecting remote
/// connection and request quotas.
pub struct SemaBackend {
    inner: Box<dyn Backend>,
    sem: Semaphore,
}

impl SemaBackend {
    pub fn new(inner: Box<dyn Backend>, connections: usize) -> Self {
        Self {
            inner,
            sem: Semaphore::new(connections),
        }
    }
}

impl Backend for SemaBackend {
    fn create(&self) -> Result<()> {
        let _permit = self.sem.acquire();
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        let _permit = self.sem.acquire();
        self.inner.save(cancel, handle, data)
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let _permit = self.sem.acquire();
        self.inner.load(cancel, handle, length, offset)
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        let _permit = self.sem.acquire();
        self.inner.stat(cancel, handle)
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        let _permit = self.sem.acquire();
        self.inner.remove(cancel, handle)
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        let _permit = self.sem.acquire();
        self.inner.list(cancel, t, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn semaphore_limits_concurrency() {
        let sem = Arc::new(Semaphore::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _permit = sem.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "semaphore cap exceeded");
    }

    #[test]
    fn guard_releases_on_drop() {
        let sem = Semaphore::new(1);
        drop(sem.acquire());
        drop(sem.acquire()); // would deadlock if the first permit leaked
    }
}
