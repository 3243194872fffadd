use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::{FileType, Handle};
use crate::storage::{Backend, FileInfo, ListVisitor};

/// Token bucket throttling a byte stream to an average rate.
///
/// The balance may go negative (a large write is never split), in which case
/// the caller sleeps off the debt before proceeding. Burst capacity is one
/// second's worth of tokens.
struct Bucket {
    rate: u64, // bytes per second
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    last: Instant,
}

impl Bucket {
    fn new(rate: u64) -> Self {
        Self {
            rate: rate.max(1),
            state: Mutex::new(BucketState {
                available: rate.max(1) as f64,
                last: Instant::now(),
            }),
        }
    }

    fn take(&self, n: usize) {
        if n == 0 {
            return;
        }
        let debt = {
            let mut st = self.state.lock().unwrap();
            let now = Instant::now();
            let refill = now.duration_since(st.last).as_secs_f64() * self.rate as f64;
            st.available = (st.available + refill).min(self.rate as f64);
            st.last = now;
            st.available -= n as f64;
            -st.available
        };
        if debt > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(debt / self.rate as f64));
        }
    }
}

/// Applies token-bucket rate limits to the bytes flowing through `save`
/// (upload) and `load` (download). The two directions have independent
/// buckets.
pub struct LimiterBackend {
    inner: Box<dyn Backend>,
    upload: Option<Bucket>,
    download: Option<Bucket>,
}

impl LimiterBackend {
    /// Rates are in bytes per second; `None` leaves a direction unlimited.
    pub fn new(inner: Box<dyn Backend>, limit_upload: Option<u64>, limit_download: Option<u64>) -> Self {
        Self {
            inner,
            upload: limit_upload.map(Bucket::new),
            download: limit_download.map(Bucket::new),
        }
    }
}

impl Backend for LimiterBackend {
    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        if let Some(bucket) = &self.upload {
            bucket.take(data.len());
        }
        self.inner.save(cancel, handle, data)
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let data = self.inner.load(cancel, handle, length, offset)?;
        if let Some(bucket) = &self.download {
            bucket.take(data.len());
        }
        Ok(data)
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        self.inner.stat(cancel, handle)
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        self.inner.remove(cancel, handle)
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        self.inner.list(cancel, t, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::testutil::MemoryBackend;

    #[test]
    fn bucket_enforces_average_rate() {
        // 1 MiB/s with a 1 MiB burst: 3 MiB total must take about 2 seconds.
        let bucket = Bucket::new(1024 * 1024);
        let start = Instant::now();
        for _ in 0..3 {
            bucket.take(1024 * 1024);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1800), "took {elapsed:?}");
    }

    #[test]
    fn unlimited_directions_pass_through() {
        let backend = LimiterBackend::new(Box::new(MemoryBackend::new()), None, None);
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"p"));
        backend.save(&cancel, &handle, &[0u8; 4096]).unwrap();
        assert_eq!(backend.load(&cancel, &handle, 0, 0).unwrap().len(), 4096);
    }

    #[test]
    fn upload_limit_delays_large_saves() {
        // 64 KiB/s with a 64 KiB burst: a 128 KiB save incurs ~1s of debt.
        let backend =
            LimiterBackend::new(Box::new(MemoryBackend::new()), Some(64 * 1024), None);
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"p"));
        let start = Instant::now();
        backend.save(&cancel, &handle, &[0u8; 128 * 1024]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(800));
    }
}
