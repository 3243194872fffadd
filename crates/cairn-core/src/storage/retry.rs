use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::{FileType, Handle};
use crate::storage::{Backend, FileInfo, ListVisitor};

/// Called before each retry with the operation name, the error, and the delay
/// until the next attempt.
pub type ReportFn = dyn Fn(&str, &crate::error::CairnError, Duration) + Send + Sync;
/// Called once after an operation recovers, with the number of retries it took.
pub type SuccessFn = dyn Fn(&str, u32) + Send + Sync;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Wraps every failing operation in exponential backoff with jitter.
///
/// Idempotent operations (`load`, `stat`, `list`, `remove`) are retried
/// unconditionally on transient errors. `save` is retried only while the
/// handle is not yet visible: a failed upload may still have landed
/// atomically, so a `stat` probe runs before each re-upload.
pub struct RetryBackend {
    inner: Box<dyn Backend>,
    max_attempts: u32,
    base_delay: Duration,
    report: Option<Arc<ReportFn>>,
    success: Option<Arc<SuccessFn>>,
}

impl RetryBackend {
    pub fn new(inner: Box<dyn Backend>, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay: DEFAULT_BASE_DELAY,
            report: None,
            success: None,
        }
    }

    pub fn with_report(mut self, report: Arc<ReportFn>) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_success(mut self, success: Arc<SuccessFn>) -> Self {
        self.success = Some(success);
        self
    }

    /// Shrink the backoff base, mainly so tests don't sleep for real.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn notify_failure(&self, op: &str, err: &crate::error::CairnError, delay: Duration) {
        tracing::warn!("{op} returned error, retrying after {delay:?}: {err}");
        if let Some(report) = &self.report {
            report(op, err, delay);
        }
    }

    fn notify_success(&self, op: &str, retries: u32) {
        if retries > 0 {
            tracing::warn!("{op} operation successful after {retries} retries");
            if let Some(success) = &self.success {
                success(op, retries);
            }
        }
    }

    fn backoff(&self, delay: Duration) -> Duration {
        let jitter = delay.mul_f64(rand::random::<f64>() * 0.5);
        delay + jitter
    }

    fn retry<T>(
        &self,
        cancel: &CancelToken,
        op: &str,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut delay = self.base_delay;
        let mut retries = 0u32;
        loop {
            cancel.check()?;
            match f() {
                Ok(value) => {
                    self.notify_success(op, retries);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retries + 1 < self.max_attempts => {
                    self.notify_failure(op, &e, delay);
                    retries += 1;
                    std::thread::sleep(self.backoff(delay));
                    delay = (delay * 2).min(MAX_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Backend for RetryBackend {
    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        let op = format!("save {handle}");
        let mut delay = self.base_delay;
        let mut retries = 0u32;
        loop {
            cancel.check()?;
            match self.inner.save(cancel, handle, data) {
                Ok(()) => {
                    self.notify_success(&op, retries);
                    return Ok(());
                }
                Err(e) if e.is_transient() && retries + 1 < self.max_attempts => {
                    self.notify_failure(&op, &e, delay);
                    retries += 1;
                    std::thread::sleep(self.backoff(delay));
                    delay = (delay * 2).min(MAX_DELAY);

                    // The failed attempt may still have landed atomically.
                    // Only re-upload while the handle is not yet visible.
                    if let Ok(info) = self.inner.stat(cancel, handle) {
                        if info.size == data.len() as u64 {
                            self.notify_success(&op, retries);
                            return Ok(());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        self.retry(cancel, &format!("load {handle}"), || {
            self.inner.load(cancel, handle, length, offset)
        })
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        self.retry(cancel, &format!("stat {handle}"), || {
            self.inner.stat(cancel, handle)
        })
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        self.retry(cancel, &format!("remove {handle}"), || {
            self.inner.remove(cancel, handle)
        })
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        // The visitor may not be re-runnable, so list is retried as a whole
        // only when the failure happened before any callback fired.
        let fired = std::cell::Cell::new(false);
        let mut wrapped = |id, size| {
            fired.set(true);
            visitor(id, size)
        };
        let mut delay = self.base_delay;
        let mut retries = 0u32;
        loop {
            cancel.check()?;
            match self.inner.list(cancel, t, &mut wrapped) {
                Ok(()) => {
                    self.notify_success(&format!("list {t}"), retries);
                    return Ok(());
                }
                Err(e) if e.is_transient() && !fired.get() && retries + 1 < self.max_attempts => {
                    self.notify_failure(&format!("list {t}"), &e, delay);
                    retries += 1;
                    std::thread::sleep(self.backoff(delay));
                    delay = (delay * 2).min(MAX_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CairnError;
    use crate::id::Id;
    use crate::testutil::{FlakyBackend, MemoryBackend};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(inner: Box<dyn Backend>) -> RetryBackend {
        RetryBackend::new(inner, 10).with_base_delay(Duration::from_millis(1))
    }

    #[test]
    fn save_recovers_after_transient_failures() {
        let inner = FlakyBackend::new(MemoryBackend::new(), 3);
        let reports = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));

        let r = Arc::clone(&reports);
        let s = Arc::clone(&successes);
        let backend = fast_retry(Box::new(inner))
            .with_report(Arc::new(move |_, _, _| {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .with_success(Arc::new(move |_, _| {
                s.fetch_add(1, Ordering::SeqCst);
            }));

        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"pack"));
        backend.save(&cancel, &handle, b"payload").unwrap();

        assert_eq!(reports.load(Ordering::SeqCst), 3);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.load(&cancel, &handle, 0, 0).unwrap(), b"payload");
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let backend = fast_retry(Box::new(MemoryBackend::new()));
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Index, Id::hash(b"nope"));
        // NotFound is terminal; a retry loop here would spin pointlessly.
        let err = backend.load(&cancel, &handle, 0, 0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let inner = FlakyBackend::new(MemoryBackend::new(), u32::MAX);
        let backend = RetryBackend::new(Box::new(inner), 3)
            .with_base_delay(Duration::from_millis(1));
        let cancel = CancelToken::new();
        let handle = Handle::new(FileType::Data, Id::hash(b"x"));
        let err = backend.save(&cancel, &handle, b"data").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn canceled_token_stops_retrying() {
        let inner = FlakyBackend::new(MemoryBackend::new(), u32::MAX);
        let backend = fast_retry(Box::new(inner));
        let cancel = CancelToken::new();
        cancel.cancel();
        let handle = Handle::new(FileType::Data, Id::hash(b"x"));
        assert!(matches!(
            backend.save(&cancel, &handle, b"data"),
            Err(CairnError::Canceled)
        ));
    }
}
