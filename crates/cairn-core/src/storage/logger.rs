use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::{FileType, Handle};
use crate::storage::{Backend, FileInfo, ListVisitor};

/// Debug-level tracing of every backend call.
pub struct LoggerBackend {
    inner: Box<dyn Backend>,
}

impl LoggerBackend {
    pub fn new(inner: Box<dyn Backend>) -> Self {
        Self { inner }
    }
}

impl Backend for LoggerBackend {
    fn create(&self) -> Result<()> {
        debug!("create");
        self.inner.create()
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        debug!(%handle, bytes = data.len(), "save");
        self.inner.save(cancel, handle, data)
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        debug!(%handle, length, offset, "load");
        self.inner.load(cancel, handle, length, offset)
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        debug!(%handle, "stat");
        self.inner.stat(cancel, handle)
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        debug!(%handle, "remove");
        self.inner.remove(cancel, handle)
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        debug!(file_type = %t, "list");
        self.inner.list(cancel, t, visitor)
    }
}
