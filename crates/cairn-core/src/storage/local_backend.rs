use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::error::{CairnError, Result};
use crate::id::{FileType, Handle, Id};
use crate::storage::{Backend, FileInfo, ListVisitor};

/// Backend for a repository on the local filesystem, using `std::fs`
/// directly.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize if the path already exists for clearer errors and
        // stable behavior with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    fn resolve(&self, handle: &Handle) -> PathBuf {
        self.root.join(handle.storage_key())
    }

    fn type_dir(&self, t: FileType) -> PathBuf {
        self.root.join(t.dirname())
    }
}

impl Backend for LocalBackend {
    /// Create the repository directory layout, including the 256 data shard
    /// directories.
    fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for t in [
            FileType::Index,
            FileType::Snapshot,
            FileType::Key,
            FileType::Lock,
        ] {
            fs::create_dir_all(self.type_dir(t))?;
        }
        for shard in 0u8..=255 {
            fs::create_dir_all(self.root.join("data").join(hex::encode([shard])))?;
        }
        Ok(())
    }

    fn save(&self, cancel: &CancelToken, handle: &Handle, data: &[u8]) -> Result<()> {
        cancel.check()?;
        let path = self.resolve(handle);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temporary sibling and rename, so readers only ever see
        // the handle fully written or not at all.
        let tmp = path.with_extension(format!("tmp{:08x}", rand::thread_rng().gen::<u32>()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn load(
        &self,
        cancel: &CancelToken,
        handle: &Handle,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let path = self.resolve(handle);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CairnError::NotFound(handle.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if length == 0 {
            let mut buf = Vec::new();
            file.seek(SeekFrom::Start(offset))?;
            file.read_to_end(&mut buf)?;
            return Ok(buf);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(CairnError::InvalidFormat(format!(
                        "short read from {handle}: wanted {length} bytes at {offset}, got {filled}"
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn stat(&self, cancel: &CancelToken, handle: &Handle) -> Result<FileInfo> {
        cancel.check()?;
        let path = self.resolve(handle);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(FileInfo { size: meta.len() }),
            Ok(_) => Err(CairnError::NotFound(handle.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::NotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, cancel: &CancelToken, handle: &Handle) -> Result<()> {
        cancel.check()?;
        match fs::remove_file(self.resolve(handle)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, cancel: &CancelToken, t: FileType, visitor: &mut ListVisitor) -> Result<()> {
        if t == FileType::Config {
            if let Ok(meta) = fs::metadata(self.root.join("config")) {
                visitor(Id([0u8; 32]), meta.len())?;
            }
            return Ok(());
        }

        let dir = self.type_dir(t);
        let mut dirs = vec![dir];
        while let Some(current) = dirs.pop() {
            cancel.check()?;
            let entries = match fs::read_dir(&current) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    dirs.push(entry.path());
                } else if file_type.is_file() {
                    // Skip anything that isn't a full hex id (e.g. leftover
                    // temp files from interrupted saves).
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let Ok(id) = Id::from_hex(name) else { continue };
                    visitor(id, entry.metadata()?.len())?;
                }
            }
        }
        Ok(())
    }
}
