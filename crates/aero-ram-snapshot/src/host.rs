//! Host capabilities the engine consumes: file queries, directory listing and byte-addressed
//! file handles.
//!
//! Everything goes through [`HostSystem`] so callers can inject a deterministic double
//! ([`MemHostSystem`]) instead of touching the real filesystem.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;

/// Byte-addressed storage for one save file. Dropping the backend closes it.
pub trait SnapshotBackend: Send {
    fn len(&mut self) -> Result<u64>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Fill `buf` from `offset`. Reading past the end fails with an
    /// [`io::ErrorKind::UnexpectedEof`] I/O error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make previous writes durable.
    fn flush(&mut self) -> Result<()>;
}

impl<B: SnapshotBackend + ?Sized> SnapshotBackend for Box<B> {
    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

pub trait HostSystem {
    type Backend: SnapshotBackend + 'static;

    fn path_exists(&self, path: &Path) -> bool;

    fn path_file_size(&self, path: &Path) -> Option<u64>;

    /// Returns whether a file was removed.
    fn delete_file(&self, path: &Path) -> bool;

    /// Names of the regular files and directories in `dir`, sorted. `.` and `..` are never
    /// returned; an unreadable directory yields an empty list.
    fn scan_dir_entries(&self, dir: &Path) -> Vec<String>;

    /// Create or truncate `path` for writing.
    fn create_file(&self, path: &Path) -> Result<Self::Backend>;

    /// Open an existing file for reading.
    fn open_file(&self, path: &Path) -> Result<Self::Backend>;
}

/// [`SnapshotBackend`] over a [`std::fs::File`].
#[derive(Debug)]
pub struct StdFileBackend {
    file: File,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl SnapshotBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsHostSystem;

impl HostSystem for OsHostSystem {
    type Backend = StdFileBackend;

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn path_file_size(&self, path: &Path) -> Option<u64> {
        std::fs::metadata(path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    fn delete_file(&self, path: &Path) -> bool {
        std::fs::remove_file(path).is_ok()
    }

    fn scan_dir_entries(&self, dir: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_type()
                    .map(|t| t.is_file() || t.is_dir())
                    .unwrap_or(false)
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    fn create_file(&self, path: &Path) -> Result<Self::Backend> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(StdFileBackend::from_file(file))
    }

    fn open_file(&self, path: &Path) -> Result<Self::Backend> {
        Ok(StdFileBackend::from_file(File::open(path)?))
    }
}

type SharedBytes = Arc<Mutex<Vec<u8>>>;

fn lock(bytes: &SharedBytes) -> MutexGuard<'_, Vec<u8>> {
    bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`SnapshotBackend`]. Clones share the same bytes.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: SharedBytes,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }
}

impl SnapshotBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(lock(&self.data).len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
        lock(&self.data).resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = lock(&self.data);
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(buf.len());
        if end > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file").into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = lock(&self.data);
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Deterministic in-memory [`HostSystem`] for tests and tooling. Clones share the same files.
#[derive(Debug, Default, Clone)]
pub struct MemHostSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, SharedBytes>>>,
}

impl MemHostSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<PathBuf, SharedBytes>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files()
            .get(path.as_ref())
            .map(|bytes| lock(bytes).clone())
    }

    pub fn write(&self, path: impl AsRef<Path>, data: Vec<u8>) {
        self.files()
            .insert(path.as_ref().to_path_buf(), Arc::new(Mutex::new(data)));
    }

    /// Shrink a file in place, keeping handles already opened on it.
    pub fn truncate(&self, path: impl AsRef<Path>, len: usize) -> bool {
        match self.files().get(path.as_ref()) {
            Some(bytes) => {
                lock(bytes).truncate(len);
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the file's bytes in place.
    pub fn modify(&self, path: impl AsRef<Path>, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.files().get(path.as_ref()) {
            Some(bytes) => {
                f(&mut lock(bytes));
                true
            }
            None => false,
        }
    }
}

impl HostSystem for MemHostSystem {
    type Backend = MemBackend;

    fn path_exists(&self, path: &Path) -> bool {
        let files = self.files();
        files.contains_key(path) || files.keys().any(|p| p.starts_with(path))
    }

    fn path_file_size(&self, path: &Path) -> Option<u64> {
        self.files().get(path).map(|bytes| lock(bytes).len() as u64)
    }

    fn delete_file(&self, path: &Path) -> bool {
        self.files().remove(path).is_some()
    }

    fn scan_dir_entries(&self, dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = self
            .files()
            .keys()
            .filter_map(|p| p.strip_prefix(dir).ok())
            .filter_map(|rest| rest.components().next())
            .filter_map(|c| c.as_os_str().to_str().map(str::to_owned))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn create_file(&self, path: &Path) -> Result<Self::Backend> {
        let data: SharedBytes = Arc::default();
        self.files().insert(path.to_path_buf(), data.clone());
        Ok(MemBackend { data })
    }

    fn open_file(&self, path: &Path) -> Result<Self::Backend> {
        let data = self.files().get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })?;
        Ok(MemBackend { data })
    }
}
