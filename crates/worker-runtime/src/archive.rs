//! Cached handles to bundled read-only resource archives.
//!
//! The cache is process-wide but every entry belongs to the thread that opened
//! it. Worker teardown clears its own thread's entries through
//! [`ArchiveCache::clear_archives`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
};

use dashmap::DashMap;

use crate::error::{Error, Result};

/// Teardown hook for thread-scoped archive caches.
pub trait ArchiveCache: Send + Sync + 'static {
    /// Drop every cached archive opened by `thread`. Returns how many were
    /// dropped.
    fn clear_archives(&self, thread: ThreadId) -> usize;
}

impl<T: ArchiveCache + ?Sized> ArchiveCache for Arc<T> {
    fn clear_archives(&self, thread: ThreadId) -> usize {
        (**self).clear_archives(thread)
    }
}

#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    len: u64,
}

impl Archive {
    fn open(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not an archive file: {}", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            len: metadata.len(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
pub struct ArchiveRegistry {
    archives: DashMap<ThreadId, HashMap<PathBuf, Arc<Archive>>>,
}

impl ArchiveRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used when an observer is not given its own.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL_ARCHIVES: OnceLock<Arc<ArchiveRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL_ARCHIVES.get_or_init(|| Arc::new(Self::new())))
    }

    /// Return the calling thread's cached handle for `path`, opening it on miss.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if `path` does not exist or is not a file.
    pub fn get_or_open(&self, path: impl AsRef<Path>) -> Result<Arc<Archive>> {
        let path = std::fs::canonicalize(path.as_ref())?;
        let thread = thread::current().id();

        if let Some(archive) = self
            .archives
            .get(&thread)
            .and_then(|cached| cached.get(&path).cloned())
        {
            return Ok(archive);
        }

        let archive = Arc::new(Archive::open(&path)?);
        Ok(Arc::clone(
            self.archives
                .entry(thread)
                .or_default()
                .entry(path)
                .or_insert(archive),
        ))
    }

    #[must_use]
    pub fn cached(&self, thread: ThreadId) -> usize {
        self.archives.get(&thread).map_or(0, |cached| cached.len())
    }
}

impl ArchiveCache for ArchiveRegistry {
    fn clear_archives(&self, thread: ThreadId) -> usize {
        self.archives
            .remove(&thread)
            .map_or(0, |(_, cached)| cached.len())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn archive_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents).expect("write archive");
        file
    }

    #[test]
    fn get_or_open_caches_per_thread() {
        let registry = ArchiveRegistry::new();
        let file = archive_file(b"archive");

        let first = registry.get_or_open(file.path()).expect("open");
        let second = registry.get_or_open(file.path()).expect("open again");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 7);

        let here = thread::current().id();
        assert_eq!(registry.cached(here), 1);

        let registry = Arc::new(registry);
        let remote = Arc::clone(&registry);
        let path = file.path().to_path_buf();
        let (other, other_archive) = thread::spawn(move || {
            let archive = remote.get_or_open(&path).expect("open on other thread");
            (thread::current().id(), archive)
        })
        .join()
        .expect("other thread");
        assert!(!Arc::ptr_eq(&first, &other_archive));

        assert_eq!(registry.clear_archives(here), 1);
        assert_eq!(registry.cached(here), 0);
        assert_eq!(registry.cached(other), 1);
        assert_eq!(registry.clear_archives(here), 0);
    }

    #[test]
    fn directories_and_missing_paths_are_rejected() {
        let registry = ArchiveRegistry::new();
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(matches!(registry.get_or_open(dir.path()), Err(Error::Io(_))));
        assert!(matches!(
            registry.get_or_open(dir.path().join("missing.asar")),
            Err(Error::Io(_))
        ));
    }
}
