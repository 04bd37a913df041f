//! Shared-ownership handles to opened executables and debug files.

use anyhow::Context;
use chrono::{DateTime, Utc};
use object::Object;
use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// An opened ELF object. Handles are reference counted through `Arc`; a
/// clone keeps the contents alive past the call that produced it.
#[derive(Debug)]
pub struct ObjectFile {
    path: PathBuf,
    build_id: String,
    modtime: DateTime<Utc>,
    size: u64,
    data: Vec<u8>,
    // Debuginfo located for this executable in an earlier cycle.
    debug_file: RwLock<Option<Arc<ObjectFile>>>,
}

impl ObjectFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open object file {}", path.display()))?;
        Self::from_file(file, path)
    }

    /// Builds a handle from an already opened file, e.g. an unlinked temp
    /// file whose lifetime is tied to the descriptor. The contents are read
    /// before the descriptor is released.
    pub fn from_file(mut file: fs::File, path: &Path) -> anyhow::Result<Self> {
        let meta = file
            .metadata()
            .with_context(|| format!("failed to stat object file {}", path.display()))?;
        file.rewind()?;
        let mut data = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut data)
            .with_context(|| format!("failed to read object file {}", path.display()))?;

        let obj = object::File::parse(data.as_slice())
            .with_context(|| format!("failed to parse object file {}", path.display()))?;
        let build_id = match obj.build_id() {
            Ok(Some(id)) => hex_string(id),
            Ok(None) | Err(_) => String::new(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            build_id,
            modtime: meta.modified().map(DateTime::from).unwrap_or_default(),
            size: meta.len(),
            data,
            debug_file: RwLock::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_testing(build_id: &str, data: Vec<u8>) -> Self {
        Self {
            path: PathBuf::from(format!("/proc/{build_id}/exe")),
            build_id: build_id.to_string(),
            modtime: Utc::now(),
            size: data.len() as u64,
            data,
            debug_file: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn modtime(&self) -> DateTime<Utc> {
        self.modtime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Parses the contents into an ELF view.
    pub fn elf(&self) -> anyhow::Result<object::File<'_>> {
        object::File::parse(self.data.as_slice())
            .with_context(|| format!("failed to parse object file {}", self.path.display()))
    }

    pub fn debug_file(&self) -> Option<Arc<ObjectFile>> {
        self.debug_file.read().unwrap().clone()
    }

    pub fn set_debug_file(&self, dbg: Arc<ObjectFile>) {
        *self.debug_file.write().unwrap() = Some(dbg);
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Cache of opened object files keyed by path. Entries are shared; an entry
/// evicted from the cache stays alive for as long as any holder keeps its
/// `Arc`.
pub struct Pool {
    cache: moka::sync::Cache<PathBuf, Arc<ObjectFile>>,
}

impl Pool {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: moka::sync::Cache::new(capacity),
        }
    }

    pub fn open(&self, path: &Path) -> anyhow::Result<Arc<ObjectFile>> {
        if let Some(obj) = self.cache.get(path) {
            return Ok(obj);
        }
        let obj = Arc::new(ObjectFile::open(path)?);
        self.cache.insert(path.to_path_buf(), obj.clone());
        Ok(obj)
    }

    /// Registers a freshly created file, e.g. the output of a debuginfo
    /// extraction, without going through the path cache.
    pub fn new_file(&self, file: fs::File, path: &Path) -> anyhow::Result<Arc<ObjectFile>> {
        Ok(Arc::new(ObjectFile::from_file(file, path)?))
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::minimal_elf;
    use std::io::Write;

    #[test]
    fn open_parses_metadata() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&minimal_elf()).unwrap();
        tmp.flush().unwrap();

        let pool = Pool::default();
        let obj = pool.open(tmp.path()).unwrap();
        assert_eq!(obj.size(), minimal_elf().len() as u64);
        assert!(obj.elf().is_ok());
    }

    #[test]
    fn pool_shares_entries_per_path() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&minimal_elf()).unwrap();
        tmp.flush().unwrap();

        let pool = Pool::default();
        let first = pool.open(tmp.path()).unwrap();
        let second = pool.open(tmp.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn open_rejects_non_elf_contents() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"definitely not an executable").unwrap();
        tmp.flush().unwrap();

        let pool = Pool::default();
        assert!(pool.open(tmp.path()).is_err());
    }
}
