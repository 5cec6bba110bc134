//! Byte-level storage keyed by path strings. Snapshots and saved variable
//! files go through this seam, so the engine never touches the filesystem
//! directly.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{CheckError, CheckResult};

pub trait Persistence: Send + Sync {
    /// `Ok(None)` when nothing is stored at `path`.
    fn read(&self, path: &str) -> CheckResult<Option<Vec<u8>>>;

    fn write(&self, path: &str, contents: &[u8]) -> CheckResult<()>;

    fn exists(&self, path: &str) -> CheckResult<bool>;

    /// Every stored path under `dir`, recursively, sorted.
    fn list(&self, dir: &str) -> CheckResult<Vec<String>>;

    /// Deleting a missing path is not an error.
    fn delete(&self, path: &str) -> CheckResult<()>;
}

/// Plain files on disk. Parent directories are created on write.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsPersistence;

impl FsPersistence {
    pub fn new() -> Self {
        Self
    }
}

impl Persistence for FsPersistence {
    fn read(&self, path: &str) -> CheckResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CheckError::persistence(path, err)),
        }
    }

    fn write(&self, path: &str, contents: &[u8]) -> CheckResult<()> {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| CheckError::persistence(path, err))?;
        }
        fs::write(path, contents).map_err(|err| CheckError::persistence(path, err))
    }

    fn exists(&self, path: &str) -> CheckResult<bool> {
        Path::new(path)
            .try_exists()
            .map_err(|err| CheckError::persistence(path, err))
    }

    fn list(&self, dir: &str) -> CheckResult<Vec<String>> {
        if !Path::new(dir).exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|err| CheckError::persistence(dir, err))?;
            if entry.file_type().is_file() {
                paths.push(entry.path().to_string_lossy().into_owned());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn delete(&self, path: &str) -> CheckResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CheckError::persistence(path, err)),
        }
    }
}

/// In-process map, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub(crate) fn dir_prefix(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

impl Persistence for MemoryPersistence {
    fn read(&self, path: &str) -> CheckResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(path).cloned())
    }

    fn write(&self, path: &str, contents: &[u8]) -> CheckResult<()> {
        self.entries.lock().insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn exists(&self, path: &str) -> CheckResult<bool> {
        Ok(self.entries.lock().contains_key(path))
    }

    fn list(&self, dir: &str) -> CheckResult<Vec<String>> {
        let prefix = dir_prefix(dir);
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &str) -> CheckResult<()> {
        self.entries.lock().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Persistence, root: &str) {
        let a = format!("{root}/col/a.snap.json");
        let b = format!("{root}/col/nested/b.snap.json");

        assert_eq!(store.read(&a).unwrap(), None);
        assert!(!store.exists(&a).unwrap());

        store.write(&a, b"one").unwrap();
        store.write(&b, b"two").unwrap();
        store.write(&a, b"uno").unwrap();

        assert_eq!(store.read(&a).unwrap().as_deref(), Some(&b"uno"[..]));
        assert!(store.exists(&b).unwrap());
        assert_eq!(store.list(root).unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(store.list(&format!("{root}/missing")).unwrap(), Vec::<String>::new());

        store.delete(&a).unwrap();
        store.delete(&a).unwrap();
        assert_eq!(store.list(root).unwrap(), vec![b]);
    }

    #[test]
    fn memory_backend() {
        exercise(&MemoryPersistence::new(), "snaps");
    }

    #[test]
    fn filesystem_backend() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        exercise(&FsPersistence::new(), &root);
    }

    #[test]
    fn memory_list_does_not_match_sibling_prefixes() {
        let store = MemoryPersistence::new();
        store.write("snaps/a", b"1").unwrap();
        store.write("snapshots/b", b"2").unwrap();
        assert_eq!(store.list("snaps/").unwrap(), vec!["snaps/a".to_string()]);
    }
}
