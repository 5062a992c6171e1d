// src/fs/mock.rs

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};

use super::FileSystem;

/// In-memory filesystem holding only files; directories are implied by the
/// paths stored beneath them. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, e.g. a pipeline definition or an inputs document.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.lock()
            .insert(path.as_ref().to_path_buf(), content.into());
    }

    /// Every stored file path, sorted.
    pub fn files(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let files = self.lock();
        let bytes = files
            .get(path)
            .ok_or_else(|| anyhow!("no such file: {:?}", path))?;
        String::from_utf8(bytes.clone()).map_err(|e| anyhow!("{:?} is not UTF-8: {e}", path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if self.is_dir(path) {
            return Err(anyhow!("cannot overwrite directory {:?}", path));
        }
        self.add_file(path, contents);
        Ok(())
    }

    fn is_file(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.lock()
            .keys()
            .any(|p| p != path && p.starts_with(path))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let files = self.lock();
        let children: BTreeSet<PathBuf> = files
            .keys()
            .filter(|p| *p != path)
            .filter_map(|p| p.strip_prefix(path).ok())
            .filter_map(|rest| rest.components().next())
            .map(|first| path.join(first))
            .collect();
        if children.is_empty() {
            return Err(anyhow!("no such directory: {:?}", path));
        }
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_are_implied_by_their_files() {
        let fs = MockFileSystem::new();
        fs.add_file("/state/run-1.json", "{}");
        fs.add_file("/state/archive/run-0.json", "{}");

        assert!(fs.is_dir(Path::new("/state")));
        assert!(!fs.is_file(Path::new("/state")));
        assert_eq!(
            fs.read_dir(Path::new("/state")).unwrap(),
            vec![PathBuf::from("/state/archive"), PathBuf::from("/state/run-1.json")]
        );
        assert!(fs.read_dir(Path::new("/missing")).is_err());
        assert!(fs.write(Path::new("/state"), b"x").is_err());
    }
}
