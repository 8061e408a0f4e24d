use std::{
    collections::BTreeMap,
    fs,
    hash::{DefaultHasher, Hash, Hasher},
    path::{Path, PathBuf},
};

use borea_core::{TrackerError, host::Storage};

/// Key-value storage persisted as one JSON object per file, so a session
/// can outlive the process the same way browser storage outlives a page.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the backing file, as closing a tab discards its storage.
    pub fn clear(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn unavailable(&self, key: &str, reason: impl ToString) -> TrackerError {
        TrackerError::StorageUnavailable {
            key: key.to_owned(),
            reason: format!("{}: {}", self.path.display(), reason.to_string()),
        }
    }

    fn load(&self, key: &str) -> borea_core::Result<BTreeMap<String, String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.unavailable(key, e)),
        };
        serde_json::from_str(&raw).map_err(|e| self.unavailable(key, e))
    }

    fn save(&self, key: &str, items: &BTreeMap<String, String>) -> borea_core::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.unavailable(key, e))?;
        }
        let raw = serde_json::to_string_pretty(items)?;
        fs::write(&self.path, raw).map_err(|e| self.unavailable(key, e))
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> borea_core::Result<Option<String>> {
        Ok(self.load(key)?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> borea_core::Result<()> {
        let mut items = self.load(key)?;
        items.insert(key.to_owned(), value.to_owned());
        self.save(key, &items)
    }

    fn remove_item(&self, key: &str) -> borea_core::Result<()> {
        let mut items = self.load(key)?;
        if items.remove(key).is_some() {
            self.save(key, &items)?;
        }
        Ok(())
    }
}

pub fn get_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("borea")
}

fn origin_dir(state_dir: &Path, origin: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    origin.hash(&mut hasher);
    state_dir.join(hasher.finish().to_string())
}

/// Origin-scoped storage, shared by every tab of the origin.
pub fn local_storage_path(state_dir: &Path, origin: &str) -> PathBuf {
    origin_dir(state_dir, origin).join("local.json")
}

/// Tab-scoped storage for one named tab of the origin.
pub fn session_storage_path(state_dir: &Path, origin: &str, tab: &str) -> PathBuf {
    origin_dir(state_dir, origin)
        .join("tabs")
        .join(format!("{tab}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("local.json");

        let storage = FileStorage::open(&path);
        assert_eq!(storage.get_item("userId").unwrap(), None);
        storage.set_item("userId", "alice").unwrap();
        storage.set_item("lastActivityTime", "2024-01-01T00:00:00Z").unwrap();

        let reopened = FileStorage::open(&path);
        assert_eq!(reopened.get_item("userId").unwrap().as_deref(), Some("alice"));

        reopened.remove_item("userId").unwrap();
        assert_eq!(storage.get_item("userId").unwrap(), None);
        assert!(storage.get_item("lastActivityTime").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tab.json");
        fs::write(&path, "not json").unwrap();

        let err = FileStorage::open(&path).get_item("metadata").unwrap_err();
        assert!(matches!(err, TrackerError::StorageUnavailable { ref key, .. } if key == "metadata"));
    }

    #[test]
    fn test_clear_discards_tab() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("tab.json"));
        storage.set_item("metadata", "{}").unwrap();

        storage.clear().unwrap();
        storage.clear().unwrap();

        assert!(!storage.path().exists());
        assert_eq!(storage.get_item("metadata").unwrap(), None);
    }

    #[test]
    fn test_paths_are_scoped_by_origin_and_tab() {
        let state = Path::new("/state");
        let shop = local_storage_path(state, "https://shop.example");
        let docs = local_storage_path(state, "https://docs.example");
        assert_ne!(shop, docs);

        let tab = session_storage_path(state, "https://shop.example", "a");
        assert_eq!(shop.parent(), tab.parent().and_then(Path::parent));
        assert_ne!(
            session_storage_path(state, "https://shop.example", "a"),
            session_storage_path(state, "https://shop.example", "b")
        );
    }
}
