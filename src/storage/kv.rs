//! Flat key/value persistence backing the profile store.
use crate::core::{ClientError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// All stored keys mapped to their string values.
pub type KeyValues = BTreeMap<String, String>;

/// A load-all / persist-all key/value map.
///
/// `persist` replaces the whole stored map; readers never observe a
/// partially written map.
pub trait KeyValueStore: Send + Sync {
    fn load(&self) -> Result<KeyValues>;
    fn persist(&self, values: &KeyValues) -> Result<()>;
}

/// Keeps the map in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<KeyValues>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: KeyValues) -> Self {
        MemoryStore {
            values: Mutex::new(values),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self) -> Result<KeyValues> {
        self.values
            .lock()
            .map(|values| values.clone())
            .map_err(|_| ClientError::Load("profile map lock poisoned".to_string()))
    }

    fn persist(&self, values: &KeyValues) -> Result<()> {
        let mut stored = self
            .values
            .lock()
            .map_err(|_| ClientError::Save("profile map lock poisoned".to_string()))?;
        *stored = values.clone();
        Ok(())
    }
}

/// Stores the map as a flat TOML table of strings.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl KeyValueStore for FileStore {
    fn load(&self) -> Result<KeyValues> {
        if !self.path.exists() {
            debug!("No profile file at {:?}, starting empty", self.path);
            return Ok(KeyValues::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| ClientError::Load(format!("{}: {}", self.path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Load(format!("{}: {}", self.path.display(), e)))
    }

    fn persist(&self, values: &KeyValues) -> Result<()> {
        let content =
            toml::to_string(values).map_err(|e| ClientError::Save(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Readers see either the old file or the new one, never a partial write.
        let temp = self.temp_path();
        fs::write(&temp, content)?;
        fs::rename(&temp, &self.path)?;
        debug!("Persisted {} keys to {:?}", values.len(), self.path);
        Ok(())
    }
}
