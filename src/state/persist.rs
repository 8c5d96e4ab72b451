use crate::graph::LineKey;
use crate::state::error_handling::EngineError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Host-supplied key/value store for collapse flags.
pub trait CollapseStore {
    fn load(&self, key: &LineKey) -> Option<bool>;

    fn store(&mut self, key: &LineKey, collapsed: bool);

    fn flush(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCollapseStore {
    entries: BTreeMap<String, bool>,
}

impl MemoryCollapseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CollapseStore for MemoryCollapseStore {
    fn load(&self, key: &LineKey) -> Option<bool> {
        self.entries.get(&key.storage_key()).copied()
    }

    fn store(&mut self, key: &LineKey, collapsed: bool) {
        self.entries.insert(key.storage_key(), collapsed);
    }
}

/// Collapse flags persisted as a JSON object of `key -> bool`.
#[derive(Debug)]
pub struct JsonCollapseStore {
    path: PathBuf,
    entries: BTreeMap<String, bool>,
    dirty: bool,
}

impl JsonCollapseStore {
    /// `<data dir>/revgraph/collapse.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("revgraph").join("collapse.json"))
    }

    /// Opens the store, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} collapse flags from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CollapseStore for JsonCollapseStore {
    fn load(&self, key: &LineKey) -> Option<bool> {
        self.entries.get(&key.storage_key()).copied()
    }

    fn store(&mut self, key: &LineKey, collapsed: bool) {
        let previous = self.entries.insert(key.storage_key(), collapsed);
        if previous != Some(collapsed) {
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for JsonCollapseStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to save collapse flags to {}: {}", self.path.display(), e);
        }
    }
}
