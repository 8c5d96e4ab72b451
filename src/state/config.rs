use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Revisions loaded per build before `more_available` is raised.
    pub max_revisions: usize,
    /// Budget added by each "load more" request.
    pub extend_step: usize,
    /// Rows handled per cooperative work unit.
    pub work_unit_rows: usize,
    /// Lines at or beyond this merge depth start collapsed. `None` disables.
    pub auto_collapse_depth: Option<u32>,
    pub column_search_horizon: usize,
    pub provider_cache_capacity: usize,
    /// Hidden runs shorter than this between two visible revisions are kept
    /// as hollow rows.
    pub min_elided_run: usize,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_revisions: 2000,
            extend_step: 500,
            work_unit_rows: 100,
            auto_collapse_depth: None,
            column_search_horizon: 4,
            provider_cache_capacity: 4096,
            min_elided_run: 2,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("revgraph").join("config.json"))
    }

    /// Loads the user config, falling back to defaults when missing or
    /// unreadable.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                if path.exists() {
                    warn!("Ignoring unreadable config {}: {}", path.display(), e);
                }
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = Self::config_path() {
            self.save_to(&path)?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn with_max_revisions(mut self, max_revisions: usize) -> Self {
        self.max_revisions = max_revisions;
        self
    }

    pub fn with_work_unit_rows(mut self, rows: usize) -> Self {
        self.work_unit_rows = rows;
        self
    }

    pub fn with_auto_collapse_depth(mut self, depth: Option<u32>) -> Self {
        self.auto_collapse_depth = depth;
        self
    }

    pub fn work_unit(&self) -> usize {
        self.work_unit_rows.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_revisions, 2000);
        assert_eq!(config.auto_collapse_depth, None);
        assert_eq!(config.retry.max_delay_ms, 5000);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = EngineConfig::default()
            .with_max_revisions(50)
            .with_auto_collapse_depth(Some(2));
        config.save_to(&path).unwrap();

        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "extend_step": 7 }"#).unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.extend_step, 7);
        assert_eq!(config.max_revisions, 2000);
    }

    #[test]
    fn test_work_unit_is_never_zero() {
        assert_eq!(EngineConfig::default().with_work_unit_rows(0).work_unit(), 1);
    }
}
